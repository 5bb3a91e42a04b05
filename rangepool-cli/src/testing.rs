//! In-memory process group and queue for pool tests

use crate::process::{ProcessError, ProcessExit, ProcessGroup, ProcessResult};
use rangepool_ipc::{Pid, QueueError, QueueSink, ResultEnvelope, WorkerFunc};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// Queue that remembers everything sent to it
#[derive(Clone, Default)]
pub struct RecordingQueue {
    items: Rc<RefCell<Vec<i32>>>,
}

impl RecordingQueue {
    pub fn items(&self) -> Vec<i32> {
        self.items.borrow().clone()
    }
}

impl QueueSink<i32> for RecordingQueue {
    fn send_basic(&self, item: i32) -> Result<(), QueueError> {
        self.items.borrow_mut().push(item);
        Ok(())
    }
}

/// Process group whose exits and results are scripted by the test
pub struct FakeGroup {
    next_pid: Pid,
    launched: Vec<Pid>,
    dispatches: Vec<(Pid, Option<WorkerFunc>)>,
    exits: VecDeque<ProcessExit>,
    results: VecDeque<ProcessResult>,
    exited: Vec<ProcessExit>,
    fail_launch: bool,
}

impl Default for FakeGroup {
    fn default() -> Self {
        Self {
            next_pid: 1000,
            launched: Vec::new(),
            dispatches: Vec::new(),
            exits: VecDeque::new(),
            results: VecDeque::new(),
            exited: Vec::new(),
            fail_launch: false,
        }
    }
}

impl FakeGroup {
    pub fn push_result(&mut self, pid: Pid, envelope: ResultEnvelope) {
        self.push_raw(pid, envelope.encode().to_vec());
    }

    pub fn push_raw(&mut self, pid: Pid, payload: Vec<u8>) {
        self.results.push_back(ProcessResult { pid, payload });
    }

    pub fn push_exit(&mut self, exit: ProcessExit) {
        self.exits.push_back(exit);
    }

    pub fn fail_next_launch(&mut self) {
        self.fail_launch = true;
    }

    pub fn launched(&self) -> &[Pid] {
        &self.launched
    }

    pub fn dispatched_to(&self, pid: Pid) -> Vec<Option<WorkerFunc>> {
        self.dispatches
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, func)| *func)
            .collect()
    }

    pub fn last_dispatch(&self, pid: Pid) -> Option<Option<WorkerFunc>> {
        self.dispatched_to(pid).last().copied()
    }

    /// PIDs in the order finalize was dispatched to them
    pub fn finalize_order(&self) -> Vec<Pid> {
        self.dispatches
            .iter()
            .filter(|(_, func)| *func == Some(WorkerFunc::Finalize))
            .map(|(pid, _)| *pid)
            .collect()
    }
}

impl ProcessGroup for FakeGroup {
    fn launch_process(&mut self) -> Result<Pid, ProcessError> {
        if std::mem::take(&mut self.fail_launch) {
            return Err(ProcessError::Spawn(std::io::Error::other("fork failed")));
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        self.launched.push(pid);
        Ok(pid)
    }

    fn map_async(&mut self, func: Option<WorkerFunc>, pid: Pid) -> Result<(), ProcessError> {
        if !self.launched.contains(&pid) {
            return Err(ProcessError::UnknownPid(pid));
        }
        self.dispatches.push((pid, func));
        Ok(())
    }

    fn wait_once(&mut self, _timeout: Duration) -> Result<Option<ProcessExit>, ProcessError> {
        let exit = self.exits.pop_front();
        if let Some(exit) = exit {
            self.exited.push(exit);
        }
        Ok(exit)
    }

    fn pull_one_result(&mut self) -> Result<Option<ProcessResult>, ProcessError> {
        Ok(self.results.pop_front())
    }

    fn statuses(&self) -> &[ProcessExit] {
        &self.exited
    }
}
