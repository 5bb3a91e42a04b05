//! In-memory fakes for worker tests

use crate::engine::{EngineError, EventProcessor, EventSource, IoRegistry, SeekError, WorkerEngine};
use crate::lifecycle::RangeConnector;
use rangepool_ipc::{ChannelError, QueueError, QueueSource, RangeTransport};
use std::cell::{Ref, RefCell};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct EngineLog {
    pub restarts: usize,
    pub io_reinits: usize,
    pub seeks: Vec<i64>,
    pub event_numbers: Vec<i64>,
    pub inputs_set: Vec<Vec<String>>,
    pub contexts_released: usize,
    pub ranges_closed: usize,
    pub runs_executed: usize,
    pub stopped: usize,
    pub finalized: usize,
}

#[derive(Debug, Default)]
struct Behaviour {
    events: i64,
    input: Vec<String>,
    fail_restart: bool,
    fail_stop: bool,
    fail_input_switch: bool,
    fail_seek_at: Option<i64>,
    fail_event_number: Option<i64>,
    output_dir: Option<PathBuf>,
    current_range: Option<String>,
}

#[derive(Clone, Default)]
struct Shared {
    log: Rc<RefCell<EngineLog>>,
    behaviour: Rc<RefCell<Behaviour>>,
}

/// Builds fake engines whose calls are recorded in a shared log
#[derive(Default)]
pub struct FakeEngine {
    shared: Shared,
    background: usize,
}

impl FakeEngine {
    pub fn with_events(self, events: i64) -> Self {
        self.shared.behaviour.borrow_mut().events = events;
        self
    }

    pub fn with_input(self, file: &str) -> Self {
        self.shared.behaviour.borrow_mut().input = vec![file.to_string()];
        self
    }

    pub fn with_background(mut self, count: usize) -> Self {
        self.background = count;
        self
    }

    pub fn fail_restart(&self) {
        self.shared.behaviour.borrow_mut().fail_restart = true;
    }

    pub fn fail_stop(&self) {
        self.shared.behaviour.borrow_mut().fail_stop = true;
    }

    pub fn fail_input_switch(&self) {
        self.shared.behaviour.borrow_mut().fail_input_switch = true;
    }

    pub fn fail_seek_at(&self, index: i64) {
        self.shared.behaviour.borrow_mut().fail_seek_at = Some(index);
    }

    pub fn fail_event_number(&self, number: i64) {
        self.shared.behaviour.borrow_mut().fail_event_number = Some(number);
    }

    pub fn write_outputs_to(&self, dir: &Path) {
        self.shared.behaviour.borrow_mut().output_dir = Some(dir.to_path_buf());
    }

    pub fn stop_writing_outputs(&self) {
        self.shared.behaviour.borrow_mut().output_dir = None;
    }

    pub fn log(&self) -> Ref<'_, EngineLog> {
        self.shared.log.borrow()
    }

    pub fn build(&self) -> WorkerEngine {
        let background = (0..self.background)
            .map(|i| {
                Box::new(FakeSource {
                    name: format!("background_{i}"),
                    shared: self.shared.clone(),
                    primary: false,
                }) as Box<dyn EventSource>
            })
            .collect();

        WorkerEngine::new(
            Box::new(FakeSource {
                name: "primary".to_string(),
                shared: self.shared.clone(),
                primary: true,
            }),
            Box::new(FakeProcessor {
                shared: self.shared.clone(),
            }),
        )
        .with_background(background)
        .with_io(Box::new(FakeIo {
            shared: self.shared.clone(),
        }))
    }
}

struct FakeSource {
    name: String,
    shared: Shared,
    primary: bool,
}

impl EventSource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn restart(&mut self) -> Result<(), EngineError> {
        if self.primary && self.shared.behaviour.borrow().fail_restart {
            return Err(EngineError::new(&self.name, "restart refused"));
        }
        self.shared.log.borrow_mut().restarts += 1;
        Ok(())
    }

    fn input_collections(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.shared.behaviour.borrow().input.clone())
    }

    fn set_input_collections(&mut self, files: Vec<String>) -> Result<(), EngineError> {
        let mut behaviour = self.shared.behaviour.borrow_mut();
        if behaviour.fail_input_switch {
            return Err(EngineError::new(&self.name, "no such file"));
        }
        behaviour.input = files.clone();
        self.shared.log.borrow_mut().inputs_set.push(files);
        Ok(())
    }

    fn create_context(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn seek(&mut self, index: i64) -> Result<(), SeekError> {
        let behaviour = self.shared.behaviour.borrow();
        if behaviour.fail_seek_at == Some(index) {
            return Err(SeekError::Failed {
                index,
                reason: "corrupt".to_string(),
            });
        }
        if index >= behaviour.events {
            return Err(SeekError::NotFound(index));
        }
        self.shared.log.borrow_mut().seeks.push(index);
        Ok(())
    }

    fn release_context(&mut self) -> Result<(), EngineError> {
        self.shared.log.borrow_mut().contexts_released += 1;
        Ok(())
    }
}

struct FakeProcessor {
    shared: Shared,
}

impl EventProcessor for FakeProcessor {
    fn begin_range(&mut self, range_id: Option<&str>) {
        let mut behaviour = self.shared.behaviour.borrow_mut();
        match range_id {
            Some(id) => behaviour.current_range = Some(id.to_string()),
            None => {
                self.shared.log.borrow_mut().ranges_closed += 1;
                if let (Some(dir), Some(id)) =
                    (behaviour.output_dir.clone(), behaviour.current_range.take())
                {
                    std::fs::write(dir.join(format!("out.pool.root.{id}")), b"events").unwrap();
                }
            }
        }
    }

    fn next_event(&mut self, event_number: i64) -> Result<(), EngineError> {
        self.shared.log.borrow_mut().event_numbers.push(event_number);
        if self.shared.behaviour.borrow().fail_event_number == Some(event_number) {
            return Err(EngineError::new("processor", "algorithm failed"));
        }
        Ok(())
    }

    fn execute_run(&mut self) -> Result<(), EngineError> {
        self.shared.log.borrow_mut().runs_executed += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        if self.shared.behaviour.borrow().fail_stop {
            return Err(EngineError::new("processor", "stop refused"));
        }
        self.shared.log.borrow_mut().stopped += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), EngineError> {
        self.shared.log.borrow_mut().finalized += 1;
        Ok(())
    }
}

struct FakeIo {
    shared: Shared,
}

impl IoRegistry for FakeIo {
    fn reinitialize(&mut self, _run_dir: &Path) -> Result<(), EngineError> {
        self.shared.log.borrow_mut().io_reinits += 1;
        Ok(())
    }
}

pub struct FakeRanks {
    ranks: RefCell<VecDeque<i32>>,
}

impl FakeRanks {
    pub fn new(ranks: Vec<i32>) -> Self {
        Self {
            ranks: RefCell::new(ranks.into()),
        }
    }
}

impl QueueSource<i32> for FakeRanks {
    fn receive_basic(&self) -> Result<i32, QueueError> {
        self.ranks
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| QueueError::Closed {
                name: "ranks".to_string(),
            })
    }
}

pub type SentLog = Rc<RefCell<Vec<Vec<u8>>>>;

/// Hands out one transport replaying scripted service responses
pub struct FakeConnector {
    responses: VecDeque<Vec<u8>>,
    sent: SentLog,
}

impl FakeConnector {
    pub fn scripted(responses: Vec<Vec<u8>>) -> Self {
        Self {
            responses: responses.into(),
            sent: SentLog::default(),
        }
    }

    pub fn sent_log(&self) -> SentLog {
        Rc::clone(&self.sent)
    }
}

impl RangeConnector for FakeConnector {
    fn connect(&mut self) -> Result<Box<dyn RangeTransport>, ChannelError> {
        Ok(Box::new(FakeTransport {
            responses: std::mem::take(&mut self.responses),
            sent: Rc::clone(&self.sent),
        }))
    }
}

struct FakeTransport {
    responses: VecDeque<Vec<u8>>,
    sent: SentLog,
}

impl RangeTransport for FakeTransport {
    fn send(&mut self, message: &[u8]) -> Result<(), ChannelError> {
        self.sent.borrow_mut().push(message.to_vec());
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, ChannelError> {
        // An exhausted script behaves like the stop sentinel
        Ok(self.responses.pop_front().unwrap_or_else(|| vec![0]))
    }
}
