//! Pool Manager
//!
//! Owns the process table and the finalization queue. Spawns workers,
//! replaces the ones that crash while processing ranges and makes sure only
//! one worker finalizes at a time, in the order their exec loops ended.
//!
//! ```text
//!  spawn ──→ INIT ──bootstrap ok──→ EXEC ──exec done──→ FIN ──finalized──→ STOP
//!              │                      │                   │
//!           crash: fatal        crash: replaced     crash: next in queue
//! ```

use crate::process::{ProcessError, ProcessExit, ProcessGroup, ProcessResult};
use fxhash::FxHashMap;
use rangepool_core::{DEFAULT_DIR_PREFIX, WORKER_LOG_NAME};
use rangepool_ipc::{
    DRAIN_SENTINEL, EnvelopeError, Pid, QueueError, QueueSink, ResultEnvelope, WorkerFunc,
};
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Scheduling state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, bootstrap dispatched
    Init,
    /// Processing event ranges
    Exec,
    /// Exec done, queued for or running finalize
    Fin,
    /// Finalized and released
    Stop,
}

/// Requested pool size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCount {
    /// One worker per available CPU
    Auto,
    /// Exactly this many workers
    Fixed(NonZeroUsize),
}

impl WorkerCount {
    /// Interpret a configured count: -1 means [`WorkerCount::Auto`]
    pub fn from_raw(n: i64) -> Result<Self, PoolError> {
        match n {
            -1 => Ok(Self::Auto),
            n if n > 0 => usize::try_from(n)
                .ok()
                .and_then(NonZeroUsize::new)
                .map(Self::Fixed)
                .ok_or(PoolError::InvalidWorkerCount(n)),
            n => Err(PoolError::InvalidWorkerCount(n)),
        }
    }

    /// Number of workers to start
    pub fn resolve(self) -> usize {
        match self {
            Self::Auto => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            Self::Fixed(n) => n.get(),
        }
    }
}

/// Job-fatal pool failures
#[derive(Debug, Error)]
pub enum PoolError {
    /// Worker count of zero or below -1
    #[error("invalid number of workers: {0}")]
    InvalidWorkerCount(i64),

    /// The top directory is missing or not writable
    #[error("top directory {path} is not usable: {reason}")]
    InvalidTopDir {
        /// Configured directory
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// A process the table does not know exited
    #[error("detected untracked process ID={0}")]
    UntrackedProcess(Pid),

    /// A worker crashed or reported failure during bootstrap
    #[error("worker with process ID={pid} failed at initialization: {reason}")]
    BootstrapFailure {
        /// Failed worker
        pid: Pid,
        /// Exit status or reported error
        reason: String,
    },

    /// A crashed PID could not be reported
    #[error("failed to report crashed PID={pid} to the range service: {source}")]
    FailureReport {
        /// Crashed worker
        pid: Pid,
        /// Queue failure
        source: QueueError,
    },

    /// No replacement could be started for a crashed worker
    #[error("failed to start a replacement for crashed PID={pid}: {source}")]
    ReplacementSpawnFailure {
        /// Crashed worker
        pid: Pid,
        /// Why the replacement failed
        #[source]
        source: Box<PoolError>,
    },

    /// Finalize completed out of queue order
    #[error(
        "finalized PID={finalized} while PID={} was expected",
        .expected.map_or_else(|| "<none>".to_string(), |p| p.to_string())
    )]
    FinalizationProtocolViolation {
        /// Worker that reported finalize
        finalized: Pid,
        /// Head of the finalization queue
        expected: Option<Pid>,
    },

    /// A result arrived from a PID the table does not know
    #[error("result received from PID={0} which is not in the process table")]
    UnknownResultSender(Pid),

    /// A result does not fit the sender's current state
    #[error("unexpected {func} result from PID={pid} in state {state:?}")]
    UnexpectedResult {
        /// Sending worker
        pid: Pid,
        /// Function the envelope names
        func: WorkerFunc,
        /// State the table holds for the worker
        state: WorkerState,
    },

    /// A result payload is not a valid envelope
    #[error("malformed result from PID={pid}: {source}")]
    MalformedResult {
        /// Sending worker
        pid: Pid,
        /// Decode failure
        source: EnvelopeError,
    },

    /// A function could not be sent to a worker
    #[error("problem scheduling {func} on PID={pid}: {source}")]
    Dispatch {
        /// Target worker
        pid: Pid,
        /// Function name, or "release"
        func: &'static str,
        /// Process group failure
        source: ProcessError,
    },

    /// A worker could not be launched
    #[error("unable to start new process: {0}")]
    Spawn(ProcessError),

    /// Waiting on the process group failed
    #[error(transparent)]
    Wait(ProcessError),

    /// A rank could not be queued
    #[error("unable to send rank to the ranks queue: {0}")]
    Rank(QueueError),

    /// The drain sentinel could not be sent
    #[error("failed to release the range service: {0}")]
    Drain(QueueError),
}

/// Final status line of one exited worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Worker PID
    pub pid: Pid,
    /// Exited with status 0
    pub success: bool,
    /// Events reported by its exec loop, if it got that far
    pub processed_events: Option<i32>,
}

impl fmt::Display for WorkerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "*** Process PID={}. Status {}. Number of events processed: ",
            self.pid,
            if self.success { "SUCCESS" } else { "FAILURE" }
        )?;
        match self.processed_events {
            Some(n) => write!(f, "{n}"),
            None => write!(f, "N/A"),
        }
    }
}

/// Coordinator of a worker pool
pub struct PoolManager<G, R, F> {
    group: G,
    ranks: R,
    failures: F,
    table: FxHashMap<Pid, WorkerState>,
    processed: FxHashMap<Pid, i32>,
    fin_queue: VecDeque<Pid>,
    active_workers: usize,
    nprocs: usize,
    topdir: PathBuf,
    dir_prefix: String,
    wait_timeout: Duration,
}

impl<G, R, F> PoolManager<G, R, F>
where
    G: ProcessGroup,
    R: QueueSink<i32>,
    F: QueueSink<Pid>,
{
    /// Manager over `group`. Ranks go to `ranks`, crashed PIDs and the drain
    /// sentinel to `failures`.
    pub fn new(group: G, ranks: R, failures: F) -> Self {
        Self {
            group,
            ranks,
            failures,
            table: FxHashMap::default(),
            processed: FxHashMap::default(),
            fin_queue: VecDeque::new(),
            active_workers: 0,
            nprocs: 0,
            topdir: PathBuf::new(),
            dir_prefix: DEFAULT_DIR_PREFIX.to_string(),
            wait_timeout: Duration::from_millis(100),
        }
    }

    /// Bound on how long one `wait_once` blocks for an exit
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Run directory prefix used by `sub_process_logs`
    pub fn with_dir_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dir_prefix = prefix.into();
        self
    }

    /// Seed ranks `0..n`, spawn `n` workers and bootstrap them all.
    /// Returns the number of workers started.
    pub fn create_pool(&mut self, count: WorkerCount, topdir: &Path) -> Result<usize, PoolError> {
        check_topdir(topdir)?;
        let n = count.resolve();

        for rank in 0..n {
            self.ranks
                .send_basic(rank as i32)
                .map_err(PoolError::Rank)?;
        }
        self.nprocs = n;
        self.active_workers = n;
        self.topdir = topdir.to_path_buf();

        let mut pids = Vec::with_capacity(n);
        for _ in 0..n {
            let pid = self.group.launch_process().map_err(PoolError::Spawn)?;
            self.table.insert(pid, WorkerState::Init);
            pids.push(pid);
        }
        info!("created pool of {} worker processes", n);

        for pid in pids {
            self.dispatch(Some(WorkerFunc::Bootstrap), pid)?;
        }
        Ok(n)
    }

    /// Start one more worker on a fresh rank and bootstrap it
    pub fn start_process(&mut self) -> Result<Pid, PoolError> {
        self.nprocs += 1;
        self.ranks
            .send_basic((self.nprocs - 1) as i32)
            .map_err(PoolError::Rank)?;

        let pid = self.group.launch_process().map_err(PoolError::Spawn)?;
        self.table.insert(pid, WorkerState::Init);
        self.dispatch(Some(WorkerFunc::Bootstrap), pid)?;
        Ok(pid)
    }

    /// One polling step: handle at most one worker exit, then decode at most
    /// one result.
    pub fn wait_once(&mut self) -> Result<(), PoolError> {
        if let Some(exit) = self
            .group
            .wait_once(self.wait_timeout)
            .map_err(PoolError::Wait)?
        {
            self.handle_exit(exit)?;
        }

        if let Some(result) = self.group.pull_one_result().map_err(PoolError::Wait)? {
            self.handle_result(result)?;
        }
        Ok(())
    }

    /// Poll until every worker has left the process table
    pub fn run_until_drained(&mut self) -> Result<(), PoolError> {
        while !self.table.is_empty() {
            self.wait_once()?;
        }
        info!("all workers finished");
        Ok(())
    }

    fn handle_exit(&mut self, exit: ProcessExit) -> Result<(), PoolError> {
        let pid = exit.pid;
        let state = self
            .table
            .remove(&pid)
            .ok_or(PoolError::UntrackedProcess(pid))?;

        if exit.is_success() {
            debug!(pid, "worker exited");
            return self.worker_left();
        }

        match state {
            WorkerState::Init => {
                error!(pid, "worker failed at initialization: {}", exit);
                Err(PoolError::BootstrapFailure {
                    pid,
                    reason: exit.to_string(),
                })
            }
            WorkerState::Exec => {
                warn!(pid, "worker crashed while processing ranges: {}", exit);
                self.failures
                    .send_basic(pid)
                    .map_err(|source| PoolError::FailureReport { pid, source })?;

                let new_pid = self
                    .start_process()
                    .map_err(|e| PoolError::ReplacementSpawnFailure {
                        pid,
                        source: Box::new(e),
                    })?;
                info!(pid, new_pid, "successfully started new process");
                Ok(())
            }
            WorkerState::Fin => {
                warn!(pid, "worker crashed during finalization: {}", exit);
                let was_head = self.fin_queue.front() == Some(&pid);
                self.fin_queue.retain(|p| *p != pid);
                if was_head {
                    self.finalize_head()?;
                }
                self.worker_left()
            }
            WorkerState::Stop => {
                debug!(pid, "finalized worker exited with {}", exit);
                self.worker_left()
            }
        }
    }

    fn handle_result(&mut self, result: ProcessResult) -> Result<(), PoolError> {
        let pid = result.pid;
        let Some(&state) = self.table.get(&pid) else {
            return Err(PoolError::UnknownResultSender(pid));
        };
        let envelope = ResultEnvelope::decode(&result.payload)
            .map_err(|source| PoolError::MalformedResult { pid, source })?;
        debug!(pid, "decoded {} result", envelope.func);

        let expected = match envelope.func {
            WorkerFunc::Bootstrap => Some(WorkerState::Init),
            WorkerFunc::Exec => Some(WorkerState::Exec),
            // checked against the finalization queue below
            WorkerFunc::Finalize => None,
        };
        if expected.is_some_and(|s| s != state) {
            error!(pid, ?state, "unexpected {} result", envelope.func);
            return Err(PoolError::UnexpectedResult {
                pid,
                func: envelope.func,
                state,
            });
        }

        match envelope.func {
            WorkerFunc::Bootstrap => {
                if !envelope.is_success() {
                    error!(pid, "bootstrap reported error code {}", envelope.error_code);
                    return Err(PoolError::BootstrapFailure {
                        pid,
                        reason: format!("bootstrap reported error code {}", envelope.error_code),
                    });
                }
                self.dispatch(Some(WorkerFunc::Exec), pid)?;
                self.table.insert(pid, WorkerState::Exec);
            }
            WorkerFunc::Exec => {
                if !envelope.is_success() {
                    warn!(pid, "exec finished with error code {}", envelope.error_code);
                }
                self.processed.insert(pid, envelope.aux_value);
                let was_empty = self.fin_queue.is_empty();
                self.fin_queue.push_back(pid);
                if was_empty {
                    self.dispatch(Some(WorkerFunc::Finalize), pid)?;
                }
                self.table.insert(pid, WorkerState::Fin);
                info!(pid, processed = envelope.aux_value, "exec done");
            }
            WorkerFunc::Finalize => {
                let head = self.fin_queue.front().copied();
                if head != Some(pid) {
                    error!(pid, expected = ?head, "finalization out of order");
                    return Err(PoolError::FinalizationProtocolViolation {
                        finalized: pid,
                        expected: head,
                    });
                }
                self.dispatch(None, pid)?;
                self.fin_queue.pop_front();
                self.table.insert(pid, WorkerState::Stop);
                info!(pid, "finalized");
                self.finalize_head()?;
            }
        }
        Ok(())
    }

    /// Dispatch finalize on the queue head, if any
    fn finalize_head(&mut self) -> Result<(), PoolError> {
        if let Some(&next) = self.fin_queue.front() {
            self.dispatch(Some(WorkerFunc::Finalize), next)?;
            info!(pid = next, "scheduled finalization");
        }
        Ok(())
    }

    /// A worker left for good. The last one releases the range service.
    fn worker_left(&mut self) -> Result<(), PoolError> {
        self.active_workers = self.active_workers.saturating_sub(1);
        if self.active_workers == 0 {
            self.failures
                .send_basic(DRAIN_SENTINEL)
                .map_err(PoolError::Drain)?;
            info!("no active workers left, range service released");
        }
        Ok(())
    }

    fn dispatch(&mut self, func: Option<WorkerFunc>, pid: Pid) -> Result<(), PoolError> {
        self.group
            .map_async(func, pid)
            .map_err(|source| PoolError::Dispatch {
                pid,
                func: func.map_or("release", WorkerFunc::label),
                source,
            })
    }

    /// Status line for every worker that has exited. Each is also logged.
    pub fn report_statuses(&self) -> Vec<WorkerReport> {
        info!("statuses of event processors");
        self.group
            .statuses()
            .iter()
            .map(|exit| {
                let report = WorkerReport {
                    pid: exit.pid,
                    success: exit.is_success(),
                    processed_events: self.processed.get(&exit.pid).copied(),
                };
                info!("{}", report);
                report
            })
            .collect()
    }

    /// Log file of every rank handed out so far
    pub fn sub_process_logs(&self) -> Vec<PathBuf> {
        (0..self.nprocs)
            .map(|rank| {
                self.topdir
                    .join(format!("{}{}", self.dir_prefix, rank))
                    .join(WORKER_LOG_NAME)
            })
            .collect()
    }

    /// State of `pid`, if tracked
    pub fn state(&self, pid: Pid) -> Option<WorkerState> {
        self.table.get(&pid).copied()
    }

    /// Tracked workers and their states
    pub fn process_table(&self) -> &FxHashMap<Pid, WorkerState> {
        &self.table
    }

    /// Workers waiting for or running finalize, head first
    pub fn finalization_queue(&self) -> &VecDeque<Pid> {
        &self.fin_queue
    }

    /// Events `pid` reported at the end of its exec loop
    pub fn processed_events(&self, pid: Pid) -> Option<i32> {
        self.processed.get(&pid).copied()
    }

    /// Ranks handed out so far, replacements included
    pub fn worker_count(&self) -> usize {
        self.nprocs
    }

    /// Workers that have not yet left for good
    pub fn active_workers(&self) -> usize {
        self.active_workers
    }

    /// The process group
    pub fn group(&self) -> &G {
        &self.group
    }

    /// The process group, mutably
    pub fn group_mut(&mut self) -> &mut G {
        &mut self.group
    }
}

fn check_topdir(topdir: &Path) -> Result<(), PoolError> {
    let invalid = |reason: &str| PoolError::InvalidTopDir {
        path: topdir.to_path_buf(),
        reason: reason.to_string(),
    };
    let meta = std::fs::metadata(topdir).map_err(|e| invalid(&e.to_string()))?;
    if !meta.is_dir() {
        return Err(invalid("not a directory"));
    }
    if meta.permissions().readonly() {
        return Err(invalid("read-only"));
    }
    Ok(())
}
