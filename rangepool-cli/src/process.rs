//! Worker Process Group
//!
//! The pool manager sees its workers only through [`ProcessGroup`]: launch a
//! process, send it a lifecycle function, wait for exits, pull results.
//! [`UnixProcessGroup`] implements it with real child processes.

use fxhash::FxHashMap;
use rangepool_core::WorkerSettings;
use rangepool_ipc::{
    FrameError, FrameReader, FrameWriter, IPC_FD_ENV, PROTOCOL_VERSION, Pid, RANK_QUEUE_FD_ENV,
    SupervisorCommand, WorkerFunc, WorkerMessage,
};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Flag that switches the executable into worker mode
pub const WORKER_FLAG: &str = "--pool-worker";

/// Errors of the process group
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The worker could not be started
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// Command or message pipe failure
    #[error("IPC error: {0}")]
    Ipc(#[from] FrameError),

    /// The worker sent something unexpected
    #[error("worker protocol error: expected {expected}, got {got}")]
    Protocol {
        /// What the manager waited for
        expected: String,
        /// What arrived
        got: String,
    },

    /// The worker never completed the handshake
    #[error("worker {pid} did not say hello within {timeout:?}")]
    HandshakeTimeout {
        /// Worker PID
        pid: Pid,
        /// Time allowed
        timeout: Duration,
    },

    /// No such worker in the group
    #[error("no worker with PID={0} in the group")]
    UnknownPid(Pid),

    /// Waiting for the workers failed
    #[error("failed to wait on the process group: {0}")]
    Wait(std::io::Error),
}

/// A worker that left the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Worker PID
    pub pid: Pid,
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Terminating signal
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Exit with status 0
    pub fn success(pid: Pid) -> Self {
        Self {
            pid,
            code: Some(0),
            signal: None,
        }
    }

    /// Exit with a non-zero status
    pub fn failure(pid: Pid, code: i32) -> Self {
        Self {
            pid,
            code: Some(code),
            signal: None,
        }
    }

    /// Killed by `signal`
    pub fn signaled(pid: Pid, signal: i32) -> Self {
        Self {
            pid,
            code: None,
            signal: Some(signal),
        }
    }

    fn from_status(pid: Pid, status: ExitStatus) -> Self {
        Self {
            pid,
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Whether the worker exited normally with status 0
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (_, Some(signal)) => write!(f, "killed by signal {signal}"),
            (Some(code), None) => write!(f, "exit code {code}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Completion payload pulled from a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Sending worker
    pub pid: Pid,
    /// Encoded result envelope
    pub payload: Vec<u8>,
}

/// The pool manager's view of its worker processes
pub trait ProcessGroup {
    /// Start one worker. Returns its PID.
    fn launch_process(&mut self) -> Result<Pid, ProcessError>;

    /// Ask `pid` to run `func`; `None` releases the worker, which then exits.
    fn map_async(&mut self, func: Option<WorkerFunc>, pid: Pid) -> Result<(), ProcessError>;

    /// Wait up to `timeout` for one worker to exit
    fn wait_once(&mut self, timeout: Duration) -> Result<Option<ProcessExit>, ProcessError>;

    /// Take one completion payload if any is ready. Never blocks.
    fn pull_one_result(&mut self) -> Result<Option<ProcessResult>, ProcessError>;

    /// Every worker that has exited, in exit order
    fn statuses(&self) -> &[ProcessExit];
}

/// Result of polling for data
#[derive(Debug)]
enum PollResult {
    DataAvailable,
    Timeout,
    PipeClosed,
    Error(std::io::Error),
}

/// Wait for data on a single descriptor
fn wait_for_data(fd: RawFd, timeout_ms: i32) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        PollResult::Error(std::io::Error::last_os_error())
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        // Data first, even if the pipe is closing
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

/// Create a pipe pair, returning (read_fd, write_fd). Both ends are close-on-exec.
fn create_pipe() -> Result<(RawFd, RawFd), std::io::Error> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    for &fd in &fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn send_sigterm(pid: u32) -> Result<(), std::io::Error> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn poll_timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

/// One live worker process
struct WorkerHandle {
    child: Child,
    reader: FrameReader<std::fs::File>,
    writer: FrameWriter<std::fs::File>,
    msg_read_fd: RawFd,
    exit: Option<ExitStatus>,
}

impl WorkerHandle {
    fn pid(&self) -> Pid {
        self.child.id() as Pid
    }

    /// Exit status, reaping the child if it has just exited
    fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait().ok().flatten();
        }
        self.exit
    }

    fn read_result(&mut self) -> Result<Option<ProcessResult>, ProcessError> {
        match self.reader.read::<WorkerMessage>()? {
            WorkerMessage::Result { payload } => Ok(Some(ProcessResult {
                pid: self.pid(),
                payload,
            })),
            WorkerMessage::Hello(_) => {
                warn!(pid = self.pid(), "unexpected second hello");
                Ok(None)
            }
        }
    }

    /// Read every frame left in the pipe of an exited worker
    fn drain_results(&mut self, into: &mut VecDeque<ProcessResult>) {
        loop {
            match self.read_result() {
                Ok(Some(result)) => into.push_back(result),
                Ok(None) => {}
                Err(ProcessError::Ipc(FrameError::EndOfStream)) => break,
                Err(e) => {
                    debug!(pid = self.pid(), "stopped draining results: {}", e);
                    break;
                }
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.poll_exit().is_none() {
            // Graceful: SIGTERM first, brief wait, then SIGKILL
            let _ = send_sigterm(self.child.id());
            std::thread::sleep(Duration::from_millis(50));
            if self.poll_exit().is_none() {
                let _ = self.child.kill();
            }
            let _ = self.child.wait();
        }
    }
}

/// Process group of re-executed worker binaries
pub struct UnixProcessGroup {
    binary: PathBuf,
    args: Vec<OsString>,
    settings: WorkerSettings,
    rank_fd: OwnedFd,
    hello_timeout: Duration,
    workers: FxHashMap<Pid, WorkerHandle>,
    pending: VecDeque<ProcessResult>,
    exited: Vec<ProcessExit>,
}

impl UnixProcessGroup {
    /// Group spawning the current executable in worker mode.
    ///
    /// `rank_fd` is the consuming end of the rank queue; every worker inherits it.
    pub fn new(settings: WorkerSettings, rank_fd: RawFd) -> Result<Self, ProcessError> {
        let binary = std::env::current_exe()?;
        Self::with_binary(binary, vec![OsString::from(WORKER_FLAG)], settings, rank_fd)
    }

    /// Group spawning `binary` with `args`
    pub fn with_binary(
        binary: impl Into<PathBuf>,
        args: Vec<OsString>,
        settings: WorkerSettings,
        rank_fd: RawFd,
    ) -> Result<Self, ProcessError> {
        // Keep our copy clear of the fds 3 and 4 a worker's pipes are moved to
        let dup = unsafe { libc::fcntl(rank_fd, libc::F_DUPFD_CLOEXEC, 10) };
        if dup < 0 {
            return Err(ProcessError::Spawn(std::io::Error::last_os_error()));
        }

        Ok(Self {
            binary: binary.into(),
            args,
            settings,
            rank_fd: unsafe { OwnedFd::from_raw_fd(dup) },
            hello_timeout: Duration::from_secs(30),
            workers: FxHashMap::default(),
            pending: VecDeque::new(),
            exited: Vec::new(),
        })
    }

    /// Extra argument passed to every worker
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// How long a new worker may take to say hello
    pub fn hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Number of live workers
    pub fn live_workers(&self) -> usize {
        self.workers.len()
    }

    fn spawn_worker(&self) -> Result<WorkerHandle, ProcessError> {
        // cmd_pipe: manager writes commands → worker reads from fd 3
        let (cmd_read, cmd_write) = create_pipe()?;
        // msg_pipe: worker writes messages from fd 4 → manager reads
        let (msg_read, msg_write) = match create_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                return Err(ProcessError::Spawn(e));
            }
        };

        let rank_fd = self.rank_fd.as_raw_fd();
        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .envs(self.settings.to_env())
            .env(IPC_FD_ENV, "3,4")
            .env(RANK_QUEUE_FD_ENV, rank_fd.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // In the child: dup cmd_read→3, msg_write→4, let the rank queue through.
        unsafe {
            command.pre_exec(move || {
                if cmd_read != 3 {
                    libc::dup2(cmd_read, 3);
                    libc::close(cmd_read);
                }
                let flags = libc::fcntl(3, libc::F_GETFD);
                libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                if msg_write != 4 {
                    libc::dup2(msg_write, 4);
                    libc::close(msg_write);
                }
                let flags = libc::fcntl(4, libc::F_GETFD);
                libc::fcntl(4, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                let flags = libc::fcntl(rank_fd, libc::F_GETFD);
                libc::fcntl(rank_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);

                // Parent-side ends that leaked into the child
                libc::close(cmd_write);
                libc::close(msg_read);

                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                close_fd(cmd_read);
                close_fd(cmd_write);
                close_fd(msg_read);
                close_fd(msg_write);
                return Err(ProcessError::Spawn(e));
            }
        };

        // Child-side ends are not ours any more
        close_fd(cmd_read);
        close_fd(msg_write);

        let writer_file = unsafe { std::fs::File::from_raw_fd(cmd_write) };
        let reader_file = unsafe { std::fs::File::from_raw_fd(msg_read) };

        let mut handle = WorkerHandle {
            child,
            reader: FrameReader::new(reader_file),
            writer: FrameWriter::new(writer_file),
            msg_read_fd: msg_read,
            exit: None,
        };

        self.wait_for_hello(&mut handle)?;
        Ok(handle)
    }

    /// Wait for the Hello message and validate the protocol version
    fn wait_for_hello(&self, handle: &mut WorkerHandle) -> Result<(), ProcessError> {
        let pid = handle.pid();
        match wait_for_data(handle.msg_read_fd, poll_timeout_ms(self.hello_timeout)) {
            PollResult::DataAvailable => {}
            PollResult::Timeout => {
                return Err(ProcessError::HandshakeTimeout {
                    pid,
                    timeout: self.hello_timeout,
                });
            }
            PollResult::PipeClosed => return Err(ProcessError::Ipc(FrameError::EndOfStream)),
            PollResult::Error(e) => return Err(ProcessError::Spawn(e)),
        }

        match handle.reader.read::<WorkerMessage>()? {
            WorkerMessage::Hello(hello) if hello.protocol_version != PROTOCOL_VERSION => {
                Err(ProcessError::Protocol {
                    expected: format!("protocol version {}", PROTOCOL_VERSION),
                    got: format!("protocol version {}", hello.protocol_version),
                })
            }
            WorkerMessage::Hello(hello) => {
                debug!(pid = hello.pid, "worker said hello");
                Ok(())
            }
            other => Err(ProcessError::Protocol {
                expected: "Hello".to_string(),
                got: format!("{:?}", other),
            }),
        }
    }

    /// Remove the first worker that has exited, keeping its unread results
    fn reap_one(&mut self) -> Option<ProcessExit> {
        let pid = self
            .workers
            .iter_mut()
            .find_map(|(pid, handle)| handle.poll_exit().map(|_| *pid))?;
        let mut handle = self.workers.remove(&pid)?;
        handle.drain_results(&mut self.pending);
        let exit = ProcessExit::from_status(pid, handle.exit?);
        self.exited.push(exit);
        Some(exit)
    }
}

impl ProcessGroup for UnixProcessGroup {
    fn launch_process(&mut self) -> Result<Pid, ProcessError> {
        let handle = self.spawn_worker()?;
        let pid = handle.pid();
        self.workers.insert(pid, handle);
        Ok(pid)
    }

    fn map_async(&mut self, func: Option<WorkerFunc>, pid: Pid) -> Result<(), ProcessError> {
        let handle = self
            .workers
            .get_mut(&pid)
            .ok_or(ProcessError::UnknownPid(pid))?;
        let command = match func {
            Some(func) => SupervisorCommand::Run { func },
            None => SupervisorCommand::Release,
        };

        match handle.writer.write(&command) {
            Ok(()) => Ok(()),
            // A dead worker is reported by the next wait_once
            Err(e) if handle.poll_exit().is_some() => {
                debug!(pid, "worker gone before {:?}: {}", command, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn wait_once(&mut self, timeout: Duration) -> Result<Option<ProcessExit>, ProcessError> {
        if let Some(exit) = self.reap_one() {
            return Ok(Some(exit));
        }
        if self.workers.is_empty() {
            return Ok(None);
        }

        // An exiting worker closes its message pipe, which wakes the poll
        let deadline = Instant::now() + timeout;
        let mut fds: Vec<libc::pollfd> = self
            .workers
            .values()
            .map(|h| libc::pollfd {
                fd: h.msg_read_fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ret = unsafe {
                libc::poll(
                    fds.as_mut_ptr(),
                    fds.len() as libc::nfds_t,
                    poll_timeout_ms(remaining),
                )
            };
            if ret >= 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(ProcessError::Wait(err));
            }
        }

        Ok(self.reap_one())
    }

    fn pull_one_result(&mut self) -> Result<Option<ProcessResult>, ProcessError> {
        if let Some(result) = self.pending.pop_front() {
            return Ok(Some(result));
        }

        let ready = self.workers.iter().find_map(|(pid, handle)| {
            let readable = handle.reader.has_buffered_data()
                || matches!(wait_for_data(handle.msg_read_fd, 0), PollResult::DataAvailable);
            readable.then_some(*pid)
        });
        let Some(pid) = ready else {
            return Ok(None);
        };
        let Some(handle) = self.workers.get_mut(&pid) else {
            return Ok(None);
        };

        match handle.read_result() {
            Ok(result) => Ok(result),
            // Exited mid-write; wait_once will report it
            Err(e) if handle.poll_exit().is_some() => {
                debug!(pid, "result of exiting worker lost: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn statuses(&self) -> &[ProcessExit] {
        &self.exited
    }
}
