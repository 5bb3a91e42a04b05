//! Worker Process Entry Point
//!
//! A worker is the coordinator's own executable started again in worker
//! mode. Commands arrive on fd 3 and results leave on fd 4, announced through
//! `RANGEPOOL_IPC_FD`; without it the worker falls back to stdin/stdout.
//!
//! SIGTERM sets a flag that ends the command loop between functions.

use crate::engine::WorkerEngine;
use crate::lifecycle::{SocketConnector, WorkerLifecycle};
use crate::settings::WorkerSettings;
use rangepool_ipc::{
    FrameError, FrameReader, FrameWriter, IPC_FD_ENV, QueueError, QueueReceiver,
    RANK_QUEUE_FD_ENV, SupervisorCommand, WorkerHello, WorkerMessage,
};
use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Global flag set by SIGTERM handler to request graceful shutdown.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Set by SIGUSR1 once a debugger has attached.
static DEBUGGER_ATTACHED: AtomicBool = AtomicBool::new(false);

/// Check if a graceful shutdown has been requested via SIGTERM.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Install `handler` for `signal`. The handlers only store to an atomic.
fn install_handler(signal: libc::c_int, handler: extern "C" fn(libc::c_int)) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as *const () as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signal, &sa, std::ptr::null_mut());
    }
}

extern "C" fn sigterm_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn sigusr1_handler(_sig: libc::c_int) {
    DEBUGGER_ATTACHED.store(true, Ordering::Relaxed);
}

/// Block until SIGUSR1 arrives, so a debugger can attach to this process.
pub fn wait_for_debugger() {
    install_handler(libc::SIGUSR1, sigusr1_handler);
    warn!(
        "bootstrap worker PID {} - waiting for SIGUSR1",
        std::process::id()
    );
    while !DEBUGGER_ATTACHED.load(Ordering::Relaxed) && !shutdown_requested() {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("resuming bootstrap");
}

/// Errors that end a worker process
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The command channel broke
    #[error("command channel: {0}")]
    Frame(#[from] FrameError),

    /// The worker environment is incomplete
    #[error("worker settings missing from the environment")]
    MissingSettings,

    /// The inherited rank queue is unusable
    #[error(transparent)]
    RankQueue(#[from] QueueError),
}

/// IPC transport: either inherited fd pair or stdin/stdout fallback.
enum IpcTransport {
    Fds { read_fd: i32, write_fd: i32 },
    Stdio,
}

fn detect_transport() -> IpcTransport {
    if let Ok(val) = std::env::var(IPC_FD_ENV) {
        if let Some((r, w)) = val.split_once(',') {
            if let (Ok(read_fd), Ok(write_fd)) = (r.parse::<i32>(), w.parse::<i32>()) {
                return IpcTransport::Fds { read_fd, write_fd };
            }
        }
        warn!(
            "invalid {}={:?} (expected <read_fd>,<write_fd>), falling back to stdio",
            IPC_FD_ENV, val
        );
    }
    IpcTransport::Stdio
}

/// Worker main loop
pub struct WorkerMain<R: Read = Box<dyn Read>, W: Write = Box<dyn Write>> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl WorkerMain {
    /// Create a worker on fd 3/4 if `RANGEPOOL_IPC_FD` is set, otherwise on stdin/stdout.
    pub fn new() -> Self {
        match detect_transport() {
            IpcTransport::Fds { read_fd, write_fd } => {
                let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
                let write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };
                Self::with_transport(Box::new(read_file), Box::new(write_file))
            }
            IpcTransport::Stdio => {
                Self::with_transport(Box::new(std::io::stdin()), Box::new(std::io::stdout()))
            }
        }
    }
}

impl Default for WorkerMain {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read, W: Write> WorkerMain<R, W> {
    /// Create a worker on an explicit command/message stream pair
    pub fn with_transport(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    /// Serve lifecycle commands until released, the channel closes, or
    /// SIGTERM arrives.
    pub fn run(&mut self, lifecycle: &mut WorkerLifecycle) -> Result<(), WorkerError> {
        install_handler(libc::SIGTERM, sigterm_handler);

        self.writer
            .write(&WorkerMessage::Hello(WorkerHello::current()))?;

        loop {
            if shutdown_requested() {
                info!("SIGTERM received, leaving the command loop");
                break;
            }

            let command: SupervisorCommand = match self.reader.read() {
                Ok(command) => command,
                Err(FrameError::EndOfStream) => {
                    debug!("command channel closed");
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            match command {
                SupervisorCommand::Run { func } => {
                    let envelope = lifecycle.dispatch(func);
                    debug!(
                        "{} done: error code {}, aux {}",
                        func, envelope.error_code, envelope.aux_value
                    );
                    self.writer.write(&WorkerMessage::Result {
                        payload: envelope.encode().to_vec(),
                    })?;
                }
                SupervisorCommand::Release => {
                    debug!("released by the pool manager");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Run a worker process for `engine` with settings and descriptors
/// inherited from the coordinator.
pub fn run_worker(engine: WorkerEngine) -> Result<(), WorkerError> {
    let settings = WorkerSettings::from_env().ok_or(WorkerError::MissingSettings)?;
    let ranks = QueueReceiver::<i32>::from_env("ranks", RANK_QUEUE_FD_ENV)?;
    let connector = SocketConnector::new(settings.range_channel.clone());

    let mut lifecycle =
        WorkerLifecycle::new(settings, engine, Box::new(ranks), Box::new(connector));
    WorkerMain::new().run(&mut lifecycle)
}
