//! Worker Lifecycle Functions
//!
//! The three functions a worker runs on request of the pool manager:
//!
//! ```text
//! Bootstrap ──→ Exec ──→ Finalize
//! ```
//!
//! Each one returns a [`ResultEnvelope`]. Failures inside a function are
//! logged and folded into the envelope; nothing here panics the worker.

use crate::engine::{EngineError, WorkerEngine};
use crate::rundir;
use crate::settings::WorkerSettings;
use rangepool_ipc::{
    ChannelError, QueueError, QueueSource, RangeConnection, RangeTransport, ResultEnvelope,
    WorkerFunc,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Envelope error code of a failed function
pub const FAILURE_CODE: i32 = 1;

/// The first bootstrap step that failed
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// No rank could be taken from the rank queue
    #[error("unable to get rank ID: {0}")]
    Rank(#[from] QueueError),

    /// The run directory could not be created
    #[error("unable to make worker run directory {path}: {source}")]
    CreateRunDir {
        /// Run directory
        path: PathBuf,
        /// OS error
        source: std::io::Error,
    },

    /// stdout/stderr could not be pointed at the run directory
    #[error("unable to redirect logs into {path}: {source}")]
    RedirectLog {
        /// Run directory
        path: PathBuf,
        /// OS error
        source: std::io::Error,
    },

    /// Copying an auxiliary file failed
    #[error("unable to copy auxiliary files into {path}: {source}")]
    CopyAuxFiles {
        /// Run directory
        path: PathBuf,
        /// OS error
        source: std::io::Error,
    },

    /// The I/O registry refused the run directory
    #[error("failed to reinitialize I/O: {0}")]
    IoReinit(EngineError),

    /// The primary event source did not restart
    #[error("failed to restart the event selector: {0}")]
    RestartSelector(EngineError),

    /// A secondary event source did not restart
    #[error("failed to restart event selector {name}: {source}")]
    RestartBackground {
        /// Source name
        name: String,
        /// Engine failure
        source: EngineError,
    },

    /// The worker could not move into its run directory
    #[error("failed to chdir to {path}: {source}")]
    EnterRunDir {
        /// Run directory
        path: PathBuf,
        /// OS error
        source: std::io::Error,
    },
}

/// Opens the range channel when exec starts
pub trait RangeConnector {
    /// Connect to the range service
    fn connect(&mut self) -> Result<Box<dyn RangeTransport>, ChannelError>;
}

/// Connects over the run's Unix socket
pub struct SocketConnector {
    path: PathBuf,
}

impl SocketConnector {
    /// Connector for the channel socket at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RangeConnector for SocketConnector {
    fn connect(&mut self) -> Result<Box<dyn RangeTransport>, ChannelError> {
        Ok(Box::new(RangeConnection::connect(&self.path)?))
    }
}

/// State and collaborators of one worker process
pub struct WorkerLifecycle {
    pub(crate) settings: WorkerSettings,
    pub(crate) engine: WorkerEngine,
    ranks: Box<dyn QueueSource<i32>>,
    connector: Box<dyn RangeConnector>,
    rank: Option<i32>,
    pub(crate) output_dir: Option<PathBuf>,
    pub(crate) current_input: Option<String>,
    pub(crate) processed_events: i32,
    pub(crate) event_counter: i64,
}

impl WorkerLifecycle {
    /// Create the lifecycle of a fresh worker
    pub fn new(
        settings: WorkerSettings,
        engine: WorkerEngine,
        ranks: Box<dyn QueueSource<i32>>,
        connector: Box<dyn RangeConnector>,
    ) -> Self {
        Self {
            settings,
            engine,
            ranks,
            connector,
            rank: None,
            output_dir: None,
            current_input: None,
            processed_events: 0,
            event_counter: 1,
        }
    }

    /// Rank acquired during bootstrap
    pub fn rank(&self) -> Option<i32> {
        self.rank
    }

    /// Events processed successfully so far
    pub fn processed_events(&self) -> i32 {
        self.processed_events
    }

    /// Directory exec searches for range outputs. Bootstrap sets it to the
    /// run directory; without bootstrap the current directory is used.
    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) {
        self.output_dir = Some(dir.into());
    }

    /// Run the requested function
    pub fn dispatch(&mut self, func: WorkerFunc) -> ResultEnvelope {
        match func {
            WorkerFunc::Bootstrap => self.bootstrap(),
            WorkerFunc::Exec => self.exec(),
            WorkerFunc::Finalize => self.finalize(),
        }
    }

    /// Prepare this worker. A failure leaves the worker unusable.
    pub fn bootstrap(&mut self) -> ResultEnvelope {
        if self.settings.debug {
            crate::worker::wait_for_debugger();
        }

        match self.try_bootstrap() {
            Ok(run_dir) => {
                info!(pid = std::process::id(), run_dir = %run_dir.display(), "worker bootstrapped");
                ResultEnvelope::bootstrap(0)
            }
            Err(e) => {
                error!(pid = std::process::id(), "bootstrap failed: {}", e);
                ResultEnvelope::bootstrap(FAILURE_CODE)
            }
        }
    }

    fn try_bootstrap(&mut self) -> Result<PathBuf, BootstrapError> {
        let rank = self.ranks.receive_basic()?;
        self.rank = Some(rank);
        let run_dir = self.settings.run_dir(rank);

        rundir::create_run_dir(&run_dir).map_err(|source| BootstrapError::CreateRunDir {
            path: run_dir.clone(),
            source,
        })?;

        if self.settings.redirect_logs && !self.settings.debug {
            rundir::redirect_log(&run_dir).map_err(|source| BootstrapError::RedirectLog {
                path: run_dir.clone(),
                source,
            })?;
            info!(pid = std::process::id(), "logs redirected");
        }

        let run_dir = std::path::absolute(&run_dir).unwrap_or(run_dir);
        let copied = rundir::copy_aux_files(&self.settings.aux_files, &run_dir).map_err(
            |source| BootstrapError::CopyAuxFiles {
                path: run_dir.clone(),
                source,
            },
        )?;
        if !copied.is_empty() {
            debug!("copied {} auxiliary files", copied.len());
        }

        self.engine
            .io
            .reinitialize(&run_dir)
            .map_err(BootstrapError::IoReinit)?;
        debug!("I/O reinitialized");

        self.engine
            .selector
            .restart()
            .map_err(BootstrapError::RestartSelector)?;
        debug!("restarted event selector {}", self.engine.selector.name());

        if self.settings.pileup {
            for source in self.engine.background.iter_mut() {
                source
                    .restart()
                    .map_err(|e| BootstrapError::RestartBackground {
                        name: source.name().to_string(),
                        source: e,
                    })?;
                debug!("restarted event selector {}", source.name());
            }
        }

        enter_run_dir(&run_dir)?;
        self.output_dir = Some(run_dir.clone());
        Ok(run_dir)
    }

    /// Process event ranges until the range service says stop
    pub fn exec(&mut self) -> ResultEnvelope {
        info!(pid = std::process::id(), "exec started");

        let mut error_code = 0;
        match self.connector.connect() {
            Ok(mut transport) => {
                if let Err(e) = self.run_range_loop(transport.as_mut()) {
                    error!("range channel failed: {}", e);
                    error_code = FAILURE_CODE;
                }
            }
            Err(e) => {
                error!("{}", e);
                error_code = FAILURE_CODE;
            }
        }

        if let Err(e) = self.engine.processor.execute_run() {
            warn!("could not finalize the run: {}", e);
        }

        ResultEnvelope::exec(error_code, self.processed_events)
    }

    /// Tear the engine down. Always reports success.
    pub fn finalize(&mut self) -> ResultEnvelope {
        info!(pid = std::process::id(), "finalize started");

        match self.engine.processor.stop() {
            Err(e) => warn!("unable to stop the event processor: {}", e),
            Ok(()) => {
                if let Err(e) = self.engine.processor.finalize() {
                    warn!("unable to finalize the event processor: {}", e);
                }
            }
        }

        ResultEnvelope::finalize()
    }
}

fn enter_run_dir(run_dir: &Path) -> Result<(), BootstrapError> {
    std::env::set_current_dir(run_dir).map_err(|source| BootstrapError::EnterRunDir {
        path: run_dir.to_path_buf(),
        source,
    })
}
