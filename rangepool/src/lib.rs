#![warn(missing_docs)]
//! # RangePool
//!
//! Multi-process event-range worker pool with crash recovery and serialized
//! finalization.
//!
//! A coordinator spawns a fixed number of worker processes and drives each
//! of them through three functions:
//! - **Bootstrap**: acquire a rank, build a private run directory, restart the event sources
//! - **Exec**: pull event ranges from the external range service until it says stop
//! - **Finalize**: tear the engine down, one worker at a time in the order they left exec
//!
//! A worker that crashes while processing ranges is reported to the range
//! service on the failed-PID queue and replaced by a fresh worker. Once no
//! worker is left the queue receives the drain sentinel `-1`.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rangepool::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     // The same binary is the coordinator and, re-executed, every worker.
//!     rangepool::run(|| WorkerEngine::new(Box::new(MySelector::new()), Box::new(MyProcessor)))
//! }
//! ```
//!
//! ## Embedding the Range Service
//!
//! ```ignore
//! let config = PoolConfig::discover().unwrap_or_default();
//! let mut coordinator = Coordinator::new(&config, false)?;
//! let listener = RangeListener::bind(coordinator.channel_path())?;
//! // serve ranges from another thread, read coordinator.failed_pids()
//! let reports = coordinator.run()?;
//! ```

// Re-export wire types
pub use rangepool_ipc::{
    DRAIN_SENTINEL, EnvelopeError, EventRangeAssignment, FailureReport, OutputReport, Pid,
    QueueError, QueueSink, QueueSource, RangeConnection, RangeListener, RangeResponse,
    RangeStatus, RangeTransport, ResultEnvelope, SharedQueue, WorkerFunc, channel_path,
    readiness_message,
};

// Re-export the worker runtime
pub use rangepool_core::{
    BootstrapError, EngineError, EventProcessor, EventSource, IoRegistry, NoIoRegistry,
    RangeConnector, SeekError, SocketConnector, WorkerEngine, WorkerLifecycle, WorkerSettings,
};

// Re-export the coordinator
pub use rangepool_cli::{
    Cli, Coordinator, PoolConfig, PoolError, PoolManager, ProcessExit, ProcessGroup,
    UnixProcessGroup, WorkerCount, WorkerReport, WorkerState,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Coordinator, EngineError, EventProcessor, EventSource, PoolConfig, RangeListener,
        RangeTransport, SeekError, WorkerEngine, WorkerReport,
    };
}

/// Run the RangePool CLI harness.
///
/// Call this from the application's `main()` with a factory for the engine
/// each worker runs:
/// ```ignore
/// fn main() -> anyhow::Result<()> {
///     rangepool::run(build_engine)
/// }
/// ```
pub use rangepool_cli::run;

pub use rangepool_cli::{init_tracing, load_config, run_with_cli};
