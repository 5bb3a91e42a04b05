#![warn(missing_docs)]
//! RangePool Core - Worker Runtime
//!
//! Everything that runs inside a worker process:
//! - `WorkerLifecycle` with the Bootstrap, Exec and Finalize functions
//! - the range loop talking to the external range service
//! - engine traits applications implement for their event processing
//! - `WorkerMain`, the command loop a spawned worker enters

mod engine;
mod exec_loop;
mod lifecycle;
mod rundir;
mod settings;
mod worker;

#[cfg(test)]
mod testing;

pub use engine::{
    EngineError, EventProcessor, EventSource, IoRegistry, NoIoRegistry, SeekError, WorkerEngine,
};
pub use exec_loop::{RangeTimer, find_outputs};
pub use lifecycle::{
    BootstrapError, FAILURE_CODE, RangeConnector, SocketConnector, WorkerLifecycle,
};
pub use rundir::{copy_aux_files, create_run_dir, redirect_log};
pub use settings::{DEFAULT_DIR_PREFIX, WORKER_LOG_NAME, WorkerSettings};
pub use worker::{WorkerError, WorkerMain, run_worker, shutdown_requested, wait_for_debugger};
