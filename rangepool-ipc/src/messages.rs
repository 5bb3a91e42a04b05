//! IPC Message Types
//!
//! Commands and replies exchanged between the pool manager and a worker
//! process over its private pipe pair. All messages are rkyv-serialized.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use std::fmt;

/// A lifecycle function a worker executes on request.
///
/// The discriminant doubles as the `funcTag` of the result envelope.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub enum WorkerFunc {
    /// Acquire a rank, prepare the run directory and restart event sources
    Bootstrap,
    /// Pull event ranges from the range service until told to stop
    Exec,
    /// Tear down the event processing engine
    Finalize,
}

impl WorkerFunc {
    /// Fixed-width tag written into the result envelope
    pub fn wire_tag(self) -> u32 {
        match self {
            WorkerFunc::Bootstrap => 0,
            WorkerFunc::Exec => 1,
            WorkerFunc::Finalize => 2,
        }
    }

    /// Inverse of [`WorkerFunc::wire_tag`]
    pub fn from_wire_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(WorkerFunc::Bootstrap),
            1 => Some(WorkerFunc::Exec),
            2 => Some(WorkerFunc::Finalize),
            _ => None,
        }
    }

    /// Short label for logs
    pub fn label(self) -> &'static str {
        match self {
            WorkerFunc::Bootstrap => "bootstrap",
            WorkerFunc::Exec => "exec",
            WorkerFunc::Finalize => "finalize",
        }
    }
}

impl fmt::Display for WorkerFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Commands sent from the pool manager to a worker
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum SupervisorCommand {
    /// Execute one lifecycle function and reply with its result envelope
    Run {
        /// Function to execute
        func: WorkerFunc,
    },

    /// Release the worker from further scheduling; it exits with status 0
    Release,
}

/// Handshake sent by a worker as soon as its transport is up
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct WorkerHello {
    /// Protocol version for compatibility
    pub protocol_version: u32,
    /// OS process id of the worker
    pub pid: i32,
}

impl WorkerHello {
    /// Handshake for the calling process
    pub fn current() -> Self {
        Self {
            protocol_version: crate::PROTOCOL_VERSION,
            pid: std::process::id() as i32,
        }
    }
}

/// Messages sent from a worker to the pool manager
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum WorkerMessage {
    /// Initial handshake
    Hello(WorkerHello),

    /// Completion of a lifecycle function
    Result {
        /// Encoded [`crate::ResultEnvelope`]
        payload: Vec<u8>,
    },
}
