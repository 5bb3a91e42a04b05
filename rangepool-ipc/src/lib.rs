#![warn(missing_docs)]
//! RangePool IPC Protocol
//!
//! Wire formats and process-shared channels between the pool manager, its
//! worker processes and the external range service:
//! - rkyv frames carrying lifecycle commands over each worker's pipe pair
//! - the fixed-size result envelope every lifecycle function replies with
//! - the event range request/response messages
//! - datagram-backed FIFO queues for ranks and failed PIDs

mod channel;
mod envelope;
mod framing;
mod messages;
mod queue;
mod range;

pub use channel::{ChannelError, RangeConnection, RangeListener, RangeTransport, channel_path};
pub use envelope::{ENVELOPE_SIZE, EnvelopeError, FINALIZE_AUX_VALUE, ResultEnvelope};
pub use framing::{
    FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, read_bytes_frame, read_frame,
    write_bytes_frame, write_frame,
};
pub use messages::{SupervisorCommand, WorkerFunc, WorkerHello, WorkerMessage};
pub use queue::{QueueError, QueueItem, QueueReceiver, QueueSink, QueueSource, SharedQueue};
pub use range::{
    EventRangeAssignment, FAILURE_REPORT_SIZE, FailureReport, OutputReport, PFN_PREFIX,
    RangeParseError, RangeResponse, RangeStatus, readiness_message,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// OS process id as carried on the wire
pub type Pid = i32;

/// Sentinel pushed on the failed-PID queue once no active workers remain
pub const DRAIN_SENTINEL: Pid = -1;

/// Environment variable announcing the worker's command/message descriptors
pub const IPC_FD_ENV: &str = "RANGEPOOL_IPC_FD";

/// Environment variable announcing the inherited rank queue descriptor
pub const RANK_QUEUE_FD_ENV: &str = "RANGEPOOL_RANK_QUEUE_FD";
