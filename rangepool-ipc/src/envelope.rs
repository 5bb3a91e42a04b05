//! Result Envelope Codec
//!
//! Every lifecycle function replies with the same fixed-size envelope:
//!
//! ```text
//! +------------------+----------------+------------------+
//! | errorCode (i32)  | funcTag (u32)  | auxValue (i32)   |
//! +------------------+----------------+------------------+
//! ```
//!
//! All fields little-endian. `auxValue` is 0 for bootstrap, the processed
//! event count for exec and -1 for finalize.

use crate::WorkerFunc;
use thiserror::Error;

/// Encoded size of a [`ResultEnvelope`] in bytes
pub const ENVELOPE_SIZE: usize = 12;

/// `auxValue` carried by every finalize envelope
pub const FINALIZE_AUX_VALUE: i32 = -1;

/// Errors decoding a result payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// The payload is not exactly one envelope long
    #[error("result payload is {len} bytes, expected {expected}")]
    WrongSize {
        /// Bytes received
        len: usize,
        /// Envelope size
        expected: usize,
    },

    /// The function tag names no lifecycle function
    #[error("unknown function tag {0}")]
    UnknownFuncTag(u32),
}

/// Reply of a worker after any lifecycle function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultEnvelope {
    /// 0 on success
    pub error_code: i32,
    /// Function that produced this result
    pub func: WorkerFunc,
    /// Function-specific value
    pub aux_value: i32,
}

impl ResultEnvelope {
    /// Bootstrap acknowledgement with the given status
    pub fn bootstrap(error_code: i32) -> Self {
        Self {
            error_code,
            func: WorkerFunc::Bootstrap,
            aux_value: 0,
        }
    }

    /// Exec completion carrying the cumulative processed-event count
    pub fn exec(error_code: i32, processed_events: i32) -> Self {
        Self {
            error_code,
            func: WorkerFunc::Exec,
            aux_value: processed_events,
        }
    }

    /// Finalize completion. Always reports success.
    pub fn finalize() -> Self {
        Self {
            error_code: 0,
            func: WorkerFunc::Finalize,
            aux_value: FINALIZE_AUX_VALUE,
        }
    }

    /// Whether the function reported success
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    /// Encode into the fixed wire layout
    pub fn encode(&self) -> [u8; ENVELOPE_SIZE] {
        let mut out = [0u8; ENVELOPE_SIZE];
        out[0..4].copy_from_slice(&self.error_code.to_le_bytes());
        out[4..8].copy_from_slice(&self.func.wire_tag().to_le_bytes());
        out[8..12].copy_from_slice(&self.aux_value.to_le_bytes());
        out
    }

    /// Decode a payload produced by [`ResultEnvelope::encode`]
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let bytes: &[u8; ENVELOPE_SIZE] =
            payload.try_into().map_err(|_| EnvelopeError::WrongSize {
                len: payload.len(),
                expected: ENVELOPE_SIZE,
            })?;

        let field = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        let tag = u32::from_le_bytes(field(4));
        let func = WorkerFunc::from_wire_tag(tag).ok_or(EnvelopeError::UnknownFuncTag(tag))?;

        Ok(Self {
            error_code: i32::from_le_bytes(field(0)),
            func,
            aux_value: i32::from_le_bytes(field(8)),
        })
    }
}
