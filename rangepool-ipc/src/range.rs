//! Event Range Protocol
//!
//! Messages exchanged between a worker's exec loop and the external range
//! service.
//!
//! ```text
//! worker  -> service   "<pid> ready for event processing"
//! service -> worker    "RangeID,[PFN:<file>,]<startEvent>,<endEvent>"   (assignment)
//!                      one byte                                         (no more work)
//! worker  -> service   "<files>,ID:<RangeID>,CPU:<s>,WALL:<s>"          (success)
//!                      [i32 pid][i32 status]                            (failure)
//! ```

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Prefix marking the optional input-file field of an assignment
pub const PFN_PREFIX: &str = "PFN:";

/// Encoded size of a [`FailureReport`]
pub const FAILURE_REPORT_SIZE: usize = 8;

/// Readiness announcement sent before every assignment request
pub fn readiness_message(pid: u32) -> String {
    format!("{pid} ready for event processing")
}

/// Outcome of one event range, reported back to the range service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RangeStatus {
    /// Range processed and its output located
    Success = 0,
    /// An event index of the range is not in the input file
    NotFound = 1,
    /// Seeking (or opening the iteration context) failed
    SeekFailed = 2,
    /// The range's input file could not be selected
    BadInputFile = 3,
    /// The event processor failed on an event of the range
    ProcessFailed = 4,
    /// All events processed but no output artifact carries the range id
    NoOutputProduced = 5,
}

impl RangeStatus {
    /// Inverse of `status as i32`
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RangeStatus::Success),
            1 => Some(RangeStatus::NotFound),
            2 => Some(RangeStatus::SeekFailed),
            3 => Some(RangeStatus::BadInputFile),
            4 => Some(RangeStatus::ProcessFailed),
            5 => Some(RangeStatus::NoOutputProduced),
            _ => None,
        }
    }
}

impl fmt::Display for RangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RangeStatus::Success => "success",
            RangeStatus::NotFound => "event not found",
            RangeStatus::SeekFailed => "seek failed",
            RangeStatus::BadInputFile => "bad input file",
            RangeStatus::ProcessFailed => "processing failed",
            RangeStatus::NoOutputProduced => "no output produced",
        };
        f.write_str(s)
    }
}

/// Errors parsing a range service response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeParseError {
    /// The payload is not text
    #[error("range response is not valid UTF-8")]
    NotUtf8,

    /// A required field is absent
    #[error("range {range_id}: missing {field}")]
    MissingField {
        /// Range the response named
        range_id: String,
        /// Name of the absent field
        field: &'static str,
    },

    /// A numeric field does not hold a usable event number
    #[error("range {range_id}: invalid {field} {value:?}")]
    InvalidNumber {
        /// Range the response named
        range_id: String,
        /// Name of the field
        field: &'static str,
        /// Text as received
        value: String,
    },
}

impl RangeParseError {
    /// Range id the malformed response belonged to, when it got that far
    pub fn range_id(&self) -> Option<&str> {
        match self {
            RangeParseError::NotUtf8 => None,
            RangeParseError::MissingField { range_id, .. }
            | RangeParseError::InvalidNumber { range_id, .. } => Some(range_id),
        }
    }
}

/// One unit of work handed out by the range service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRangeAssignment {
    /// Opaque identifier, also the suffix of the range's output files
    pub range_id: String,
    /// Input file to switch to before processing
    pub input_file: Option<String>,
    /// First event, 1-based
    pub start_event: i64,
    /// Last event, inclusive
    pub end_event: i64,
}

impl EventRangeAssignment {
    /// Zero-based event indices covered by this range
    pub fn event_indices(&self) -> std::ops::Range<i64> {
        self.start_event.saturating_sub(1)..self.end_event
    }
}

impl fmt::Display for EventRangeAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.range_id)?;
        if let Some(file) = &self.input_file {
            write!(f, ",{PFN_PREFIX}{file}")?;
        }
        write!(f, ",{},{}", self.start_event, self.end_event)
    }
}

/// A decoded range service response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeResponse {
    /// No more work; leave the exec loop
    Terminate,
    /// Process this range
    Assignment(EventRangeAssignment),
}

impl RangeResponse {
    /// Parse a raw response. Payloads of at most one byte are the stop sentinel.
    pub fn parse(raw: &[u8]) -> Result<Self, RangeParseError> {
        if raw.len() <= 1 {
            return Ok(RangeResponse::Terminate);
        }
        let text = std::str::from_utf8(raw).map_err(|_| RangeParseError::NotUtf8)?;

        let mut fields = text.split(',').map(str::trim);
        let range_id = fields.next().unwrap_or_default().to_string();

        let mut next = fields.next();
        let input_file = match next {
            Some(field) if field.starts_with(PFN_PREFIX) => {
                next = fields.next();
                Some(field[PFN_PREFIX.len()..].to_string())
            }
            _ => None,
        };

        let number = |value: Option<&str>, field: &'static str| -> Result<i64, RangeParseError> {
            let value = value.ok_or_else(|| RangeParseError::MissingField {
                range_id: range_id.clone(),
                field,
            })?;
            value
                .parse::<i64>()
                .map_err(|_| RangeParseError::InvalidNumber {
                    range_id: range_id.clone(),
                    field,
                    value: value.to_string(),
                })
        };

        let start_event = number(next, "start event")?;
        // Events are numbered from 1
        if start_event < 1 {
            return Err(RangeParseError::InvalidNumber {
                range_id: range_id.clone(),
                field: "start event",
                value: start_event.to_string(),
            });
        }
        let end_event = number(fields.next(), "end event")?;

        Ok(RangeResponse::Assignment(EventRangeAssignment {
            range_id,
            input_file,
            start_event,
            end_event,
        }))
    }
}

/// Fixed-layout report of a range that did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    /// Worker that processed the range
    pub pid: i32,
    /// What went wrong
    pub status: RangeStatus,
}

impl FailureReport {
    /// Encode as `[i32 pid LE][i32 status LE]`
    pub fn encode(&self) -> [u8; FAILURE_REPORT_SIZE] {
        let mut out = [0u8; FAILURE_REPORT_SIZE];
        out[0..4].copy_from_slice(&self.pid.to_le_bytes());
        out[4..8].copy_from_slice(&(self.status as i32).to_le_bytes());
        out
    }

    /// Decode a report, `None` if the payload is not a failure report
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != FAILURE_REPORT_SIZE {
            return None;
        }
        let pid = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let status = RangeStatus::from_code(i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]))?;
        Some(Self { pid, status })
    }
}

/// Descriptor of a successfully processed range
#[derive(Debug, Clone, PartialEq)]
pub struct OutputReport {
    /// Output artifacts whose names end with the range id
    pub files: Vec<PathBuf>,
    /// Range the outputs belong to
    pub range_id: String,
    /// CPU seconds spent on the range
    pub cpu_seconds: f64,
    /// Wall-clock seconds spent on the range
    pub wall_seconds: f64,
}

impl fmt::Display for OutputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let files: Vec<String> = self
            .files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        write!(
            f,
            "{},ID:{},CPU:{},WALL:{}",
            files.join(","),
            self.range_id,
            self.cpu_seconds,
            self.wall_seconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_range() {
        let response = RangeResponse::parse(b"Range-7,11,20").unwrap();
        let RangeResponse::Assignment(range) = response else {
            panic!("expected assignment");
        };
        assert_eq!(range.range_id, "Range-7");
        assert_eq!(range.input_file, None);
        assert_eq!(range.start_event, 11);
        assert_eq!(range.end_event, 20);
        assert_eq!(range.event_indices(), 10..20);
    }

    #[test]
    fn test_parse_range_with_input_file() {
        let response = RangeResponse::parse(b"R2,PFN:/data/evgen.pool.root,1,3").unwrap();
        assert_eq!(
            response,
            RangeResponse::Assignment(EventRangeAssignment {
                range_id: "R2".to_string(),
                input_file: Some("/data/evgen.pool.root".to_string()),
                start_event: 1,
                end_event: 3,
            })
        );
    }

    #[test]
    fn test_sentinels_terminate() {
        assert_eq!(RangeResponse::parse(b"").unwrap(), RangeResponse::Terminate);
        assert_eq!(RangeResponse::parse(b"x").unwrap(), RangeResponse::Terminate);
    }

    #[test]
    fn test_malformed_range_keeps_id() {
        let err = RangeResponse::parse(b"R9,PFN:f.root,abc,4").unwrap_err();
        assert_eq!(err.range_id(), Some("R9"));
        assert!(matches!(err, RangeParseError::InvalidNumber { .. }));

        let err = RangeResponse::parse(b"R9,4").unwrap_err();
        assert!(matches!(
            err,
            RangeParseError::MissingField {
                field: "end event",
                ..
            }
        ));
    }

    #[test]
    fn test_start_event_below_one_rejected() {
        let err = RangeResponse::parse(b"R1,-9223372036854775808,1").unwrap_err();
        assert_eq!(
            err,
            RangeParseError::InvalidNumber {
                range_id: "R1".to_string(),
                field: "start event",
                value: i64::MIN.to_string(),
            }
        );
        assert_eq!(err.range_id(), Some("R1"));
        assert!(RangeResponse::parse(b"R1,0,5").is_err());

        let range = EventRangeAssignment {
            range_id: "R1".to_string(),
            input_file: None,
            start_event: i64::MIN,
            end_event: 1,
        };
        assert_eq!(range.event_indices().start, i64::MIN);
    }

    #[test]
    fn test_assignment_display_matches_wire_format() {
        let range = EventRangeAssignment {
            range_id: "R2".to_string(),
            input_file: Some("in.root".to_string()),
            start_event: 1,
            end_event: 3,
        };
        let wire = range.to_string();
        assert_eq!(wire, "R2,PFN:in.root,1,3");
        assert_eq!(
            RangeResponse::parse(wire.as_bytes()).unwrap(),
            RangeResponse::Assignment(range)
        );
    }

    #[test]
    fn test_failure_report_layout() {
        let report = FailureReport {
            pid: 77,
            status: RangeStatus::ProcessFailed,
        };
        let bytes = report.encode();
        assert_eq!(bytes, [77, 0, 0, 0, 4, 0, 0, 0]);
        assert_eq!(FailureReport::decode(&bytes), Some(report));
        assert_eq!(FailureReport::decode(b"out.root,ID:R1"), None);
    }

    #[test]
    fn test_output_report_format() {
        let report = OutputReport {
            files: vec![PathBuf::from("/run/a.R1"), PathBuf::from("/run/b.R1")],
            range_id: "R1".to_string(),
            cpu_seconds: 1.5,
            wall_seconds: 2.0,
        };
        assert_eq!(report.to_string(), "/run/a.R1,/run/b.R1,ID:R1,CPU:1.5,WALL:2");
    }

    #[test]
    fn test_readiness_message() {
        assert_eq!(readiness_message(123), "123 ready for event processing");
    }
}
