//! Injected Event Processing Engine
//!
//! The worker lifecycle drives these traits; it never looks inside an event.
//! Applications implement them for their event selector, per-event
//! processor and process-local I/O registry.

use std::path::Path;
use thiserror::Error;

/// Failure reported by an engine component
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{component}: {message}")]
pub struct EngineError {
    /// Component that failed
    pub component: String,
    /// What happened
    pub message: String,
}

impl EngineError {
    /// Create an error for `component`
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Why a seek did not land on the requested event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeekError {
    /// The index is past the end of the input
    #[error("event {0} not in the input")]
    NotFound(i64),

    /// Any other seek failure
    #[error("failed to seek to event {index}: {reason}")]
    Failed {
        /// Requested index
        index: i64,
        /// Underlying cause
        reason: String,
    },
}

/// A seekable source of events (an event selector)
pub trait EventSource {
    /// Component name for logs
    fn name(&self) -> &str;

    /// Restart the source after the worker has been spawned
    fn restart(&mut self) -> Result<(), EngineError>;

    /// Current input collection
    fn input_collections(&self) -> Result<Vec<String>, EngineError>;

    /// Replace the input collection
    fn set_input_collections(&mut self, files: Vec<String>) -> Result<(), EngineError>;

    /// Open an iteration context over the current input
    fn create_context(&mut self) -> Result<(), EngineError>;

    /// Position the context on the zero-based event `index`
    fn seek(&mut self, index: i64) -> Result<(), SeekError>;

    /// Close the iteration context
    fn release_context(&mut self) -> Result<(), EngineError>;
}

/// The per-event processing engine
pub trait EventProcessor {
    /// Called with the range id before a range is processed and with `None`
    /// once it is done, so outputs can be cut per range.
    fn begin_range(&mut self, _range_id: Option<&str>) {}

    /// Process the event the primary source is positioned on.
    /// `event_number` counts attempted events, starting at 1.
    fn next_event(&mut self, event_number: i64) -> Result<(), EngineError>;

    /// Complete the run after the last range
    fn execute_run(&mut self) -> Result<(), EngineError>;

    /// Stop the engine
    fn stop(&mut self) -> Result<(), EngineError>;

    /// Tear the engine down
    fn finalize(&mut self) -> Result<(), EngineError>;
}

/// Process-local I/O state that must be rebuilt in a fresh worker
pub trait IoRegistry {
    /// Re-point registered I/O at the worker's run directory
    fn reinitialize(&mut self, run_dir: &Path) -> Result<(), EngineError>;
}

/// Registry for engines without process-local I/O
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIoRegistry;

impl IoRegistry for NoIoRegistry {
    fn reinitialize(&mut self, _run_dir: &Path) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Everything a worker needs from the application
pub struct WorkerEngine {
    /// Primary event source, the one ranges seek in
    pub selector: Box<dyn EventSource>,
    /// Secondary sources restarted in pileup mode
    pub background: Vec<Box<dyn EventSource>>,
    /// Per-event processor
    pub processor: Box<dyn EventProcessor>,
    /// Process-local I/O registry
    pub io: Box<dyn IoRegistry>,
}

impl WorkerEngine {
    /// Engine with a primary source and a processor only
    pub fn new(selector: Box<dyn EventSource>, processor: Box<dyn EventProcessor>) -> Self {
        Self {
            selector,
            background: Vec::new(),
            processor,
            io: Box::new(NoIoRegistry),
        }
    }

    /// Add secondary (pileup) event sources
    pub fn with_background(mut self, sources: Vec<Box<dyn EventSource>>) -> Self {
        self.background = sources;
        self
    }

    /// Use a custom I/O registry
    pub fn with_io(mut self, io: Box<dyn IoRegistry>) -> Self {
        self.io = io;
        self
    }
}
