//! Exec Range Loop
//!
//! Client side of the range protocol: announce readiness, receive an
//! assignment, seek through its events, report the outcome, repeat until
//! the service sends the stop sentinel.
//!
//! A range that fails is reported and skipped; only a broken channel ends
//! the loop early.

use crate::engine::{EngineError, SeekError};
use crate::lifecycle::WorkerLifecycle;
use rangepool_ipc::{
    ChannelError, EventRangeAssignment, FailureReport, OutputReport, RangeResponse,
    RangeStatus, RangeTransport, readiness_message,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// CPU time consumed by this process so far
fn process_cpu_time() -> Duration {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
        return Duration::ZERO;
    }
    let tv = |t: libc::timeval| {
        Duration::from_secs(t.tv_sec as u64) + Duration::from_micros(t.tv_usec as u64)
    };
    tv(usage.ru_utime) + tv(usage.ru_stime)
}

/// CPU and wall clock of one range
pub struct RangeTimer {
    cpu_start: Duration,
    wall_start: Instant,
}

impl RangeTimer {
    /// Start timing now
    pub fn start() -> Self {
        Self {
            cpu_start: process_cpu_time(),
            wall_start: Instant::now(),
        }
    }

    /// (cpu seconds, wall seconds) since start
    pub fn elapsed_secs(&self) -> (f64, f64) {
        let cpu = process_cpu_time().saturating_sub(self.cpu_start);
        (cpu.as_secs_f64(), self.wall_start.elapsed().as_secs_f64())
    }
}

/// Files in `dir` whose name ends with `range_id`, sorted by path
pub fn find_outputs(dir: &Path, range_id: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut outputs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(range_id));
        if matches && path.is_file() {
            outputs.push(path);
        }
    }
    outputs.sort();
    Ok(outputs)
}

impl WorkerLifecycle {
    pub(crate) fn run_range_loop(
        &mut self,
        transport: &mut dyn RangeTransport,
    ) -> Result<(), ChannelError> {
        let pid = std::process::id();
        let ping = readiness_message(pid);

        loop {
            transport.send(ping.as_bytes())?;
            let raw = transport.recv()?;

            let range = match RangeResponse::parse(&raw) {
                Ok(RangeResponse::Terminate) => {
                    info!("empty range received, terminating the loop");
                    return Ok(());
                }
                Ok(RangeResponse::Assignment(range)) => range,
                Err(e) => {
                    warn!("malformed range {:?}: {}", e.range_id(), e);
                    // Without a range id there is nothing to attribute a report to
                    if e.range_id().is_some() {
                        report_failure(transport, RangeStatus::ProcessFailed)?;
                    }
                    continue;
                }
            };

            info!(range_id = %range.range_id, "received range {}", range);
            let timer = RangeTimer::start();

            self.engine.processor.begin_range(Some(&range.range_id));
            let status = self.process_range(&range);
            self.engine.processor.begin_range(None);

            if status != RangeStatus::Success {
                warn!(range_id = %range.range_id, "range failed: {}", status);
                report_failure(transport, status)?;
                continue;
            }

            let dir = match &self.output_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            };
            let files = find_outputs(&dir, &range.range_id).unwrap_or_else(|e| {
                warn!("unable to scan {} for outputs: {}", dir.display(), e);
                Vec::new()
            });

            if files.is_empty() {
                warn!(range_id = %range.range_id, "failed to make an output file for range");
                report_failure(transport, RangeStatus::NoOutputProduced)?;
                continue;
            }

            let (cpu_seconds, wall_seconds) = timer.elapsed_secs();
            let report = OutputReport {
                files,
                range_id: range.range_id.clone(),
                cpu_seconds,
                wall_seconds,
            }
            .to_string();
            transport.send(report.as_bytes())?;
            info!("reported the output {}", report);
        }
    }

    /// Seek through and process every event of `range`
    fn process_range(&mut self, range: &EventRangeAssignment) -> RangeStatus {
        if let Some(file) = &range.input_file {
            if let Err(e) = self.switch_input(file) {
                warn!(range_id = %range.range_id, "failed to set input file: {}", e);
                return RangeStatus::BadInputFile;
            }
        }
        debug!(
            "range fields: file {}, first event {}, last event {}",
            range.input_file.as_deref().unwrap_or("N/A"),
            range.start_event,
            range.end_event
        );

        if let Err(e) = self.engine.selector.create_context() {
            warn!("failed to create event selector context: {}", e);
            return RangeStatus::SeekFailed;
        }

        let mut status = RangeStatus::Success;
        for index in range.event_indices() {
            match self.engine.selector.seek(index) {
                Ok(()) => {}
                Err(SeekError::NotFound(_)) => {
                    warn!("event {} from range {} not in the input file", index, range.range_id);
                    status = RangeStatus::NotFound;
                    break;
                }
                Err(e) => {
                    warn!("{} in range {}", e, range.range_id);
                    status = RangeStatus::SeekFailed;
                    break;
                }
            }

            let event_number = self.event_counter;
            self.event_counter += 1;
            if let Err(e) = self.engine.processor.next_event(event_number) {
                warn!("failed to process event {} in range {}: {}", index, range.range_id, e);
                status = RangeStatus::ProcessFailed;
                break;
            }
            self.processed_events += 1;
        }

        if let Err(e) = self.engine.selector.release_context() {
            warn!("failed to release event selector context: {}", e);
        }
        status
    }

    /// Point the primary source at `file` unless it already reads it
    fn switch_input(&mut self, file: &str) -> Result<(), EngineError> {
        if self.current_input.as_deref() == Some(file) {
            return Ok(());
        }

        if self.current_input.is_none() {
            let collections = self.engine.selector.input_collections()?;
            if collections.first().map(String::as_str) == Some(file) {
                self.current_input = Some(file.to_string());
                return Ok(());
            }
        }

        self.engine
            .selector
            .set_input_collections(vec![file.to_string()])?;
        self.current_input = Some(file.to_string());
        Ok(())
    }
}

fn report_failure(
    transport: &mut dyn RangeTransport,
    status: RangeStatus,
) -> Result<(), ChannelError> {
    let report = FailureReport {
        pid: std::process::id() as i32,
        status,
    };
    transport.send(&report.encode())
}
