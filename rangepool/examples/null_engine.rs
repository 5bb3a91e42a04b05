//! RangePool Example with an Embedded Range Service
//!
//! Runs a pool of workers over a synthetic input of 1000 events. The range
//! service lives in this same process: it hands out ranges of 50 events,
//! collects the output reports and re-queues the range of any worker that
//! crashed.
//!
//! Run with:
//!   cargo run --example null_engine                  # One worker per CPU
//!   cargo run --example null_engine -- -j 4 -v       # Four workers, debug logs
//!   cargo run --example null_engine -- --topdir /tmp/run

use clap::Parser;
use rangepool::prelude::*;
use rangepool::{
    Cli, DRAIN_SENTINEL, FailureReport, Pid, QueueSource, RangeConnection, SharedQueue,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const TOTAL_EVENTS: i64 = 1000;
const RANGE_SIZE: i64 = 50;

// ============================================================================
// Engine
// ============================================================================

/// Selector over a fixed number of empty events
struct NullSource {
    input: String,
}

impl EventSource for NullSource {
    fn name(&self) -> &str {
        "NullSource"
    }

    fn restart(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn input_collections(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec![self.input.clone()])
    }

    fn set_input_collections(&mut self, files: Vec<String>) -> Result<(), EngineError> {
        self.input = files
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::new(self.name(), "no input file given"))?;
        Ok(())
    }

    fn create_context(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn seek(&mut self, index: i64) -> Result<(), SeekError> {
        if !(0..TOTAL_EVENTS).contains(&index) {
            return Err(SeekError::NotFound(index));
        }
        Ok(())
    }

    fn release_context(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Counts events and writes one summary file per range into the run directory
#[derive(Default)]
struct NullProcessor {
    range: Option<String>,
    events_in_range: u64,
}

impl EventProcessor for NullProcessor {
    fn begin_range(&mut self, range_id: Option<&str>) {
        match range_id {
            Some(id) => {
                self.range = Some(id.to_string());
                self.events_in_range = 0;
            }
            None => {
                let Some(id) = self.range.take() else {
                    return;
                };
                let summary = format!("{} events\n", self.events_in_range);
                if let Err(e) = std::fs::write(format!("null.out.{id}"), summary) {
                    warn!("cannot write output of range {}: {}", id, e);
                }
            }
        }
    }

    fn next_event(&mut self, _event_number: i64) -> Result<(), EngineError> {
        self.events_in_range += 1;
        Ok(())
    }

    fn execute_run(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

fn null_engine() -> WorkerEngine {
    WorkerEngine::new(
        Box::new(NullSource {
            input: "null.pool.root".to_string(),
        }),
        Box::new(NullProcessor::default()),
    )
}

// ============================================================================
// Range service
// ============================================================================

#[derive(Default)]
struct Ranges {
    pending: VecDeque<String>,
    /// Range currently held by each worker PID
    in_flight: HashMap<Pid, String>,
    done: usize,
}

fn serve_worker(mut peer: RangeConnection, ranges: Arc<Mutex<Ranges>>) {
    loop {
        let Ok(ping) = peer.recv() else {
            return;
        };
        let pid: Pid = String::from_utf8_lossy(&ping)
            .split_whitespace()
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();

        let next = {
            let mut ranges = ranges.lock().unwrap_or_else(|e| e.into_inner());
            let next = ranges.pending.pop_front();
            if let Some(range) = &next {
                ranges.in_flight.insert(pid, range.clone());
            }
            next
        };
        let Some(range) = next else {
            let _ = peer.send(b"\0");
            return;
        };
        if peer.send(range.as_bytes()).is_err() {
            return;
        }

        let Ok(report) = peer.recv() else {
            return;
        };
        let mut ranges = ranges.lock().unwrap_or_else(|e| e.into_inner());
        ranges.in_flight.remove(&pid);
        match FailureReport::decode(&report) {
            Some(failure) => warn!(pid, "range {} failed: {}", range, failure.status),
            None => {
                ranges.done += 1;
                info!("{}", String::from_utf8_lossy(&report));
            }
        }
    }
}

/// Put the range of every crashed worker back in the queue until the drain sentinel
fn watch_failures(failed: Arc<SharedQueue<Pid>>, ranges: Arc<Mutex<Ranges>>) {
    while let Ok(pid) = failed.receive_basic() {
        if pid == DRAIN_SENTINEL {
            info!("range service released");
            return;
        }
        let mut ranges = ranges.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(range) = ranges.in_flight.remove(&pid) {
            warn!(pid, "worker crashed, re-queueing {}", range);
            ranges.pending.push_front(range);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.pool_worker {
        return rangepool::run_with_cli(cli, null_engine);
    }

    rangepool::init_tracing(cli.verbose);
    let mut config = rangepool::load_config(&cli)?;
    cli.apply(&mut config);

    let mut coordinator = Coordinator::new(&config, cli.verbose)?;
    let listener = RangeListener::bind(coordinator.channel_path())?;

    let ranges = Arc::new(Mutex::new(Ranges {
        pending: (0..TOTAL_EVENTS / RANGE_SIZE)
            .map(|i| {
                let start = i * RANGE_SIZE + 1;
                format!("Range-{i},{start},{}", start + RANGE_SIZE - 1)
            })
            .collect(),
        ..Ranges::default()
    }));

    let service_ranges = Arc::clone(&ranges);
    std::thread::spawn(move || {
        while let Ok(peer) = listener.accept() {
            let ranges = Arc::clone(&service_ranges);
            std::thread::spawn(move || serve_worker(peer, ranges));
        }
    });

    let failed = coordinator.failed_pids();
    let watcher_ranges = Arc::clone(&ranges);
    let watcher = std::thread::spawn(move || watch_failures(failed, watcher_ranges));

    let reports = coordinator.run()?;
    let _ = watcher.join();
    // The accept thread still owns the listener
    let _ = std::fs::remove_file(coordinator.channel_path());

    let ranges = ranges.lock().unwrap_or_else(|e| e.into_inner());
    let processed: i32 = reports.iter().filter_map(|r| r.processed_events).sum();
    println!(
        "{} ranges done, {} left, {} events processed by {} workers",
        ranges.done,
        ranges.pending.len(),
        processed,
        reports.len()
    );
    Ok(())
}
