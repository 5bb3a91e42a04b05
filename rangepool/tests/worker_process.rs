//! Tests against real worker processes
//!
//! This target runs without the libtest harness. The process group
//! re-executes this same binary with `--pool-worker`, so `main` is both the
//! test runner and the worker entry point.

use clap::Parser;
use rangepool::{
    Cli, DRAIN_SENTINEL, EngineError, EventProcessor, EventSource, FailureReport, Pid,
    PoolManager, ProcessGroup, RangeListener, RangeTransport, SeekError, SharedQueue,
    UnixProcessGroup, WorkerCount, WorkerEngine, WorkerSettings, channel_path,
};
use rangepool_cli::WORKER_FLAG;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// ============================================================================
// Worker side
// ============================================================================

struct StubSource;

impl EventSource for StubSource {
    fn name(&self) -> &str {
        "StubSource"
    }

    fn restart(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn input_collections(&self) -> Result<Vec<String>, EngineError> {
        Ok(vec!["input.pool.root".to_string()])
    }

    fn set_input_collections(&mut self, _files: Vec<String>) -> Result<(), EngineError> {
        Ok(())
    }

    fn create_context(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn seek(&mut self, index: i64) -> Result<(), SeekError> {
        if index >= 100 {
            return Err(SeekError::NotFound(index));
        }
        Ok(())
    }

    fn release_context(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Writes one output file per range into the working directory.
/// Aborts on the first event of any range whose id starts with `Crash`.
#[derive(Default)]
struct OutputWriter {
    range: Option<String>,
}

impl EventProcessor for OutputWriter {
    fn begin_range(&mut self, range_id: Option<&str>) {
        match range_id {
            Some(id) => self.range = Some(id.to_string()),
            None => {
                if let Some(id) = self.range.take() {
                    let _ = std::fs::write(format!("out.pool.root.{id}"), b"events");
                }
            }
        }
    }

    fn next_event(&mut self, _event_number: i64) -> Result<(), EngineError> {
        if self.range.as_deref().is_some_and(|id| id.starts_with("Crash")) {
            std::process::abort();
        }
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

fn stub_engine() -> WorkerEngine {
    WorkerEngine::new(Box::new(StubSource), Box::new(OutputWriter::default()))
}

// ============================================================================
// Coordinator side
// ============================================================================

#[derive(Debug, Default)]
struct ServiceLog {
    /// Every range sent, with the PID from the readiness message it answered
    handed_out: Vec<(Pid, String)>,
    /// Ranges whose worker hung up before reporting
    abandoned: Vec<(Pid, String)>,
    outputs: Vec<String>,
    failures: Vec<FailureReport>,
}

/// Serve `ranges` to `connections` workers in turn. Abandoned ranges are not served again.
fn serve_ranges(
    listener: RangeListener,
    ranges: Vec<&'static str>,
    connections: usize,
) -> JoinHandle<ServiceLog> {
    std::thread::spawn(move || {
        let mut ranges = VecDeque::from(ranges);
        let mut log = ServiceLog::default();
        for _ in 0..connections {
            let mut peer = listener.accept().unwrap();
            while let Ok(ping) = peer.recv() {
                let pid: Pid = String::from_utf8(ping)
                    .unwrap()
                    .split_whitespace()
                    .next()
                    .and_then(|p| p.parse().ok())
                    .unwrap();
                let Some(range) = ranges.pop_front() else {
                    peer.send(b"\0").unwrap();
                    break;
                };
                peer.send(range.as_bytes()).unwrap();
                log.handed_out.push((pid, range.to_string()));
                let Ok(report) = peer.recv() else {
                    log.abandoned.push((pid, range.to_string()));
                    break;
                };
                match FailureReport::decode(&report) {
                    Some(failure) => log.failures.push(failure),
                    None => log.outputs.push(String::from_utf8(report).unwrap()),
                }
            }
        }
        log
    })
}

fn worker_group(top: &Path, channel: &Path, ranks: &SharedQueue<i32>) -> UnixProcessGroup {
    let binary = std::env::current_exe().unwrap();
    UnixProcessGroup::with_binary(
        binary,
        vec![OsString::from(WORKER_FLAG)],
        WorkerSettings::new(top, channel),
        ranks.inheritable_fd(),
    )
    .unwrap()
    .hello_timeout(Duration::from_secs(10))
}

/// Test that a worker released right after its hello exits with status 0
fn test_released_worker_exits_cleanly() {
    let top = tempfile::tempdir().unwrap();
    let channel = channel_path(top.path(), "EventService_EventRanges", "release");
    let ranks = SharedQueue::<i32>::new("ranks_release").unwrap();
    let mut group = worker_group(top.path(), &channel, &ranks);

    let pid = group.launch_process().unwrap();
    assert_eq!(group.live_workers(), 1);
    group.map_async(None, pid).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let exit = loop {
        if let Some(exit) = group.wait_once(Duration::from_millis(100)).unwrap() {
            break exit;
        }
        assert!(Instant::now() < deadline, "worker {pid} never exited");
    };
    assert_eq!(exit.pid, pid);
    assert!(exit.is_success(), "{exit}");
    assert_eq!(group.live_workers(), 0);
    assert_eq!(group.pull_one_result().unwrap(), None);
    // released before bootstrap: no rank taken, no run directory
    assert_eq!(ranks.try_receive().unwrap(), None);
    assert!(!top.path().join("worker_0").exists());
}

/// Test a full pool run where one worker aborts while it holds a range
fn test_crash_in_exec_is_replaced() {
    let top = tempfile::tempdir().unwrap();
    let channel = channel_path(top.path(), "EventService_EventRanges", "crash");
    let listener = RangeListener::bind(&channel).unwrap();
    // the first worker takes Range-1 then dies on Crash-1; its replacement takes Range-2
    let service = serve_ranges(listener, vec!["Range-1,1,3", "Crash-1,4,4", "Range-2,5,6"], 2);

    let ranks = Arc::new(SharedQueue::<i32>::new("ranks_crash").unwrap());
    let failures = Arc::new(SharedQueue::<Pid>::new("failed_pids_crash").unwrap());
    let group = worker_group(top.path(), &channel, &ranks);
    let mut pool = PoolManager::new(group, ranks, Arc::clone(&failures))
        .with_wait_timeout(Duration::from_millis(100));

    let one = WorkerCount::Fixed(NonZeroUsize::new(1).unwrap());
    assert_eq!(pool.create_pool(one, top.path()).unwrap(), 1);
    pool.run_until_drained().unwrap();

    let exits = pool.group().statuses().to_vec();
    assert_eq!(exits.len(), 2);
    let (crashed, replacement) = (exits[0], exits[1]);
    assert_eq!(crashed.signal, Some(libc::SIGABRT));
    assert!(replacement.is_success(), "{replacement}");
    assert_eq!(pool.worker_count(), 2);

    // the crashed PID, then the sentinel once the replacement left
    assert_eq!(
        failures.drain().unwrap(),
        vec![crashed.pid, DRAIN_SENTINEL]
    );
    assert_eq!(pool.processed_events(crashed.pid), None);
    assert_eq!(pool.processed_events(replacement.pid), Some(2));

    let log = service.join().unwrap();
    assert_eq!(
        log.handed_out,
        vec![
            (crashed.pid, "Range-1,1,3".to_string()),
            (crashed.pid, "Crash-1,4,4".to_string()),
            (replacement.pid, "Range-2,5,6".to_string()),
        ]
    );
    assert_eq!(log.abandoned, vec![(crashed.pid, "Crash-1,4,4".to_string())]);
    assert_eq!(log.outputs.len(), 2);
    assert!(log.failures.is_empty());

    let top = top.path();
    assert!(top.join("worker_0/out.pool.root.Range-1").is_file());
    assert!(top.join("worker_1/out.pool.root.Range-2").is_file());
    assert!(top.join("worker_1/worker.log").is_file());

    let reports = pool.report_statuses();
    assert_eq!(reports.len(), 2);
    assert!(!reports[0].success);
    assert!(reports[1].success);
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == WORKER_FLAG) {
        return rangepool::run_with_cli(Cli::parse(), stub_engine);
    }

    let tests: [(&str, fn()); 2] = [
        ("test_released_worker_exits_cleanly", test_released_worker_exits_cleanly),
        ("test_crash_in_exec_is_replaced", test_crash_in_exec_is_replaced),
    ];
    for (name, test) in tests {
        println!("test {name} ...");
        test();
        println!("test {name} ... ok");
    }
    Ok(())
}
