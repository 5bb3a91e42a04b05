#![warn(missing_docs)]
//! RangePool CLI Library
//!
//! Coordinator side of the worker pool and the command line driver.
//! An application hands its engine factory to [`run`]; the same executable
//! then acts as the coordinator or, when started with the hidden worker
//! flag, as one of its workers.
//!
//! # Example
//!
//! ```ignore
//! fn main() -> anyhow::Result<()> {
//!     rangepool_cli::run(|| my_engine())
//! }
//! ```

mod config;
mod pool;
mod process;

#[cfg(test)]
mod testing;

pub use config::*;
pub use pool::*;
pub use process::*;

use anyhow::Context;
use clap::Parser;
use rangepool_core::WorkerEngine;
use rangepool_ipc::{Pid, SharedQueue};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// RangePool CLI arguments
#[derive(Parser, Debug, Default)]
#[command(name = "rangepool")]
#[command(author, version, about = "RangePool - multi-process event range worker pool")]
pub struct Cli {
    /// Number of worker processes, -1 for one per CPU
    #[arg(short = 'j', long, allow_hyphen_values = true)]
    pub workers: Option<i64>,

    /// Directory the worker run directories are created in
    #[arg(long)]
    pub topdir: Option<PathBuf>,

    /// Configuration file (default: discover rangepool.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run-unique token of the range channel
    #[arg(long)]
    pub token: Option<String>,

    /// Pause each worker's bootstrap until it receives SIGUSR1
    #[arg(long)]
    pub debug: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Internal: Run as worker process (used by the pool manager)
    #[arg(long, hide = true)]
    pub pool_worker: bool,
}

impl Cli {
    /// Apply command line overrides on top of `config`
    pub fn apply(&self, config: &mut PoolConfig) {
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        if let Some(topdir) = &self.topdir {
            config.pool.topdir = topdir.clone();
        }
        if let Some(token) = &self.token {
            config.channels.token = Some(token.clone());
        }
        if self.debug {
            config.pool.debug = true;
        }
    }
}

/// Pool manager over real worker processes
pub type ProcessPool = PoolManager<UnixProcessGroup, Arc<SharedQueue<i32>>, Arc<SharedQueue<Pid>>>;

/// A configured pool, ready to run
pub struct Coordinator {
    pool: ProcessPool,
    failures: Arc<SharedQueue<Pid>>,
    channel: PathBuf,
    count: WorkerCount,
    topdir: PathBuf,
}

impl Coordinator {
    /// Build the queues and process group described by `config`
    pub fn new(config: &PoolConfig, verbose: bool) -> anyhow::Result<Self> {
        let count = WorkerCount::from_raw(config.pool.workers)?;
        let topdir = std::path::absolute(&config.pool.topdir)
            .with_context(|| format!("resolving {}", config.pool.topdir.display()))?;
        let token = config.channels.resolve_token();
        let channel = config.channels.socket_path(&token);

        let ranks = Arc::new(SharedQueue::<i32>::new(format!("ranks_{token}"))?);
        let failures = Arc::new(SharedQueue::<Pid>::new(format!("failed_pids_{token}"))?);

        let mut settings = config.worker_settings(channel.clone());
        settings.topdir = topdir.clone();
        let mut group = UnixProcessGroup::new(settings, ranks.inheritable_fd())?;
        if verbose {
            group = group.arg("--verbose");
        }

        let pool = PoolManager::new(group, ranks, Arc::clone(&failures))
            .with_wait_timeout(config.wait_timeout()?)
            .with_dir_prefix(config.pool.worker_dir_prefix.clone());

        Ok(Self {
            pool,
            failures,
            channel,
            count,
            topdir,
        })
    }

    /// Socket path the range service must listen on
    pub fn channel_path(&self) -> &Path {
        &self.channel
    }

    /// Queue of crashed worker PIDs, ending with the drain sentinel
    pub fn failed_pids(&self) -> Arc<SharedQueue<Pid>> {
        Arc::clone(&self.failures)
    }

    /// The pool manager
    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    /// Create the pool and drive it until every worker has left.
    /// Worker statuses are reported whether or not the run succeeded.
    pub fn run(&mut self) -> Result<Vec<WorkerReport>, PoolError> {
        info!(channel = %self.channel.display(), "starting worker pool");
        let outcome = self
            .pool
            .create_pool(self.count, &self.topdir)
            .and_then(|_| self.pool.run_until_drained());

        let reports = self.pool.report_statuses();
        for log in self.pool.sub_process_logs() {
            info!("worker log: {}", log.display());
        }
        outcome.map(|()| reports)
    }
}

/// Initialize the tracing subscriber (`rangepool=info`, or debug when verbose)
pub fn init_tracing(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_env_filter("rangepool=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("rangepool=info")
            .init();
    }
}

/// Run the RangePool CLI with the process arguments.
/// `engine` builds the event processing engine inside each worker.
pub fn run<E>(engine: E) -> anyhow::Result<()>
where
    E: FnOnce() -> WorkerEngine,
{
    let cli = Cli::parse();
    run_with_cli(cli, engine)
}

/// Run the RangePool CLI with pre-parsed arguments.
pub fn run_with_cli<E>(cli: Cli, engine: E) -> anyhow::Result<()>
where
    E: FnOnce() -> WorkerEngine,
{
    init_tracing(cli.verbose);

    // Worker mode first, before any coordinator setup
    if cli.pool_worker {
        return run_worker_mode(engine);
    }

    let mut config = load_config(&cli)?;
    cli.apply(&mut config);

    let mut coordinator = Coordinator::new(&config, cli.verbose)?;
    match coordinator.run() {
        Ok(reports) => {
            info!("{} workers finished", reports.len());
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}

/// The configuration named on the command line, else the discovered one
pub fn load_config(cli: &Cli) -> anyhow::Result<PoolConfig> {
    match &cli.config {
        Some(path) => PoolConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display())),
        None => Ok(PoolConfig::discover().unwrap_or_default()),
    }
}

/// Run as a worker process (IPC mode)
fn run_worker_mode<E>(engine: E) -> anyhow::Result<()>
where
    E: FnOnce() -> WorkerEngine,
{
    rangepool_core::run_worker(engine()).map_err(|e| anyhow::anyhow!("Worker error: {}", e))
}
