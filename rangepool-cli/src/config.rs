//! Configuration loading from rangepool.toml
//!
//! Pool settings can be given in a `rangepool.toml` file. The file is
//! discovered by walking up from the current directory; command line flags
//! override what it says.

use rangepool_core::{DEFAULT_DIR_PREFIX, WorkerSettings};
use rangepool_ipc::channel_path;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the discovered configuration file
pub const CONFIG_FILE_NAME: &str = "rangepool.toml";

/// RangePool configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolConfig {
    /// Pool configuration
    #[serde(default)]
    pub pool: PoolSection,
    /// Range service channel configuration
    #[serde(default)]
    pub channels: ChannelSection,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// Number of workers, -1 for one per CPU
    #[serde(default = "default_workers")]
    pub workers: i64,
    /// Directory the per-worker run directories are created in
    #[serde(default = "default_topdir")]
    pub topdir: PathBuf,
    /// Run directory prefix, followed by the rank
    #[serde(default = "default_dir_prefix")]
    pub worker_dir_prefix: String,
    /// Bound on one wait for a worker exit (e.g. "100ms")
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: String,
    /// Pause each worker's bootstrap until SIGUSR1
    #[serde(default)]
    pub debug: bool,
    /// Restart secondary event sources as well
    #[serde(default)]
    pub pileup: bool,
    /// Small files copied into every run directory when present
    #[serde(default = "default_aux_files")]
    pub aux_files: Vec<PathBuf>,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            topdir: default_topdir(),
            worker_dir_prefix: default_dir_prefix(),
            wait_timeout: default_wait_timeout(),
            debug: false,
            pileup: false,
            aux_files: default_aux_files(),
        }
    }
}

fn default_workers() -> i64 {
    -1
}
fn default_topdir() -> PathBuf {
    PathBuf::from(".")
}
fn default_dir_prefix() -> String {
    DEFAULT_DIR_PREFIX.to_string()
}
fn default_wait_timeout() -> String {
    "100ms".to_string()
}
fn default_aux_files() -> Vec<PathBuf> {
    ["SimParams.db", "DigitParams.db", "PDGTABLE.MeV"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

/// Range service channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    /// Base name of the range channel socket
    #[serde(default = "default_range_channel")]
    pub range_channel: String,
    /// Directory holding the channel socket
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Run-unique suffix; derived per run when unset
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            range_channel: default_range_channel(),
            socket_dir: default_socket_dir(),
            token: None,
        }
    }
}

fn default_range_channel() -> String {
    "EventService_EventRanges".to_string()
}
fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}

impl ChannelSection {
    /// The configured token, or one made from this process's PID and start time
    pub fn resolve_token(&self) -> String {
        self.token.clone().unwrap_or_else(|| {
            let started = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default();
            format!("{}_{}", std::process::id(), started)
        })
    }

    /// Socket path of the range channel for `token`
    pub fn socket_path(&self, token: &str) -> PathBuf {
        channel_path(&self.socket_dir, &self.range_channel, token)
    }
}

impl PoolConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path).ok();
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Settings handed to every worker of a run on `range_channel`
    pub fn worker_settings(&self, range_channel: PathBuf) -> WorkerSettings {
        let mut settings = WorkerSettings::new(self.pool.topdir.clone(), range_channel);
        settings.dir_prefix = self.pool.worker_dir_prefix.clone();
        settings.aux_files = self.pool.aux_files.clone();
        settings.debug = self.pool.debug;
        settings.pileup = self.pool.pileup;
        settings
    }

    /// The wait timeout as a [`Duration`]
    pub fn wait_timeout(&self) -> anyhow::Result<Duration> {
        Ok(Duration::from_nanos(Self::parse_duration(
            &self.pool.wait_timeout,
        )?))
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# RangePool Configuration

[pool]
# Number of worker processes, -1 for one per CPU
workers = -1
# Directory the worker run directories are created in
topdir = "."
# Run directory prefix, followed by the worker rank
worker_dir_prefix = "worker_"
# Bound on one wait for a worker exit
wait_timeout = "100ms"
# Pause worker bootstrap until SIGUSR1 (attach a debugger first)
debug = false
# Restart secondary event sources too
pileup = false
# Copied into every run directory when present
aux_files = ["SimParams.db", "DigitParams.db", "PDGTABLE.MeV"]

[channels]
# Base name of the range channel socket
range_channel = "EventService_EventRanges"
# Directory of the channel socket (uncomment to override the temp dir)
# socket_dir = "/tmp"
# Run-unique suffix (uncomment to pin it)
# token = "run42"
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m") to nanoseconds
    pub fn parse_duration(s: &str) -> anyhow::Result<u64> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok((value * multiplier as f64) as u64)
    }
}
