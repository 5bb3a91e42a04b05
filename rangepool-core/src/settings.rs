//! Worker settings handed down from the coordinator through the environment.

use std::ffi::OsString;
use std::path::PathBuf;

/// Default prefix of per-worker run directories
pub const DEFAULT_DIR_PREFIX: &str = "worker_";

/// Name of the redirected log file inside a run directory
pub const WORKER_LOG_NAME: &str = "worker.log";

const TOPDIR_VAR: &str = "RANGEPOOL_TOPDIR";
const DIR_PREFIX_VAR: &str = "RANGEPOOL_DIR_PREFIX";
const RANGE_CHANNEL_VAR: &str = "RANGEPOOL_RANGE_CHANNEL";
const AUX_FILES_VAR: &str = "RANGEPOOL_AUX_FILES";
const DEBUG_VAR: &str = "RANGEPOOL_DEBUG";
const PILEUP_VAR: &str = "RANGEPOOL_PILEUP";
const REDIRECT_LOGS_VAR: &str = "RANGEPOOL_REDIRECT_LOGS";

/// Static configuration of a worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Directory the run directories are created in
    pub topdir: PathBuf,
    /// Run directory name prefix, followed by the rank
    pub dir_prefix: String,
    /// Socket path of the range channel
    pub range_channel: PathBuf,
    /// Files copied into the run directory when present
    pub aux_files: Vec<PathBuf>,
    /// Pause bootstrap until SIGUSR1 and keep logs on the terminal
    pub debug: bool,
    /// Restart secondary event sources too
    pub pileup: bool,
    /// Redirect stdout/stderr into the run directory
    pub redirect_logs: bool,
}

impl WorkerSettings {
    /// Settings with defaults for everything but the two paths
    pub fn new(topdir: impl Into<PathBuf>, range_channel: impl Into<PathBuf>) -> Self {
        Self {
            topdir: topdir.into(),
            dir_prefix: DEFAULT_DIR_PREFIX.to_string(),
            range_channel: range_channel.into(),
            aux_files: Vec::new(),
            debug: false,
            pileup: false,
            redirect_logs: true,
        }
    }

    /// Run directory of the worker holding `rank`
    pub fn run_dir(&self, rank: i32) -> PathBuf {
        self.topdir.join(format!("{}{}", self.dir_prefix, rank))
    }

    /// Log file of the worker holding `rank`
    pub fn log_file(&self, rank: i32) -> PathBuf {
        self.run_dir(rank).join(WORKER_LOG_NAME)
    }

    /// Environment a spawned worker needs to rebuild these settings
    pub fn to_env(&self) -> Vec<(&'static str, OsString)> {
        let flag = |b: bool| OsString::from(if b { "1" } else { "0" });
        let aux = std::env::join_paths(&self.aux_files).unwrap_or_default();
        vec![
            (TOPDIR_VAR, self.topdir.clone().into_os_string()),
            (DIR_PREFIX_VAR, OsString::from(&self.dir_prefix)),
            (RANGE_CHANNEL_VAR, self.range_channel.clone().into_os_string()),
            (AUX_FILES_VAR, aux),
            (DEBUG_VAR, flag(self.debug)),
            (PILEUP_VAR, flag(self.pileup)),
            (REDIRECT_LOGS_VAR, flag(self.redirect_logs)),
        ]
    }

    /// Rebuild settings from the process environment
    pub fn from_env() -> Option<Self> {
        Self::from_vars(|name| std::env::var_os(name))
    }

    /// Rebuild settings from any variable lookup. `None` if a path is missing.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<OsString>) -> Option<Self> {
        let topdir = PathBuf::from(lookup(TOPDIR_VAR)?);
        let range_channel = PathBuf::from(lookup(RANGE_CHANNEL_VAR)?);
        let flag = |name: &str, default: bool| {
            lookup(name)
                .map(|v| v.as_os_str() == "1")
                .unwrap_or(default)
        };

        Some(Self {
            topdir,
            dir_prefix: lookup(DIR_PREFIX_VAR)
                .and_then(|v| v.into_string().ok())
                .unwrap_or_else(|| DEFAULT_DIR_PREFIX.to_string()),
            range_channel,
            aux_files: lookup(AUX_FILES_VAR)
                .map(|v| {
                    std::env::split_paths(&v)
                        .filter(|p| !p.as_os_str().is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            debug: flag(DEBUG_VAR, false),
            pileup: flag(PILEUP_VAR, false),
            redirect_logs: flag(REDIRECT_LOGS_VAR, true),
        })
    }
}
