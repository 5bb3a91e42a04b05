//! Per-worker run directory preparation

use crate::settings::WORKER_LOG_NAME;
use std::fs::{DirBuilder, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Create the run directory (rwxr-xr-x). Fails if it already exists.
pub fn create_run_dir(path: &Path) -> std::io::Result<()> {
    DirBuilder::new().mode(0o755).create(path)
}

/// Point stdout and stderr of this process at `<run_dir>/worker.log`.
///
/// Everything written afterwards, including tracing output, lands in the file.
pub fn redirect_log(run_dir: &Path) -> std::io::Result<PathBuf> {
    let log_path = run_dir.join(WORKER_LOG_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fd = file.as_raw_fd();
    for target in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(log_path)
}

/// Copy every auxiliary file that exists as a regular file into `run_dir`.
/// Missing files are skipped. Returns the copies made.
pub fn copy_aux_files(files: &[PathBuf], run_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    for file in files {
        if !file.is_file() {
            continue;
        }
        let Some(name) = file.file_name() else {
            continue;
        };
        let dest = run_dir.join(name);
        std::fs::copy(file, &dest)?;
        copied.push(dest);
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_run_dir_refuses_existing() {
        let top = tempfile::tempdir().unwrap();
        let dir = top.path().join("worker_0");
        create_run_dir(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(
            create_run_dir(&dir).unwrap_err().kind(),
            std::io::ErrorKind::AlreadyExists
        );
    }

    #[test]
    fn test_copy_aux_files_skips_missing() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let present = src.path().join("SimParams.db");
        std::fs::write(&present, b"params").unwrap();
        let missing = src.path().join("PDGTABLE.MeV");

        let copied = copy_aux_files(&[present, missing], dst.path()).unwrap();
        assert_eq!(copied, vec![dst.path().join("SimParams.db")]);
        assert_eq!(std::fs::read(&copied[0]).unwrap(), b"params");
    }
}
