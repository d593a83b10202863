//! Exclusive PID file handling for daemon mode.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::fcntl::{Flock, FlockArg};
use tracing::warn;

/// A PID file held under an exclusive advisory lock.
///
/// The lock is what detects an already-running instance; the file content
/// is for operators and init scripts. Dropping the value unlocks and
/// unlinks the file.
pub struct PidFile {
    path: PathBuf,
    lock: Flock<File>,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o640)
            .open(path)
            .with_context(|| format!("cannot open PID file {}", path.display()))?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_file, err)) => {
                anyhow::bail!(
                    "cannot lock PID file {} ({err}); is another instance running?",
                    path.display()
                );
            }
        };

        lock.set_len(0)
            .with_context(|| format!("cannot truncate PID file {}", path.display()))?;
        writeln!(lock, "{}", std::process::id())
            .with_context(|| format!("cannot write PID file {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            lock,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "could not remove PID file");
        }
        // The lock itself releases when the file closes.
        let _ = self.lock.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_pid_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dotd.pid");

        {
            let _pid = PidFile::create(&path).unwrap();
            let content = std::fs::read_to_string(&path).unwrap();
            assert_eq!(content.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_second_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dotd.pid");

        let _held = PidFile::create(&path).unwrap();
        assert!(PidFile::create(&path).is_err());
    }

    #[test]
    fn test_unwritable_path_fails() {
        assert!(PidFile::create(Path::new("/nonexistent-dir/dotd.pid")).is_err());
    }
}
