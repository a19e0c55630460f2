//! Scoped creation and deletion of the pid file. Grounded on
//! `nxt_runtime_pid_file_create` and the `rt->type <= NXT_PROCESS_MASTER`
//! deletion check in `nxt_runtime_exit`.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tracing::{debug, info};

/// Owner-only access, matching `NXT_FILE_DEFAULT_ACCESS` applied to pid
/// files in the source this is grounded on.
const PID_FILE_MODE: u32 = 0o600;

/// A created pid file. Not `Drop`-based removal: deletion is tied to the
/// supervisor's exit stage (§4.6 stage 4), which only deletes the file for
/// roles `<= master`, not unconditionally on scope exit.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Opens `path` truncated, writes the decimal pid followed by a single
    /// line feed, and closes it immediately (no descriptor kept open).
    pub fn create(path: impl Into<PathBuf>, pid: i32) -> Result<Self> {
        let path = path.into();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(PID_FILE_MODE)
            .open(&path)
            .wrap_err_with(|| format!("creating pid file {}", path.display()))?;

        writeln!(file, "{}", pid).wrap_err("writing pid")?;

        info!(path = %path.display(), pid, "pid file written");

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the pid file. Idempotent: a missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "pid file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).wrap_err_with(|| format!("removing pid file {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_decimal_pid_with_trailing_newline_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pid");

        PidFile::create(&path, 4242).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "4242\n");
    }

    #[test]
    fn create_truncates_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pid");
        std::fs::write(&path, "999999999\nstale").unwrap();

        PidFile::create(&path, 7).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7\n");
    }

    #[test]
    fn mode_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pid");
        PidFile::create(&path, 1).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pid");
        let pid_file = PidFile::create(&path, 1).unwrap();

        pid_file.remove().unwrap();
        assert!(!path.exists());
        pid_file.remove().unwrap();
    }
}
