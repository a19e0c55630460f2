//! Log file table: a dedup-by-path list of append-only log sinks. Grounded
//! on `nxt_runtime_log_files_init`/`nxt_runtime_log_file_add`/
//! `nxt_runtime_log_files_create`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tracing::info;

/// Log levels a sink can be opened at. Only `Crit` is produced by this
/// crate today; the field exists because the original tracks it per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Crit,
}

#[derive(Debug)]
pub struct LogFile {
    pub path: Option<PathBuf>,
    pub level: LogLevel,
    file: Option<File>,
}

/// Dedup-by-normalized-path list of log sinks. The first entry, preallocated
/// at construction, is the main error log.
pub struct LogFileTable {
    prefix: PathBuf,
    files: Vec<LogFile>,
}

impl LogFileTable {
    /// Preallocates the main error log entry with no path yet assigned
    /// (the path is filled in once argument parsing resolves `--log`).
    pub fn new(prefix: PathBuf) -> Self {
        Self {
            prefix,
            files: vec![LogFile {
                path: None,
                level: LogLevel::Crit,
                file: None,
            }],
        }
    }

    /// Resolves `path` against `prefix` unless absolute, then returns the
    /// existing entry with an equal normalized path, or appends a new one.
    pub fn add(&mut self, path: impl AsRef<Path>) -> usize {
        let resolved = self.resolve(path.as_ref());

        if let Some(idx) = self
            .files
            .iter()
            .position(|f| f.path.as_deref() == Some(resolved.as_path()))
        {
            return idx;
        }

        self.files.push(LogFile {
            path: Some(resolved),
            level: LogLevel::Crit,
            file: None,
        });
        self.files.len() - 1
    }

    /// Sets the main error log's path (index 0), deduplicating the same way
    /// `add` does.
    pub fn set_main(&mut self, path: impl AsRef<Path>) {
        let resolved = self.resolve(path.as_ref());
        self.files[0].path = Some(resolved);
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.prefix.join(path)
        }
    }

    /// Opens every entry `O_WRONLY | O_APPEND | O_CREAT`, owner-only
    /// access, and duplicates the first entry onto stderr.
    pub fn materialize(&mut self) -> Result<()> {
        for entry in &mut self.files {
            let path = entry
                .path
                .clone()
                .unwrap_or_else(|| self.prefix.join("error.log"));

            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o600)
                .open(&path)
                .wrap_err_with(|| format!("opening log file {}", path.display()))?;

            info!(path = %path.display(), "log file opened");
            entry.file = Some(file);
        }

        if let Some(main) = self.files.first() {
            if let Some(file) = &main.file {
                bind_stderr(file)?;
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(unix)]
fn bind_stderr(file: &File) -> Result<()> {
    use std::os::fd::AsRawFd;
    let ret = unsafe { libc::dup2(file.as_raw_fd(), libc::STDERR_FILENO) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error())
            .wrap_err("duplicating log fd onto stderr");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_dedups_by_normalized_path() {
        let dir = tempdir().unwrap();
        let mut table = LogFileTable::new(dir.path().to_path_buf());

        let a = table.add("access.log");
        let b = table.add("access.log");
        assert_eq!(a, b);
        assert_eq!(table.len(), 2); // main entry + access.log
    }

    #[test]
    fn relative_paths_resolve_against_prefix() {
        let dir = tempdir().unwrap();
        let mut table = LogFileTable::new(dir.path().to_path_buf());
        table.add("sub/app.log");

        assert_eq!(
            table.files[1].path.as_deref(),
            Some(dir.path().join("sub/app.log").as_path())
        );
    }

    #[test]
    fn absolute_paths_are_kept_as_is() {
        let dir = tempdir().unwrap();
        let mut table = LogFileTable::new(dir.path().to_path_buf());
        let abs = dir.path().join("abs.log");
        table.add(&abs);

        assert_eq!(table.files[1].path.as_deref(), Some(abs.as_path()));
    }

    #[test]
    fn materialize_opens_owner_only_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let mut table = LogFileTable::new(dir.path().to_path_buf());
        table.set_main("main.log");
        table.add("extra.log");
        table.materialize().unwrap();

        let meta = std::fs::metadata(dir.path().join("extra.log")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
