//! Durable sink plumbing: bounded retry, error mapping, and the staging guard
//! that discards unfinished artifacts.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use foundry_core::FoundryError;
use rusqlite::{Connection, ErrorCode};

const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(25);

pub(crate) fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(err.sqlite_error_code(), Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked))
}

pub(crate) fn map_sqlite_error(
    operation: &str,
    attempts: u32,
    err: &rusqlite::Error,
) -> FoundryError {
    let operation = operation.to_string();
    let detail = err.to_string();
    if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        FoundryError::IntegrityViolation { operation, detail }
    } else {
        FoundryError::DurableIo { operation, attempts, detail }
    }
}

pub(crate) fn io_error(operation: &str, path: &Path, err: &std::io::Error) -> FoundryError {
    FoundryError::DurableIo {
        operation: operation.to_string(),
        attempts: 1,
        detail: format!("{}: {err}", path.display()),
    }
}

/// Run `work` up to `max_attempts` times while the database reports
/// `BUSY`/`LOCKED`. Any other failure is returned immediately.
pub(crate) fn with_retry<T>(
    conn: &mut Connection,
    max_attempts: u32,
    operation: &str,
    mut work: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
) -> Result<T, FoundryError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match work(conn) {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < max_attempts => {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %err,
                    "retrying busy artifact write"
                );
                thread::sleep(RETRY_BACKOFF_STEP * attempt);
                attempt += 1;
            }
            Err(err) => return Err(map_sqlite_error(operation, attempt, &err)),
        }
    }
}

/// Owns every file a builder session wrote. Unless committed, dropping the
/// guard deletes them. Must be declared after the connection in its owner so
/// the connection closes first.
#[derive(Debug)]
pub(crate) struct StagingGuard {
    staging: Option<PathBuf>,
    written: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
    committed: bool,
}

impl StagingGuard {
    pub(crate) fn new(staging: Option<PathBuf>) -> Self {
        Self { staging, written: Vec::new(), created_dirs: Vec::new(), committed: false }
    }

    pub(crate) fn staging_path(&self) -> Option<&Path> {
        self.staging.as_deref()
    }

    pub(crate) fn track_file(&mut self, path: PathBuf) {
        self.written.push(path);
    }

    pub(crate) fn track_dir(&mut self, path: PathBuf) {
        self.created_dirs.push(path);
    }

    /// Move the staging file into place and keep all written files.
    pub(crate) fn commit(mut self, output: Option<&Path>) -> Result<(), FoundryError> {
        if let (Some(staging), Some(output)) = (self.staging.as_deref(), output) {
            fs::rename(staging, output).map_err(|err| io_error("finalize artifact", output, &err))?;
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut targets = self.written.iter().collect::<Vec<_>>();
        if let Some(staging) = &self.staging {
            targets.push(staging);
        }
        if !targets.is_empty() {
            tracing::warn!(files = targets.len(), "discarding unfinished artifact");
        }
        for path in targets {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to remove staged file"
                    );
                }
            }
        }
        for dir in self.created_dirs.iter().rev() {
            let _ = fs::remove_dir(dir);
        }
    }
}
