use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the storage engine.
///
/// Validation errors (`Config`, `InvalidArgument`) are raised synchronously
/// before any file I/O or background work is scheduled. Background flush and
/// compaction failures never reach callers directly; they are counted and
/// exposed through the property registry instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid open-time configuration, rejected before any I/O.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation is valid only in a mode this instance was not opened in.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Checksum or format mismatch in a WAL, table, or manifest file.
    #[error("corruption in {context}: {detail}")]
    Corruption {
        context: &'static str,
        detail: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Memory or disk limits reached; the write path rejects new writes
    /// until the condition is relieved.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A catch-up was requested while another is already running.
    #[error("catch-up already in progress")]
    CatchUpInProgress,

    /// The primary rotated files out from under a secondary catch-up.
    /// Recoverable: the caller should retry the catch-up.
    #[error("stale version reference: {0}")]
    StaleVersion(String),

    /// A caller-supplied argument was rejected (empty key, empty value).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Write attempted against a frozen memtable; the write path retries
    /// against the new active memtable.
    #[error("memtable is frozen")]
    MemtableFrozen,

    /// One or more entries of a batched option change failed. Entries that
    /// validated successfully have already been applied.
    #[error("failed to apply options: {0:?}")]
    InvalidOptions(Vec<(String, String)>),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The instance has been closed.
    #[error("database is closed")]
    Shutdown,

    #[error("lock poisoned")]
    LockPoisoned,
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned
    }
}

impl Error {
    pub(crate) fn corruption(context: &'static str, detail: impl Into<String>) -> Self {
        Error::Corruption {
            context,
            detail: detail.into(),
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::StaleVersion(_) | Error::CatchUpInProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_corruption_display() {
        let err = Error::corruption("wal record", "checksum mismatch");
        assert_eq!(
            err.to_string(),
            "corruption in wal record: checksum mismatch"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::StaleVersion("table 3 missing".into()).is_recoverable());
        assert!(Error::CatchUpInProgress.is_recoverable());
        assert!(!Error::Shutdown.is_recoverable());
        assert!(!Error::Config("bad".into()).is_recoverable());
    }
}
