//! Error taxonomy shared by every component, with the process exit-code map.

use std::path::PathBuf;

use thiserror::Error;

/// Process exit codes surfaced to operators and to the poller's spawned
/// recorders. Anything not covered below exits with `FAILURE`.
pub mod exit {
    pub const OK: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const BUSY: i32 = 3;
    pub const NOT_LIVE: i32 = 4;
    pub const DISK_LOW: i32 = 5;
}

#[derive(Debug, Error)]
pub enum AppError {
    /// All recording slots are held and the caller asked to fail fast.
    #[error("no recording slot available")]
    Busy,

    /// The per-user lock is already held by another recorder.
    #[error("user '{0}' is already being recorded")]
    UserBusy(String),

    /// The stream never came up within the retry window.
    #[error("stream for '{0}' is not live")]
    NotLive(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("merge failed: {0}")]
    MergeFailed(String),

    #[error("remux failed: {0}")]
    RemuxFailed(String),

    #[error("failed to enqueue encode job: {0}")]
    EnqueueFailed(String),

    #[error("transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("free space below threshold: {free} bytes free, {min} required")]
    DiskLow { free: u64, min: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    /// An external tool is missing or unusable.
    #[error("external tool unavailable: {0}")]
    External(String),

    #[error("{path}: {1}", path = .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Busy | AppError::UserBusy(_) => exit::BUSY,
            AppError::NotLive(_) => exit::NOT_LIVE,
            AppError::DiskLow { .. } => exit::DISK_LOW,
            AppError::Config(_) | AppError::External(_) => exit::USAGE,
            _ => exit::FAILURE,
        }
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(AppError::Busy.exit_code(), 3);
        assert_eq!(AppError::UserBusy("a".into()).exit_code(), 3);
        assert_eq!(AppError::NotLive("a".into()).exit_code(), 4);
        assert_eq!(AppError::DiskLow { free: 1, min: 2 }.exit_code(), 5);
        assert_eq!(AppError::External("streamlink".into()).exit_code(), 2);
        assert_eq!(AppError::MergeFailed("rc=1".into()).exit_code(), 1);
    }
}
