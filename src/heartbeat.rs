//! Daemon status heartbeats: small JSON files rewritten atomically each
//! cycle so the status CLI can report on daemons it cannot talk to.
//! Also home of the shared stop-a-daemon helper used by the `stop`
//! subcommands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::AppError;
use crate::fsutil;
use crate::procutil::{self, StopOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    Idle,
    Paused,
    Running,
}

impl EncoderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderState::Idle => "idle",
            EncoderState::Paused => "paused",
            EncoderState::Running => "running",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderStatus {
    pub pid: i32,
    pub state: EncoderState,
    pub current_job: Option<String>,
    pub last_job: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_tick: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerStatus {
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub interval_secs: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub next_poll: Option<DateTime<Utc>>,
    pub cycle_count: u64,
    #[serde(default)]
    pub live_now: Vec<String>,
    #[serde(default)]
    pub spawned_now: Vec<String>,
    pub last_tick: DateTime<Utc>,
}

pub fn encoder_status_path() -> PathBuf {
    config::state_dir().join("encoder").join("status.json")
}

pub fn poller_status_path() -> PathBuf {
    config::state_dir().join("poller").join("status.json")
}

pub fn encoder_lock_path() -> PathBuf {
    std::env::temp_dir().join("twitch-encoderd.lock")
}

pub fn poller_lock_path() -> PathBuf {
    std::env::temp_dir().join("twitch-pollerd.lock")
}

pub fn write<T: Serialize>(path: &Path, status: &T) {
    // A failed heartbeat write must never take the daemon down.
    if let Err(e) = fsutil::atomic_write_json(path, status) {
        tracing::warn!(path = ?path, error = %e, "failed to write status heartbeat");
    }
}

pub fn read<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    fsutil::read_json(path).ok()
}

pub fn remove(path: &Path) {
    let _ = fsutil::remove_if_exists(path);
}

/// Probe whether some process holds the given singleton lock.
pub fn singleton_held(lock_path: &Path) -> bool {
    use fs2::FileExt;
    let Ok(file) = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
    else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

/// Acquire a daemon singleton lock, failing fast when another instance
/// holds it. The file handle must stay alive for the daemon's lifetime.
pub fn acquire_singleton(lock_path: &Path) -> Result<std::fs::File, AppError> {
    use fs2::FileExt;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| AppError::Io(lock_path.to_path_buf(), e))?;
    file.try_lock_exclusive().map_err(|_| AppError::Busy)?;
    Ok(file)
}

#[derive(Debug)]
pub enum DaemonStopResult {
    NotRunning,
    Stopped { pid: i32, forced: bool },
    StillRunning { pid: i32 },
}

/// Stop a daemon identified by its status-file PID: SIGTERM, wait up to
/// `timeout`, optionally escalate to SIGKILL. Cleans the status file once
/// the process is gone.
pub async fn stop_daemon(status_path: &Path, timeout: Duration, force: bool) -> DaemonStopResult {
    #[derive(Deserialize)]
    struct PidOnly {
        pid: i32,
    }

    let Some(PidOnly { pid }) = read::<PidOnly>(status_path) else {
        return DaemonStopResult::NotRunning;
    };
    if !procutil::pid_alive(pid) {
        remove(status_path);
        return DaemonStopResult::NotRunning;
    }

    match procutil::signal_and_wait(pid, libc::SIGTERM, timeout, force).await {
        StopOutcome::NotRunning => {
            remove(status_path);
            DaemonStopResult::NotRunning
        }
        StopOutcome::Stopped { forced } => {
            remove(status_path);
            DaemonStopResult::Stopped { pid, forced }
        }
        StopOutcome::StillRunning => DaemonStopResult::StillRunning { pid },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_heartbeat_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("encoder").join("status.json");
        let status = EncoderStatus {
            pid: 1234,
            state: EncoderState::Paused,
            current_job: Some("job.json".into()),
            last_job: None,
            started_at: Utc::now(),
            last_tick: Utc::now(),
        };
        write(&path, &status);
        let back: EncoderStatus = read(&path).unwrap();
        assert_eq!(back.pid, 1234);
        assert_eq!(back.state, EncoderState::Paused);
        assert_eq!(back.current_job.as_deref(), Some("job.json"));
    }

    #[test]
    fn test_encoder_state_serializes_lowercase() {
        let json = serde_json::to_string(&EncoderState::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
    }

    #[test]
    fn test_singleton_lock() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("daemon.lock");
        assert!(!singleton_held(&lock_path));

        let held = acquire_singleton(&lock_path).unwrap();
        assert!(singleton_held(&lock_path));

        // A second instance fails fast.
        assert!(matches!(
            acquire_singleton(&lock_path),
            Err(AppError::Busy)
        ));

        drop(held);
        assert!(!singleton_held(&lock_path));
    }

    #[tokio::test]
    async fn test_stop_daemon_not_running() {
        let dir = TempDir::new().unwrap();
        let status_path = dir.path().join("status.json");

        // No status file at all.
        assert!(matches!(
            stop_daemon(&status_path, Duration::from_millis(10), false).await,
            DaemonStopResult::NotRunning
        ));

        // Status file with a dead PID gets cleaned.
        write(&status_path, &serde_json::json!({ "pid": i32::MAX }));
        assert!(matches!(
            stop_daemon(&status_path, Duration::from_millis(10), false).await,
            DaemonStopResult::NotRunning
        ));
        assert!(!status_path.exists());
    }
}
