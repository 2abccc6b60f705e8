//! `doctor` checks the environment; `clean` sweeps the stale state a
//! crash can leave behind: dead owner records, inflight jobs from a
//! killed encoder, and temp/ residue from killed recorders.

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::fsutil;
use crate::heartbeat;
use crate::locks::{SlotRegistry, UserLock};
use crate::queue::JobQueue;
use crate::recorder;
use crate::tools;

/// Check external tools, directories and disk headroom. Returns false
/// when something would keep recordings or encodes from working.
pub async fn doctor(registry: &SlotRegistry, queue: &JobQueue, logs_dir: &Path) -> bool {
    let mut ok = true;

    for tool in [tools::CAPTURE_TOOL, tools::FFMPEG_TOOL] {
        match tools::which(tool) {
            Some(path) => {
                let version = tool_version(tool, &path).await;
                info!(tool, path = %path.display(), version = %version, "tool found");
            }
            None => {
                warn!(tool, "not found in PATH");
                ok = false;
            }
        }
    }

    info!(dir = %registry.dir().display(), limit = registry.limit(), "slots directory");
    match registry.sweep() {
        Ok(removed) if removed > 0 => info!(removed, "swept stale owner records"),
        Ok(_) => {}
        Err(e) => {
            warn!(error = %e, "failed to sweep slot registry");
            ok = false;
        }
    }

    info!(dir = %queue.jobs_dir().display(), "queue jobs directory");
    let inflight = std::fs::read_dir(queue.inflight_dir())
        .map(|entries| entries.count())
        .unwrap_or(0);
    if inflight > 0 {
        warn!(
            inflight,
            "inflight jobs left by a crashed encoder; run 'clean' or restart the daemon"
        );
    }

    if let Err(e) = std::fs::create_dir_all(logs_dir) {
        warn!(dir = %logs_dir.display(), error = %e, "logs directory not writable");
        ok = false;
    } else {
        info!(dir = %logs_dir.display(), "logs directory");
    }

    match fsutil::free_space(queue.base()) {
        Ok(free) => info!(free = %fsutil::human_size(free), "free space on queue volume"),
        Err(e) => warn!(error = %e, "could not determine free space"),
    }

    // Pausing transcodes relies on the kernel's stop/continue pair; on a
    // unix host that is always present.
    if cfg!(unix) {
        info!("child suspension (stop/continue) supported");
    } else {
        warn!("no stop/continue equivalent on this host; encoder pause will not work");
        ok = false;
    }

    if ok {
        info!("doctor: environment looks OK");
    } else {
        warn!("doctor: issues found (see above)");
    }
    ok
}

async fn tool_version(tool: &str, path: &Path) -> String {
    let flag = if tool == tools::FFMPEG_TOOL {
        "-version"
    } else {
        "--version"
    };
    let output = tokio::process::Command::new(path)
        .arg(flag)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .next()
            .unwrap_or("unknown")
            .trim()
            .to_string(),
        _ => "unknown".to_string(),
    }
}

#[derive(Debug, Default, Serialize)]
pub struct CleanReport {
    pub stale_owners_removed: usize,
    pub inflight_recovered: usize,
    pub temp_files_removed: usize,
}

/// Remove crash residue. Safe to run at any time: live recorders are
/// protected by their per-user locks and the encoder by its singleton
/// lock, so only genuinely orphaned state is touched. Idempotent.
pub fn clean(
    registry: &SlotRegistry,
    queue: &JobQueue,
    record_dir: &Path,
    user_locks_dir: &Path,
) -> CleanReport {
    let mut report = CleanReport {
        stale_owners_removed: registry.sweep().unwrap_or(0),
        ..CleanReport::default()
    };

    // Inflight jobs belong to the encoder while it runs; only a dead
    // encoder's leftovers are safe to re-enqueue.
    if heartbeat::singleton_held(&heartbeat::encoder_lock_path()) {
        info!("encode daemon is running; leaving inflight jobs alone");
    } else {
        report.inflight_recovered = queue.recover_inflight().unwrap_or(0);
    }

    report.temp_files_removed = clean_temp_residue(record_dir, user_locks_dir);
    report
}

/// Delete temp/ files whose recorder is gone. A file is kept whenever its
/// name maps to a username whose per-user lock is held, or the name is
/// not one of ours.
fn clean_temp_residue(record_dir: &Path, user_locks_dir: &Path) -> usize {
    let temp_dir = record_dir.join("temp");
    let Ok(entries) = std::fs::read_dir(&temp_dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(username) = recorder::username_from_base(stem) else {
            continue;
        };
        if UserLock::is_locked_in(user_locks_dir, username) {
            continue;
        }
        if fsutil::remove_if_exists(&path).unwrap_or(false) {
            info!(file = %path.display(), "removed orphaned temp artifact");
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodeParams;
    use crate::fsutil::atomic_write_json;
    use crate::locks::SlotOwner;
    use crate::queue::EncodeJob;
    use tempfile::TempDir;

    #[test]
    fn test_clean_sweeps_and_recovers() {
        let dir = TempDir::new().unwrap();
        let registry = SlotRegistry::with_dir(2, dir.path().join("slots")).unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        let record_dir = dir.path().join("rec");
        let locks_dir = dir.path().join("locks");
        std::fs::create_dir_all(record_dir.join("temp")).unwrap();

        // Stale owner from a kill -9'd recorder.
        let owner = SlotOwner {
            pid: i32::MAX,
            username: "ghost".into(),
            started_at: chrono::Utc::now(),
        };
        atomic_write_json(&dir.path().join("slots").join("slot1.owner"), &owner).unwrap();

        // Inflight job from a crashed encoder.
        queue
            .enqueue(&EncodeJob::new(
                dir.path().join("x.mp4"),
                "x".into(),
                "ghost".into(),
                EncodeParams::default(),
            ))
            .unwrap();
        let _claimed = queue.take_next().unwrap().unwrap();

        // Temp residue from the dead recorder, plus a foreign file.
        std::fs::write(record_dir.join("temp").join("ghost_2026-08-01_10-00.ts"), b"x").unwrap();
        std::fs::write(record_dir.join("temp").join("unrelated.bin"), b"x").unwrap();

        let report = clean(&registry, &queue, &record_dir, &locks_dir);
        assert_eq!(report.stale_owners_removed, 1);
        assert_eq!(report.inflight_recovered, 1);
        assert_eq!(report.temp_files_removed, 1);
        assert!(!record_dir.join("temp").join("ghost_2026-08-01_10-00.ts").exists());
        // Files that are not recorder artifacts are never touched.
        assert!(record_dir.join("temp").join("unrelated.bin").exists());
        // Recovered job is back in the queue.
        assert_eq!(queue.list().unwrap().len(), 1);

        // clean twice == clean once.
        let report = clean(&registry, &queue, &record_dir, &locks_dir);
        assert_eq!(report.stale_owners_removed, 0);
        assert_eq!(report.inflight_recovered, 0);
        assert_eq!(report.temp_files_removed, 0);
    }

    #[test]
    fn test_clean_keeps_active_user_temp_files() {
        let dir = TempDir::new().unwrap();
        let registry = SlotRegistry::with_dir(1, dir.path().join("slots")).unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        let record_dir = dir.path().join("rec");
        let locks_dir = dir.path().join("locks");
        std::fs::create_dir_all(record_dir.join("temp")).unwrap();

        let mut lock = UserLock::with_dir("alice", locks_dir.clone());
        lock.acquire().unwrap();
        let live_part = record_dir.join("temp").join("alice_2026-08-02_12-00.part001");
        std::fs::write(&live_part, b"x").unwrap();

        let report = clean(&registry, &queue, &record_dir, &locks_dir);
        assert_eq!(report.temp_files_removed, 0);
        assert!(live_part.exists());

        lock.release();
        let report = clean(&registry, &queue, &record_dir, &locks_dir);
        assert_eq!(report.temp_files_removed, 1);
    }
}
