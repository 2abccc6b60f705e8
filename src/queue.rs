//! Durable on-disk encode-job queue.
//!
//! The queue is a directory of JSON job files under `<base>/jobs/`, with
//! sibling `tmp/` and `inflight/` directories. Producers write into `tmp/`
//! and rename into `jobs/`, so a job file is either absent or completely
//! valid. File names are a zero-padded nanosecond timestamp plus a random
//! suffix, making lexicographic order the FIFO order. Consumers rename the
//! chosen job into `inflight/` before touching it; an `inflight` file left
//! behind by a crash is re-enqueued on the next daemon startup.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EncodeParams;
use crate::error::AppError;
use crate::fsutil;

pub const JOBS_SUBDIR: &str = "jobs";
pub const TMP_SUBDIR: &str = "tmp";
pub const INFLIGHT_SUBDIR: &str = "inflight";

const FAILED_SUFFIX: &str = "failed";
const ERROR_SIDECAR_SUFFIX: &str = "error.json";

/// One enqueued encode, with the recorder's parameter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeJob {
    pub id: String,
    pub input_path: PathBuf,
    pub base_name: String,
    pub username: String,
    pub params: EncodeParams,
    pub enqueued_at: DateTime<Utc>,
}

impl EncodeJob {
    pub fn new(
        input_path: PathBuf,
        base_name: String,
        username: String,
        params: EncodeParams,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input_path,
            base_name,
            username,
            params,
            enqueued_at: Utc::now(),
        }
    }

    /// Output path the encoder writes next to the input.
    pub fn output_path(&self) -> PathBuf {
        let dir = self
            .input_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        dir.join(format!("{}_compressed.mp4", self.base_name))
    }
}

/// A job still sitting in `jobs/`.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub path: PathBuf,
    pub job: EncodeJob,
}

/// A job this process has claimed by renaming it into `inflight/`.
#[derive(Debug)]
pub struct InflightJob {
    pub path: PathBuf,
    pub queue_name: String,
    pub job: EncodeJob,
}

/// Reason sidecar left next to a failed job.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job: String,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

pub struct JobQueue {
    base: PathBuf,
}

impl JobQueue {
    pub fn open(base: &Path) -> Result<Self, AppError> {
        let queue = Self {
            base: base.to_path_buf(),
        };
        for dir in [queue.jobs_dir(), queue.tmp_dir(), queue.inflight_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| AppError::Io(dir.clone(), e))?;
        }
        Ok(queue)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.base.join(JOBS_SUBDIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.base.join(TMP_SUBDIR)
    }

    pub fn inflight_dir(&self) -> PathBuf {
        self.base.join(INFLIGHT_SUBDIR)
    }

    /// Atomically add a job. The input path must be absolute so the daemon
    /// can run from any working directory.
    pub fn enqueue(&self, job: &EncodeJob) -> Result<PathBuf, AppError> {
        if !job.input_path.is_absolute() {
            return Err(AppError::EnqueueFailed(format!(
                "job input path must be absolute: {:?}",
                job.input_path
            )));
        }
        let name = self.next_file_name(&job.enqueued_at);
        let tmp_path = self.tmp_dir().join(format!("{}.tmp", name));
        fsutil::atomic_write_json(&tmp_path, job)
            .map_err(|e| AppError::EnqueueFailed(e.to_string()))?;
        let final_path = self.jobs_dir().join(&name);
        std::fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = fsutil::remove_if_exists(&tmp_path);
            AppError::EnqueueFailed(format!("rename into queue failed: {}", e))
        })?;
        debug!(job = %name, "enqueued encode job");
        Ok(final_path)
    }

    fn next_file_name(&self, enqueued_at: &DateTime<Utc>) -> String {
        let nanos = enqueued_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| enqueued_at.timestamp_millis().saturating_mul(1_000_000));
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{:020}-{}.json", nanos.max(0), &suffix[..8])
    }

    /// Pending jobs in FIFO (lexicographic) order. Unparseable files are
    /// skipped, failed jobs and error sidecars are not jobs.
    pub fn list(&self) -> Result<Vec<QueuedJob>, AppError> {
        let jobs_dir = self.jobs_dir();
        let mut names: Vec<String> = Vec::new();
        let entries =
            std::fs::read_dir(&jobs_dir).map_err(|e| AppError::Io(jobs_dir.clone(), e))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && !name.ends_with(&format!(".{}", ERROR_SIDECAR_SUFFIX)) {
                names.push(name);
            }
        }
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let path = jobs_dir.join(&name);
            match fsutil::read_json::<EncodeJob>(&path) {
                Ok(job) => out.push(QueuedJob { path, job }),
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable job file"),
            }
        }
        Ok(out)
    }

    /// Claim the FIFO head by renaming it into `inflight/`. `None` when the
    /// queue is empty.
    pub fn take_next(&self) -> Result<Option<InflightJob>, AppError> {
        for queued in self.list()? {
            let name = queued
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let inflight_path = self.inflight_dir().join(&name);
            match std::fs::rename(&queued.path, &inflight_path) {
                Ok(()) => {
                    return Ok(Some(InflightJob {
                        path: inflight_path,
                        queue_name: name,
                        job: queued.job,
                    }))
                }
                // Raced with another consumer or the file vanished; try the
                // next candidate.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::Io(queued.path.clone(), e)),
            }
        }
        Ok(None)
    }

    /// Move crashed-consumer leftovers from `inflight/` back into the
    /// queue. Returns how many were recovered.
    pub fn recover_inflight(&self) -> Result<usize, AppError> {
        let inflight_dir = self.inflight_dir();
        let entries =
            std::fs::read_dir(&inflight_dir).map_err(|e| AppError::Io(inflight_dir.clone(), e))?;
        let mut recovered = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let dest = self.jobs_dir().join(&name);
            match std::fs::rename(entry.path(), &dest) {
                Ok(()) => {
                    warn!(job = %name.to_string_lossy(), "recovered inflight job left by a crashed encoder");
                    recovered += 1;
                }
                Err(e) => warn!(job = %name.to_string_lossy(), error = %e, "failed to recover inflight job"),
            }
        }
        Ok(recovered)
    }

    /// Successful encode: the claimed job file is deleted.
    pub fn complete(&self, inflight: InflightJob) -> Result<(), AppError> {
        fsutil::remove_if_exists(&inflight.path).map_err(|e| AppError::Io(inflight.path, e))?;
        Ok(())
    }

    /// Failed encode: rename the claimed job to `<jobid>.failed` in the
    /// queue directory and record the reason alongside. Failed jobs are
    /// never retried automatically.
    pub fn fail(&self, inflight: InflightJob, reason: &str) -> Result<PathBuf, AppError> {
        let stem = inflight
            .queue_name
            .strip_suffix(".json")
            .unwrap_or(&inflight.queue_name);
        let failed_path = self.jobs_dir().join(format!("{}.{}", stem, FAILED_SUFFIX));
        std::fs::rename(&inflight.path, &failed_path)
            .map_err(|e| AppError::Io(inflight.path.clone(), e))?;

        let record = FailureRecord {
            job: inflight.queue_name.clone(),
            reason: reason.to_string(),
            ts: Utc::now(),
        };
        let sidecar = self
            .jobs_dir()
            .join(format!("{}.{}", stem, ERROR_SIDECAR_SUFFIX));
        fsutil::atomic_write_json(&sidecar, &record)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(failed_path)
    }

    /// Discard a claimed job that can never run (e.g. its input is gone):
    /// record the reason and delete the job so it cannot block the queue.
    pub fn discard_with_error(&self, inflight: InflightJob, reason: &str) -> Result<(), AppError> {
        let stem = inflight
            .queue_name
            .strip_suffix(".json")
            .unwrap_or(&inflight.queue_name);
        let record = FailureRecord {
            job: inflight.queue_name.clone(),
            reason: reason.to_string(),
            ts: Utc::now(),
        };
        let sidecar = self
            .jobs_dir()
            .join(format!("{}.{}", stem, ERROR_SIDECAR_SUFFIX));
        fsutil::atomic_write_json(&sidecar, &record)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        fsutil::remove_if_exists(&inflight.path)
            .map_err(|e| AppError::Io(inflight.path.clone(), e))?;
        Ok(())
    }

    /// Record why a still-queued job was dropped (e.g. missing input) and
    /// remove it so it cannot block the queue.
    pub fn drop_with_error(&self, queued: &QueuedJob, reason: &str) -> Result<(), AppError> {
        let name = queued
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name.strip_suffix(".json").unwrap_or(&name);
        let record = FailureRecord {
            job: name.clone(),
            reason: reason.to_string(),
            ts: Utc::now(),
        };
        let sidecar = self
            .jobs_dir()
            .join(format!("{}.{}", stem, ERROR_SIDECAR_SUFFIX));
        fsutil::atomic_write_json(&sidecar, &record)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        fsutil::remove_if_exists(&queued.path)
            .map_err(|e| AppError::Io(queued.path.clone(), e))?;
        Ok(())
    }

    pub fn failed_jobs(&self) -> Vec<PathBuf> {
        self.collect_by_suffix(&format!(".{}", FAILED_SUFFIX))
    }

    pub fn error_sidecars(&self) -> Vec<PathBuf> {
        self.collect_by_suffix(&format!(".{}", ERROR_SIDECAR_SUFFIX))
    }

    fn collect_by_suffix(&self, suffix: &str) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = std::fs::read_dir(self.jobs_dir())
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .map(|n| n.to_string_lossy().ends_with(suffix))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Delete failed jobs (and their sidecars) older than `max_age`.
    pub fn prune_failed(&self, max_age: Duration) -> usize {
        let cutoff = match SystemTime::now().checked_sub(max_age) {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let mut removed = 0;
        for path in self.failed_jobs().into_iter().chain(self.error_sidecars()) {
            let old = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|m| m < cutoff)
                .unwrap_or(false);
            if old && fsutil::remove_if_exists(&path).unwrap_or(false) {
                debug!(file = ?path, "pruned aged failed-job record");
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job(dir: &Path, base: &str) -> EncodeJob {
        EncodeJob::new(
            dir.join(format!("{}.mp4", base)),
            base.to_string(),
            "alice".to_string(),
            EncodeParams::default(),
        )
    }

    #[test]
    fn test_enqueue_dequeue_round_trip() {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        let original = job(dir.path(), "alice_2026-01-01_12-00");
        queue.enqueue(&original).unwrap();

        let listed = queue.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job, original);

        let claimed = queue.take_next().unwrap().unwrap();
        assert_eq!(claimed.job, original);
        // Claimed job is out of the queue but present in inflight/.
        assert!(queue.list().unwrap().is_empty());
        assert!(claimed.path.exists());

        queue.complete(claimed).unwrap();
        assert!(queue.take_next().unwrap().is_none());
    }

    #[test]
    fn test_fifo_order() {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();

        let a = job(dir.path(), "first");
        let mut b = job(dir.path(), "second");
        b.enqueued_at = a.enqueued_at + chrono::Duration::milliseconds(10);
        // Write order is reversed; the timestamped names still sort FIFO.
        queue.enqueue(&b).unwrap();
        queue.enqueue(&a).unwrap();

        let first = queue.take_next().unwrap().unwrap();
        assert_eq!(first.job.base_name, "first");
        let second = queue.take_next().unwrap().unwrap();
        assert_eq!(second.job.base_name, "second");
    }

    #[test]
    fn test_rejects_relative_input() {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        let mut bad = job(dir.path(), "x");
        bad.input_path = PathBuf::from("relative.mp4");
        assert!(matches!(
            queue.enqueue(&bad),
            Err(AppError::EnqueueFailed(_))
        ));
    }

    #[test]
    fn test_invalid_job_file_skipped() {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        std::fs::write(queue.jobs_dir().join("00000-torn.json"), b"{oops").unwrap();
        queue.enqueue(&job(dir.path(), "good")).unwrap();

        let listed = queue.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job.base_name, "good");
    }

    #[test]
    fn test_fail_leaves_record_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        queue.enqueue(&job(dir.path(), "doomed")).unwrap();

        let claimed = queue.take_next().unwrap().unwrap();
        let failed_path = queue.fail(claimed, "ffmpeg exited with 1").unwrap();
        assert!(failed_path.exists());

        // Failed job is not listed and not re-claimed.
        assert!(queue.list().unwrap().is_empty());
        assert!(queue.take_next().unwrap().is_none());
        assert_eq!(queue.failed_jobs().len(), 1);

        let sidecars = queue.error_sidecars();
        assert_eq!(sidecars.len(), 1);
        let record: FailureRecord = fsutil::read_json(&sidecars[0]).unwrap();
        assert_eq!(record.reason, "ffmpeg exited with 1");
    }

    #[test]
    fn test_recover_inflight() {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        queue.enqueue(&job(dir.path(), "interrupted")).unwrap();
        let claimed = queue.take_next().unwrap().unwrap();
        let name = claimed.queue_name.clone();
        // Simulate the consumer dying mid-encode.
        drop(claimed);

        assert_eq!(queue.recover_inflight().unwrap(), 1);
        let listed = queue.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].path.file_name().unwrap().to_string_lossy(),
            name
        );
        // Nothing left to recover.
        assert_eq!(queue.recover_inflight().unwrap(), 0);
    }

    #[test]
    fn test_drop_with_error() {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        queue.enqueue(&job(dir.path(), "missing_input")).unwrap();
        let queued = queue.list().unwrap().remove(0);
        queue.drop_with_error(&queued, "input not found").unwrap();
        assert!(queue.list().unwrap().is_empty());
        assert_eq!(queue.error_sidecars().len(), 1);
    }

    #[test]
    fn test_output_path_naming() {
        let j = EncodeJob::new(
            PathBuf::from("/videos/alice_2026-01-01_12-00.mp4"),
            "alice_2026-01-01_12-00".into(),
            "alice".into(),
            EncodeParams::default(),
        );
        assert_eq!(
            j.output_path(),
            PathBuf::from("/videos/alice_2026-01-01_12-00_compressed.mp4")
        );
    }

    #[test]
    fn test_prune_failed_respects_age() {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        queue.enqueue(&job(dir.path(), "old")).unwrap();
        let claimed = queue.take_next().unwrap().unwrap();
        queue.fail(claimed, "boom").unwrap();

        // Fresh failure survives a 7-day prune...
        assert_eq!(queue.prune_failed(Duration::from_secs(7 * 86400)), 0);
        // ...but not a zero-age prune.
        assert_eq!(queue.prune_failed(Duration::ZERO), 2);
        assert!(queue.failed_jobs().is_empty());
    }
}
