//! Operator-facing status report: active slots, queue contents and the
//! daemon heartbeats, rendered as text or JSON.

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;

use crate::heartbeat::{self, EncoderStatus, PollerStatus};
use crate::locks::{OwnerInfo, SlotRegistry};
use crate::procutil;
use crate::queue::JobQueue;

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub file: String,
    pub base_name: String,
    pub username: String,
    pub input: PathBuf,
    pub output: PathBuf,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub downloads: Vec<OwnerInfo>,
    pub record_limit: u32,
    pub queue_dir: PathBuf,
    pub jobs: Vec<JobSummary>,
    pub failed: Vec<PathBuf>,
    pub errors: Vec<PathBuf>,
    pub encoder_running: bool,
    pub encoder: Option<EncoderStatus>,
    pub poller_running: bool,
    pub poller: Option<PollerStatus>,
}

pub fn gather(registry: &SlotRegistry, queue: &JobQueue) -> Result<StatusReport> {
    let downloads = registry.enumerate().unwrap_or_default();

    let jobs = queue
        .list()?
        .into_iter()
        .map(|queued| JobSummary {
            file: queued
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            base_name: queued.job.base_name.clone(),
            username: queued.job.username.clone(),
            input: queued.job.input_path.clone(),
            output: queued.job.output_path(),
            enqueued_at: queued.job.enqueued_at,
        })
        .collect();

    let encoder: Option<EncoderStatus> = heartbeat::read(&heartbeat::encoder_status_path());
    let encoder_running = heartbeat::singleton_held(&heartbeat::encoder_lock_path())
        || encoder
            .as_ref()
            .map(|s| procutil::pid_alive(s.pid))
            .unwrap_or(false);

    let poller: Option<PollerStatus> = heartbeat::read(&heartbeat::poller_status_path());
    let poller_running = heartbeat::singleton_held(&heartbeat::poller_lock_path())
        || poller
            .as_ref()
            .map(|s| procutil::pid_alive(s.pid))
            .unwrap_or(false);

    Ok(StatusReport {
        downloads,
        record_limit: registry.limit(),
        queue_dir: queue.jobs_dir(),
        jobs,
        failed: queue.failed_jobs(),
        errors: queue.error_sidecars(),
        encoder_running,
        encoder,
        poller_running,
        poller,
    })
}

pub fn render(report: &StatusReport) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push("Active downloads:".into());
    if report.downloads.is_empty() {
        lines.push("  none".into());
    } else {
        let mut downloads: Vec<&OwnerInfo> = report.downloads.iter().collect();
        downloads.sort_by_key(|o| o.slot);
        for owner in downloads {
            lines.push(format!(
                "  slot {}: {} (pid={}, since={})",
                owner.slot,
                owner.owner.username,
                owner.owner.pid,
                owner.owner.started_at.to_rfc3339()
            ));
        }
    }
    lines.push(String::new());

    if report.jobs.is_empty() {
        lines.push("Pending encode jobs: none".into());
    } else {
        lines.push(format!("Pending encode jobs ({}):", report.jobs.len()));
        for (idx, job) in report.jobs.iter().enumerate() {
            lines.push(format!("  {}. {}", idx + 1, job.base_name));
            lines.push(format!(
                "     input:  {}",
                job.input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ));
            lines.push(format!(
                "     output: {}",
                job.output
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ));
            lines.push(format!("     (enqueued {})", job.enqueued_at.to_rfc3339()));
        }
    }
    lines.push(format!("queue: {}", report.queue_dir.display()));

    if !report.failed.is_empty() {
        lines.push(format!("Failed jobs ({}):", report.failed.len()));
        for path in &report.failed {
            lines.push(format!("  {}", path.display()));
        }
    }
    if !report.errors.is_empty() {
        lines.push(format!("Errored jobs ({}):", report.errors.len()));
        for path in &report.errors {
            lines.push(format!("  {}", path.display()));
        }
    }
    lines.push(String::new());

    if report.encoder_running {
        let detail = report
            .encoder
            .as_ref()
            .map(|s| {
                let job = s.current_job.as_deref().unwrap_or("-");
                format!(" (state={}, current job: {})", s.state.as_str(), job)
            })
            .unwrap_or_default();
        lines.push(format!("Encoder daemon: running{}", detail));
    } else {
        lines.push("Encoder daemon: not running".into());
    }

    if report.poller_running {
        let detail = report
            .poller
            .as_ref()
            .map(|s| {
                let last = s
                    .last_poll
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                let next = s
                    .next_poll
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                format!(" (last poll: {}, next poll: {})", last, next)
            })
            .unwrap_or_default();
        lines.push(format!("Poller: running{}", detail));
    } else {
        lines.push("Poller: not running".into());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncodeParams;
    use crate::queue::EncodeJob;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_gather_and_render() {
        let dir = TempDir::new().unwrap();
        let registry = SlotRegistry::with_dir(2, dir.path().join("slots")).unwrap();
        let queue = JobQueue::open(&dir.path().join("queue")).unwrap();

        let handle = registry.acquire("djbeta", true).await.unwrap();
        queue
            .enqueue(&EncodeJob::new(
                dir.path().join("djbeta_2026-08-02_10-00.mp4"),
                "djbeta_2026-08-02_10-00".into(),
                "djbeta".into(),
                EncodeParams::default(),
            ))
            .unwrap();

        let report = gather(&registry, &queue).unwrap();
        assert_eq!(report.downloads.len(), 1);
        assert_eq!(report.downloads[0].owner.username, "djbeta");
        assert_eq!(report.jobs.len(), 1);
        assert!(report.failed.is_empty());

        let text = render(&report);
        assert!(text.contains("djbeta"));
        assert!(text.contains("slot"));
        assert!(text.contains("input:"));
        assert!(text.contains("output:"));
        assert!(text.contains("_compressed.mp4"));
        assert!(text.contains("queue:"));

        // JSON form stays parseable.
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"downloads\""));

        handle.release();
    }

    #[test]
    fn test_render_empty_report() {
        let report = StatusReport {
            downloads: vec![],
            record_limit: 6,
            queue_dir: PathBuf::from("/tmp/q/jobs"),
            jobs: vec![],
            failed: vec![],
            errors: vec![],
            encoder_running: false,
            encoder: None,
            poller_running: false,
            poller: None,
        };
        let text = render(&report);
        assert!(text.contains("Active downloads:\n  none"));
        assert!(text.contains("Pending encode jobs: none"));
        assert!(text.contains("Encoder daemon: not running"));
        assert!(text.contains("Poller: not running"));
    }
}
