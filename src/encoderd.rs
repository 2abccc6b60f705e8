//! The encode daemon: a singleton that drains the job queue FIFO,
//! transcoding each input while deferring to live recordings.
//!
//! Deference works at two levels. Before claiming a job the daemon checks
//! the Slot Registry and simply waits while anything records. Once a
//! transcode runs, a 2s poll watches the registry and suspends the ffmpeg
//! child with SIGSTOP when a recording appears, resuming it with SIGCONT
//! when the host goes idle again; ffmpeg never knows it was paused.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::EncodeDaemonConfig;
use crate::error::AppError;
use crate::fsutil;
use crate::heartbeat::{self, EncoderState, EncoderStatus};
use crate::locks::SlotRegistry;
use crate::procutil;
use crate::queue::{InflightJob, JobQueue};
use crate::tools;

/// Poll interval while the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(2);
/// Recheck interval while recordings hold the daemon off a new job.
const ACTIVE_RECHECK: Duration = Duration::from_secs(5);
/// Pause/resume poll interval while a transcode runs.
const PAUSE_POLL: Duration = Duration::from_secs(2);
/// Grace between SIGTERM and SIGKILL at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Ceiling on accumulated (unpaused) transcode time; only a wedged ffmpeg
/// ever reaches it.
const ENCODE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Failed-job records older than this are pruned.
const FAILED_JOB_MAX_AGE: Duration = Duration::from_secs(7 * 86400);

#[derive(Debug, Clone)]
pub struct EncodeDaemonOptions {
    pub queue_dir: PathBuf,
    pub record_limit: u32,
    pub disk_free_min_bytes: u64,
    /// Operator-provided parameter overrides (CLI/env/config); these beat
    /// each job's snapshot.
    pub overrides: EncodeDaemonConfig,
    pub delete_input_on_success: bool,
}

enum JobOutcome {
    Done,
    Failed(String),
    /// Shutdown interrupted the transcode; the claimed job file is left in
    /// inflight/ so the next daemon run re-enqueues it.
    Interrupted,
}

pub async fn run(opts: EncodeDaemonOptions) -> Result<(), AppError> {
    if tools::which(tools::FFMPEG_TOOL).is_none() {
        return Err(AppError::External(format!(
            "{} not found in PATH",
            tools::FFMPEG_TOOL
        )));
    }

    let _singleton = heartbeat::acquire_singleton(&heartbeat::encoder_lock_path())?;

    let queue = JobQueue::open(&opts.queue_dir)?;
    let recovered = queue.recover_inflight()?;
    if recovered > 0 {
        info!(recovered, "re-enqueued inflight jobs from a previous run");
    }

    let registry = SlotRegistry::new(opts.record_limit)?;
    registry.sweep().ok();

    let stop = procutil::stop_flag();
    let status_path = heartbeat::encoder_status_path();
    let mut status = EncoderStatus {
        pid: std::process::id() as i32,
        state: EncoderState::Idle,
        current_job: None,
        last_job: None,
        started_at: Utc::now(),
        last_tick: Utc::now(),
    };
    heartbeat::write(&status_path, &status);

    info!(queue = %queue.base().display(), "encode daemon started");

    while !stop.load(Ordering::SeqCst) {
        queue.prune_failed(FAILED_JOB_MAX_AGE);

        status.state = EncoderState::Idle;
        status.current_job = None;
        status.last_tick = Utc::now();
        heartbeat::write(&status_path, &status);

        // Never start a transcode while anything records. The queue is
        // left untouched during the wait.
        if registry.any_active() {
            sleep_interruptible(ACTIVE_RECHECK, &stop).await;
            continue;
        }

        // Low space: defer without dequeuing rather than fail jobs.
        match fsutil::free_space(&opts.queue_dir) {
            Ok(free) if free < opts.disk_free_min_bytes => {
                warn!(
                    free,
                    min = opts.disk_free_min_bytes,
                    "low free space; deferring encodes"
                );
                sleep_interruptible(ACTIVE_RECHECK, &stop).await;
                continue;
            }
            _ => {}
        }

        let inflight = match queue.take_next() {
            Ok(Some(inflight)) => inflight,
            Ok(None) => {
                sleep_interruptible(IDLE_POLL, &stop).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "failed to read queue");
                sleep_interruptible(IDLE_POLL, &stop).await;
                continue;
            }
        };

        let name = inflight.queue_name.clone();
        status.state = EncoderState::Running;
        status.current_job = Some(name.clone());
        status.last_job = Some(name.clone());
        status.last_tick = Utc::now();
        heartbeat::write(&status_path, &status);

        match process_job(&opts, &queue, &registry, inflight, &stop, &mut status, &status_path)
            .await
        {
            JobOutcome::Done => info!(job = %name, "encode complete"),
            JobOutcome::Failed(reason) => error!(job = %name, reason = %reason, "encode failed"),
            JobOutcome::Interrupted => {
                info!(job = %name, "encode interrupted by shutdown; job left for recovery");
                break;
            }
        }
    }

    heartbeat::remove(&status_path);
    info!("encode daemon stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_job(
    opts: &EncodeDaemonOptions,
    queue: &JobQueue,
    registry: &SlotRegistry,
    inflight: InflightJob,
    stop: &Arc<AtomicBool>,
    status: &mut EncoderStatus,
    status_path: &std::path::Path,
) -> JobOutcome {
    let input = inflight.job.input_path.clone();
    if !input.exists() {
        let reason = format!("input not found: {}", input.display());
        warn!(job = %inflight.queue_name, "{}", reason);
        if let Err(e) = queue.discard_with_error(inflight, &reason) {
            error!(error = %e, "failed to discard job with missing input");
        }
        return JobOutcome::Failed(reason);
    }

    // Daemon-side values (CLI > env > config) beat the job snapshot.
    let mut params = opts.overrides.overlay(&inflight.job.params);
    if params.sanitize() {
        warn!(
            crf = params.crf,
            threads = params.threads,
            height = params.height,
            "sanitized encode parameters"
        );
    }

    let output = inflight.job.output_path();
    if let Some(parent) = output.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            let reason = format!("cannot create output directory: {}", e);
            return fail_job(queue, inflight, reason);
        }
    }

    let cmd = tools::encode_cmd(&input, &output, &params);
    info!(job = %inflight.queue_name, cmd = %cmd.display(), "starting encode");

    let mut child = match tokio::process::Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return fail_job(queue, inflight, format!("failed to spawn ffmpeg: {}", e));
        }
    };

    let started = Instant::now();
    let exit = supervise(&mut child, registry, stop, status, status_path).await;
    let elapsed = started.elapsed();

    match exit {
        Ok(exit_status) if exit_status.success() && fsutil::non_empty(&output) => {
            info!(
                job = %inflight.queue_name,
                seconds = elapsed.as_secs(),
                output = %output.display(),
                "transcode finished"
            );
            if opts.delete_input_on_success {
                if fsutil::remove_if_exists(&input).unwrap_or(false) {
                    info!(input = %input.display(), "deleted encode input");
                }
            }
            if let Err(e) = queue.complete(inflight) {
                error!(error = %e, "failed to remove completed job file");
            }
            JobOutcome::Done
        }
        Ok(exit_status) => {
            if stop.load(Ordering::SeqCst) {
                // We terminated the child ourselves; keep the claim so the
                // next run picks the job back up.
                return JobOutcome::Interrupted;
            }
            // A partial output is useless; encodes restart from scratch.
            let _ = fsutil::remove_if_exists(&output);
            fail_job(
                queue,
                inflight,
                format!("ffmpeg exited with {:?}", exit_status.code()),
            )
        }
        Err(e) => {
            let _ = fsutil::remove_if_exists(&output);
            fail_job(queue, inflight, format!("failed to wait for ffmpeg: {}", e))
        }
    }
}

fn fail_job(queue: &JobQueue, inflight: InflightJob, reason: String) -> JobOutcome {
    if let Err(e) = queue.fail(inflight, &reason) {
        error!(error = %e, "failed to record job failure");
    }
    JobOutcome::Failed(reason)
}

/// Wait for the transcoder while enforcing the pause/resume protocol and
/// the shutdown escalation. Ticks every [`PAUSE_POLL`] to re-read the Slot
/// Registry and refresh the heartbeat.
async fn supervise(
    child: &mut tokio::process::Child,
    registry: &SlotRegistry,
    stop: &Arc<AtomicBool>,
    status: &mut EncoderStatus,
    status_path: &std::path::Path,
) -> std::io::Result<std::process::ExitStatus> {
    let pid = child.id().map(|p| p as i32);
    let mut paused = false;
    let mut running_time = Duration::ZERO;
    let mut term_sent: Option<Instant> = None;

    loop {
        tokio::select! {
            result = child.wait() => return result,
            _ = tokio::time::sleep(PAUSE_POLL) => {
                if !paused {
                    running_time += PAUSE_POLL;
                }
                status.last_tick = Utc::now();

                let Some(pid) = pid else {
                    heartbeat::write(status_path, status);
                    continue;
                };

                // Shutdown and the time ceiling share one escalation:
                // SIGTERM once, then SIGKILL after the grace period.
                if stop.load(Ordering::SeqCst) || running_time > ENCODE_TIMEOUT {
                    if paused {
                        procutil::resume(pid);
                        paused = false;
                    }
                    match term_sent {
                        None => {
                            if stop.load(Ordering::SeqCst) {
                                info!("stopping in-flight transcode");
                            } else {
                                warn!("transcode exceeded time ceiling; terminating");
                            }
                            term_sent = Some(Instant::now());
                            procutil::send_term(pid);
                        }
                        Some(mark) if mark.elapsed() > SHUTDOWN_GRACE => {
                            warn!("transcode ignored SIGTERM; killing");
                            procutil::send_kill(pid);
                        }
                        Some(_) => {}
                    }
                } else {
                    let active = registry.any_active();
                    if active && !paused {
                        if procutil::suspend(pid) {
                            paused = true;
                            status.state = EncoderState::Paused;
                            info!("paused transcode; recording active");
                        }
                    } else if !active && paused {
                        if procutil::resume(pid) {
                            paused = false;
                            status.state = EncoderState::Running;
                            info!("resumed transcode; no recording active");
                        }
                    }
                }

                heartbeat::write(status_path, status);
            }
        }
    }
}

async fn sleep_interruptible(duration: Duration, stop: &Arc<AtomicBool>) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500).min(deadline - Instant::now())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncodeParams, Fps};
    use crate::queue::EncodeJob;
    use tempfile::TempDir;

    #[test]
    fn test_overlay_daemon_config_beats_job_snapshot() {
        let job_params = EncodeParams {
            crf: 20,
            height: 1080,
            fps: Fps::Fixed("60".into()),
            ..EncodeParams::default()
        };
        let overrides = EncodeDaemonConfig {
            height: Some(480),
            ..EncodeDaemonConfig::default()
        };
        let effective = overrides.overlay(&job_params);
        assert_eq!(effective.height, 480);
        assert_eq!(effective.crf, 20);
        assert_eq!(effective.fps, Fps::Fixed("60".into()));
    }

    #[tokio::test]
    async fn test_missing_input_discards_job() {
        let dir = TempDir::new().unwrap();
        let queue = JobQueue::open(&dir.path().join("q")).unwrap();
        let job = EncodeJob::new(
            dir.path().join("gone.mp4"),
            "gone".into(),
            "alice".into(),
            EncodeParams::default(),
        );
        queue.enqueue(&job).unwrap();

        let registry =
            SlotRegistry::with_dir(2, dir.path().join("slots")).unwrap();
        let opts = EncodeDaemonOptions {
            queue_dir: dir.path().join("q"),
            record_limit: 2,
            disk_free_min_bytes: 0,
            overrides: EncodeDaemonConfig::default(),
            delete_input_on_success: false,
        };
        let stop = Arc::new(AtomicBool::new(false));
        let status_path = dir.path().join("status.json");
        let mut status = EncoderStatus {
            pid: std::process::id() as i32,
            state: EncoderState::Idle,
            current_job: None,
            last_job: None,
            started_at: Utc::now(),
            last_tick: Utc::now(),
        };

        let inflight = queue.take_next().unwrap().unwrap();
        let outcome = process_job(
            &opts,
            &queue,
            &registry,
            inflight,
            &stop,
            &mut status,
            &status_path,
        )
        .await;

        assert!(matches!(outcome, JobOutcome::Failed(_)));
        // The job is gone, with an error sidecar explaining why.
        assert!(queue.list().unwrap().is_empty());
        assert!(queue.take_next().unwrap().is_none());
        assert_eq!(queue.error_sidecars().len(), 1);
        assert!(queue.failed_jobs().is_empty());
    }
}
