//! The recorder: one process, one username, one finalized artifact.
//!
//! Lifecycle: lock the user, take a global slot, loop the capture tool
//! over segments, merge the segments, release the slot (before remux so
//! another recorder can start while we repackage), optionally remux,
//! finalize out of `temp/`, and enqueue an encode job. Everything written
//! before finalization lives under `<output>/temp/`, which must share a
//! filesystem with the output directory so the final rename is atomic.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::EncodeParams;
use crate::error::AppError;
use crate::fsutil;
use crate::locks::{SlotRegistry, UserLock};
use crate::procutil;
use crate::queue::{EncodeJob, JobQueue};
use crate::tools::{self, ToolCmd};
use crate::users;

/// Hard ceiling on a single merge or remux run; only a hung ffmpeg hits it.
const MUX_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Escalation points once a stop was requested while capture runs.
const STOP_TERM_AFTER: Duration = Duration::from_secs(5);
const STOP_KILL_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub username: String,
    pub quality: String,
    pub retry_delay: Duration,
    pub retry_window: Duration,
    pub loglevel: String,
    pub output_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub enable_remux: bool,
    pub delete_ts_after_remux: bool,
    pub record_limit: u32,
    pub fail_fast: bool,
    pub disk_free_min_bytes: u64,
    pub encode_params: EncodeParams,
}

/// Base name for all artifacts of one recording.
pub fn base_name(username: &str, start: chrono::DateTime<Utc>) -> String {
    format!("{}_{}", username, start.format("%Y-%m-%d_%H-%M"))
}

/// Inverse of [`base_name`]: recover the username from an artifact stem.
/// Used by `clean` to match temp residue against per-user locks.
pub fn username_from_base(stem: &str) -> Option<&str> {
    // <username>_YYYY-MM-DD_HH-MM, a fixed 17-char suffix.
    const SUFFIX_LEN: usize = 17;
    if stem.len() <= SUFFIX_LEN {
        return None;
    }
    let (user, suffix) = stem.split_at(stem.len() - SUFFIX_LEN);
    let bytes = suffix.as_bytes();
    let shape_ok = bytes[0] == b'_'
        && suffix[1..]
            .char_indices()
            .all(|(i, c)| match i {
                4 | 7 => c == '-',
                10 => c == '_',
                13 => c == '-',
                _ => c.is_ascii_digit(),
            });
    if shape_ok && !user.is_empty() {
        Some(user)
    } else {
        None
    }
}

pub async fn record(opts: RecordOptions) -> Result<(), AppError> {
    info!(user = %opts.username, quality = %opts.quality, "recorder starting");

    if !users::is_valid_username(&opts.username) {
        return Err(AppError::Config(format!(
            "invalid username '{}'",
            opts.username
        )));
    }
    if tools::which(tools::CAPTURE_TOOL).is_none() {
        return Err(AppError::External(format!(
            "{} not found in PATH",
            tools::CAPTURE_TOOL
        )));
    }
    if tools::which(tools::FFMPEG_TOOL).is_none() {
        return Err(AppError::External(format!(
            "{} not found in PATH",
            tools::FFMPEG_TOOL
        )));
    }

    let out_dir = absolute_dir(&opts.output_dir)?;
    let temp_dir = out_dir.join("temp");
    std::fs::create_dir_all(&temp_dir).map_err(|e| AppError::Io(temp_dir.clone(), e))?;

    let free = fsutil::free_space(&out_dir).map_err(|e| AppError::Io(out_dir.clone(), e))?;
    if free < opts.disk_free_min_bytes {
        return Err(AppError::DiskLow {
            free,
            min: opts.disk_free_min_bytes,
        });
    }

    // Per-user lock for the whole recorder lifetime.
    let mut user_lock = UserLock::new(&opts.username);
    user_lock.acquire()?;

    let registry = SlotRegistry::new(opts.record_limit)?;
    let slot = registry.acquire(&opts.username, opts.fail_fast).await?;

    let stop = procutil::stop_flag();
    let base = base_name(&opts.username, Utc::now());

    let parts = capture_loop(&opts, &temp_dir, &base, &stop).await?;

    if parts.is_empty() {
        warn!(user = %opts.username, "no segments captured");
        slot.release();
        return Err(AppError::NotLive(opts.username.clone()));
    }

    // MERGE. Failure keeps the segments in temp/ for manual recovery.
    let merged_ts = temp_dir.join(format!("{}.ts", base));
    merge_parts(&parts, &merged_ts, &temp_dir, &opts.loglevel).await?;
    for part in &parts {
        let _ = fsutil::remove_if_exists(part);
    }
    info!(out = %merged_ts.display(), parts = parts.len(), "merged segments");

    // Slot goes back before remux so capture capacity frees up as early
    // as possible; the per-user lock stays held until we are done.
    slot.release();

    if !opts.enable_remux {
        let final_ts = finalize(&merged_ts, &out_dir);
        info!(output = %final_ts.display(), "remux disabled; merged TS finalized, encode skipped");
        return Ok(());
    }

    // REMUX. Failure is non-fatal: the TS is kept and encoded instead.
    let remux_mp4 = temp_dir.join(format!("{}.mp4", base));
    let mut encode_input = merged_ts.clone();
    match remux(&merged_ts, &remux_mp4, &opts.loglevel).await {
        Ok(()) => {
            info!(out = %remux_mp4.display(), "remux succeeded");
            encode_input = remux_mp4.clone();
            if opts.delete_ts_after_remux {
                let _ = fsutil::remove_if_exists(&merged_ts);
            }
        }
        Err(e) => {
            warn!(error = %e, "remux failed, keeping TS for encode");
        }
    }

    let final_input = finalize(&encode_input, &out_dir);
    // A kept TS next to a successful remux is finalized as well.
    if encode_input == remux_mp4 && merged_ts.exists() {
        finalize(&merged_ts, &out_dir);
    }

    // ENQUEUE.
    let queue = JobQueue::open(&opts.queue_dir)?;
    let job = EncodeJob::new(
        final_input.clone(),
        base.clone(),
        opts.username.clone(),
        opts.encode_params.clone(),
    );
    let job_path = queue.enqueue(&job)?;
    info!(job = %job_path.display(), input = %final_input.display(), "enqueued encode job");

    info!(user = %opts.username, "recorder done");
    Ok(())
}

fn absolute_dir(dir: &Path) -> Result<PathBuf, AppError> {
    std::fs::create_dir_all(dir).map_err(|e| AppError::Io(dir.to_path_buf(), e))?;
    dir.canonicalize()
        .map_err(|e| AppError::Io(dir.to_path_buf(), e))
}

/// Drive the capture tool until the stream ends cleanly, the retry window
/// runs dry, or a stop is requested. Returns the non-empty segments in
/// capture order. A capture tool that cannot even be spawned aborts the
/// loop outright; that is a broken host, not an offline stream.
async fn capture_loop(
    opts: &RecordOptions,
    temp_dir: &Path,
    base: &str,
    stop: &Arc<AtomicBool>,
) -> Result<Vec<PathBuf>, AppError> {
    let mut parts: Vec<PathBuf> = Vec::new();
    let mut part_index: u32 = 1;
    let mut deadline = Instant::now() + opts.retry_window;

    info!(
        retry_delay_s = opts.retry_delay.as_secs(),
        retry_window_s = opts.retry_window.as_secs(),
        "begin capture loop"
    );

    loop {
        if stop.load(Ordering::SeqCst) && parts.is_empty() {
            break;
        }

        let part = temp_dir.join(format!("{}.part{:03}", base, part_index));
        let cmd = tools::capture_cmd(&opts.username, &opts.quality, &part, &opts.loglevel);
        info!(part = %part.display(), cmd = %cmd.display(), "starting segment capture");

        let attempt_start = Instant::now();
        let status = match run_capture(&cmd, stop).await {
            Ok(status) => status,
            Err(e) => {
                error!(part = %part.display(), error = %e, "failed to run capture tool");
                return Err(AppError::CaptureFailed(format!(
                    "cannot run {}: {}",
                    cmd.program, e
                )));
            }
        };
        let ran_for = attempt_start.elapsed();

        let clean_exit = status.success();
        let size = fsutil::file_size(&part);
        info!(part = %part.display(), exit = ?status.code(), size, "segment capture finished");

        if size > 0 {
            parts.push(part);
            part_index += 1;
        }

        if clean_exit && size > 0 {
            // Clean exit means the stream ended; we are done capturing.
            break;
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }

        // A capture that ran for the whole window restarts the retry chain,
        // so a long stream that drops still gets its full retry budget.
        if ran_for >= opts.retry_window {
            deadline = Instant::now() + opts.retry_window;
        }
        if Instant::now() >= deadline {
            info!("retry window exhausted");
            break;
        }
        sleep_interruptible(opts.retry_delay, stop).await;
    }

    Ok(parts)
}

/// Wait for the capture child, escalating signals once a stop is
/// requested: interrupt immediately, terminate after 5s, kill after 10s.
async fn run_capture(
    cmd: &ToolCmd,
    stop: &Arc<AtomicBool>,
) -> std::io::Result<std::process::ExitStatus> {
    let mut child = tokio::process::Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let pid = child.id().map(|p| p as i32);
    let mut stop_mark: Option<Instant> = None;

    loop {
        tokio::select! {
            status = child.wait() => return status,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if !stop.load(Ordering::SeqCst) {
                    continue;
                }
                let Some(pid) = pid else { continue };
                match stop_mark {
                    None => {
                        stop_mark = Some(Instant::now());
                        procutil::send_interrupt(pid);
                    }
                    Some(mark) if mark.elapsed() > STOP_KILL_AFTER => {
                        procutil::send_kill(pid);
                    }
                    Some(mark) if mark.elapsed() > STOP_TERM_AFTER => {
                        procutil::send_term(pid);
                    }
                    Some(_) => {}
                }
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
        tokio::time::sleep(Duration::from_secs(1).min(deadline - Instant::now())).await;
    }
}

async fn merge_parts(
    parts: &[PathBuf],
    merged_ts: &Path,
    temp_dir: &Path,
    loglevel: &str,
) -> Result<(), AppError> {
    let list = tools::write_concat_list(parts, temp_dir)
        .map_err(|e| AppError::MergeFailed(format!("failed to write concat list: {}", e)))?;
    let cmd = tools::concat_cmd(list.path(), merged_ts, loglevel);
    let status = procutil::run_tool(&cmd.program, &cmd.args, Some(MUX_TIMEOUT))
        .await
        .map_err(|e| AppError::MergeFailed(format!("failed to spawn ffmpeg: {}", e)))?;
    match status {
        Some(s) if s.success() && fsutil::non_empty(merged_ts) => Ok(()),
        Some(s) => Err(AppError::MergeFailed(format!(
            "ffmpeg concat exited with {:?}",
            s.code()
        ))),
        None => Err(AppError::MergeFailed("ffmpeg concat timed out".into())),
    }
}

async fn remux(in_ts: &Path, out_mp4: &Path, loglevel: &str) -> Result<(), AppError> {
    let cmd = tools::remux_cmd(in_ts, out_mp4, loglevel);
    let status = procutil::run_tool(&cmd.program, &cmd.args, Some(MUX_TIMEOUT))
        .await
        .map_err(|e| AppError::RemuxFailed(format!("failed to spawn ffmpeg: {}", e)))?;
    match status {
        Some(s) if s.success() && fsutil::non_empty(out_mp4) => Ok(()),
        Some(s) => Err(AppError::RemuxFailed(format!(
            "ffmpeg remux exited with {:?}",
            s.code()
        ))),
        None => Err(AppError::RemuxFailed("ffmpeg remux timed out".into())),
    }
}

/// Atomic same-filesystem rename out of `temp/`. On failure the artifact
/// stays in temp/ and is used from there.
fn finalize(artifact: &Path, out_dir: &Path) -> PathBuf {
    let name = artifact.file_name().unwrap_or_default();
    let dest = out_dir.join(name);
    match std::fs::rename(artifact, &dest) {
        Ok(()) => {
            info!(moved_to = %dest.display(), "finalized artifact");
            dest
        }
        Err(e) => {
            error!(src = %artifact.display(), dst = %dest.display(), error = %e, "failed to finalize artifact");
            artifact.to_path_buf()
        }
    }
}
