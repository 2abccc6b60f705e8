//! The poller daemon: turns a users file into detached recorder
//! processes as those users go live.
//!
//! Each cycle re-reads the users file (so live edits take effect), skips
//! users already being recorded, probes the rest in a bounded parallel
//! fan-out, and spawns a recorder per live user up to the free slot
//! count. Spawns are fire-and-forget: the recorder takes its own locks
//! and outlives the poller.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::heartbeat::{self, PollerStatus};
use crate::locks::{SlotRegistry, UserLock};
use crate::procutil;
use crate::tools;
use crate::users;

#[derive(Debug, Clone)]
pub struct PollerOptions {
    pub users_file: PathBuf,
    pub interval: Duration,
    pub quality: String,
    pub download_cmd: String,
    pub timeout: Duration,
    pub probe_concurrency: usize,
    pub record_limit: u32,
    pub logs_dir: PathBuf,
    /// Config path the poller itself was started with; forwarded to
    /// spawned recorders so both read the same file.
    pub config_path: Option<PathBuf>,
    pub json_logs: bool,
}

pub async fn run(opts: PollerOptions) -> Result<(), AppError> {
    if tools::which(tools::CAPTURE_TOOL).is_none() {
        return Err(AppError::External(format!(
            "{} not found in PATH",
            tools::CAPTURE_TOOL
        )));
    }
    let base_cmd = validate_download_cmd(&opts.download_cmd)?;

    let _singleton = heartbeat::acquire_singleton(&heartbeat::poller_lock_path())?;

    let registry = SlotRegistry::new(opts.record_limit)?;
    registry.sweep().ok();

    let stop = procutil::stop_flag();
    let status_path = heartbeat::poller_status_path();
    let mut status = PollerStatus {
        pid: std::process::id() as i32,
        started_at: Utc::now(),
        interval_secs: opts.interval.as_secs(),
        last_poll: None,
        next_poll: None,
        cycle_count: 0,
        live_now: Vec::new(),
        spawned_now: Vec::new(),
        last_tick: Utc::now(),
    };
    heartbeat::write(&status_path, &status);

    info!(
        users_file = %opts.users_file.display(),
        interval_s = opts.interval.as_secs(),
        "poller started"
    );

    while !stop.load(Ordering::SeqCst) {
        let cycle_start = Utc::now();
        let candidates = cycle_candidates(&opts.users_file);

        // Capacity check up front; with zero free slots we still probe so
        // the heartbeat keeps reporting who is live.
        let active = registry.active_count();
        let free = (opts.record_limit as usize).saturating_sub(active);

        let results = probe_users(
            &candidates,
            &opts.quality,
            opts.timeout,
            opts.probe_concurrency,
        )
        .await;
        let live: Vec<String> = results
            .iter()
            .filter(|(_, live)| *live)
            .map(|(user, _)| user.clone())
            .collect();

        info!(
            active_slots = active,
            free,
            live = ?live,
            "poll cycle result"
        );

        let mut spawned: Vec<String> = Vec::new();
        for user in select_spawn_candidates(&results, free) {
            // Re-check: a recorder may have appeared since filtering.
            if UserLock::is_locked(&user) {
                debug!(user = %user, "user became locked since the probe");
                continue;
            }
            let logfile = opts.logs_dir.join(format!("{}.log", user));
            match spawn_recorder(
                &base_cmd,
                &user,
                &opts.quality,
                opts.config_path.as_deref(),
                opts.json_logs,
                &logfile,
            ) {
                Ok(()) => {
                    info!(user = %user, log = %logfile.display(), "launched recorder");
                    spawned.push(user);
                }
                Err(e) => {
                    error!(user = %user, error = %e, "failed to launch recorder");
                }
            }
        }

        status.cycle_count += 1;
        status.last_poll = Some(cycle_start);
        status.next_poll = Some(cycle_start + chrono::Duration::seconds(opts.interval.as_secs() as i64));
        status.live_now = live;
        status.spawned_now = spawned;
        status.last_tick = Utc::now();
        heartbeat::write(&status_path, &status);

        sleep_interruptible(opts.interval, &stop).await;
    }

    // Spawned recorders are independent; shutdown leaves them running.
    heartbeat::remove(&status_path);
    info!("poller stopped");
    Ok(())
}

/// Users worth probing this cycle: valid names not currently recorded.
fn cycle_candidates(users_file: &Path) -> Vec<String> {
    let mut candidates = Vec::new();
    for user in users::load_users(users_file) {
        if !users::is_valid_username(&user) {
            warn!(user = %user, "skipping invalid username");
            continue;
        }
        if UserLock::is_locked(&user) {
            debug!(user = %user, "already recording, skipping probe");
            continue;
        }
        candidates.push(user);
    }
    candidates
}

/// Probe all candidates in parallel, bounded by `concurrency`, each probe
/// subject to `timeout`. Results come back in input order.
async fn probe_users(
    candidates: &[String],
    quality: &str,
    timeout: Duration,
    concurrency: usize,
) -> Vec<(String, bool)> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    for (index, user) in candidates.iter().cloned().enumerate() {
        let semaphore = semaphore.clone();
        let quality = quality.to_string();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let live = probe_one(&user, &quality, timeout).await;
            (index, user, live)
        });
    }

    let mut indexed = Vec::with_capacity(candidates.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => indexed.push(result),
            Err(e) => warn!(error = %e, "probe task panicked"),
        }
    }
    indexed.sort_by_key(|(index, _, _)| *index);
    indexed
        .into_iter()
        .map(|(_, user, live)| (user, live))
        .collect()
}

/// A user is live when the probe tool exits 0 within the timeout.
async fn probe_one(user: &str, quality: &str, timeout: Duration) -> bool {
    let cmd = tools::probe_cmd(user, quality);
    matches!(
        procutil::run_tool_quiet(&cmd.program, &cmd.args, Some(timeout)).await,
        Ok(Some(status)) if status.success()
    )
}

/// The first `free` live users, in input order.
fn select_spawn_candidates(results: &[(String, bool)], free: usize) -> Vec<String> {
    results
        .iter()
        .filter(|(_, live)| *live)
        .take(free)
        .map(|(user, _)| user.clone())
        .collect()
}

/// Reject shells and shell metacharacters in the download command. The
/// command is never run through a shell anyway; this guards against
/// configs written with one in mind. The executable is deliberately NOT
/// resolved to an absolute path here: spawning goes through PATH so an
/// upgraded binary takes effect without restarting the poller.
fn validate_download_cmd(download_cmd: &str) -> Result<Vec<String>, AppError> {
    const FORBIDDEN_EXECS: &[&str] = &[
        "sh", "bash", "zsh", "ksh", "fish", "pwsh", "powershell", "cmd", "cmd.exe",
    ];
    const META_TOKENS: &[&str] = &[";", "|", "&&", "||", ">", "<", "`"];

    let parts: Vec<String> = download_cmd
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let Some(exe) = parts.first() else {
        return Err(AppError::Config("empty download_cmd".into()));
    };
    let exe_name = Path::new(exe)
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if FORBIDDEN_EXECS.contains(&exe_name.as_str()) {
        return Err(AppError::Config(format!(
            "forbidden executable '{}' in download_cmd",
            exe_name
        )));
    }
    if parts.iter().any(|p| META_TOKENS.contains(&p.as_str())) {
        return Err(AppError::Config(
            "shell meta tokens not allowed in download_cmd".into(),
        ));
    }
    Ok(parts)
}

/// Argument vector for one spawned recorder.
fn recorder_argv(
    base_cmd: &[String],
    user: &str,
    quality: &str,
    config_path: Option<&Path>,
    json_logs: bool,
) -> Vec<String> {
    let mut argv: Vec<String> = base_cmd.to_vec();
    argv.push(user.to_string());
    argv.push("--quality".into());
    argv.push(quality.into());
    if let Some(config) = config_path {
        argv.push("--config".into());
        argv.push(config.to_string_lossy().into_owned());
    }
    if json_logs {
        argv.push("--json-logs".into());
    }
    argv
}

/// Spawn a recorder in its own session with stdout/stderr appended to the
/// per-user log file. A helper thread reaps the child when it eventually
/// exits; the poller never blocks on it.
fn spawn_recorder(
    base_cmd: &[String],
    user: &str,
    quality: &str,
    config_path: Option<&Path>,
    json_logs: bool,
    logfile: &Path,
) -> io::Result<()> {
    if let Some(parent) = logfile.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logfile)?;
    let log_err = log.try_clone()?;

    let argv = recorder_argv(base_cmd, user, quality, config_path, json_logs);
    let mut command = std::process::Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err);
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            // Detach from the poller's session so daemon shutdown
            // signals never reach the recorder.
            libc::setsid();
            Ok(())
        });
    }
    let mut child = command.spawn()?;
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_download_cmd_accepts_plain() {
        let parts = validate_download_cmd("twitchgrab record").unwrap();
        assert_eq!(parts, vec!["twitchgrab", "record"]);
        // The executable stays a bare name for PATH resolution at spawn.
        assert_eq!(parts[0], "twitchgrab");
    }

    #[test]
    fn test_validate_download_cmd_rejects_shells_and_meta() {
        assert!(matches!(
            validate_download_cmd("bash -c something"),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            validate_download_cmd("/bin/sh record"),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            validate_download_cmd("twitchgrab record ; rm"),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            validate_download_cmd(""),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_select_spawn_candidates_respects_capacity_and_order() {
        let results = vec![
            ("a".to_string(), false),
            ("b".to_string(), true),
            ("c".to_string(), true),
            ("d".to_string(), true),
        ];
        assert_eq!(select_spawn_candidates(&results, 2), vec!["b", "c"]);
        assert!(select_spawn_candidates(&results, 0).is_empty());
        assert_eq!(select_spawn_candidates(&results, 10), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_recorder_argv() {
        let base = vec!["twitchgrab".to_string(), "record".to_string()];
        let argv = recorder_argv(
            &base,
            "alice",
            "best",
            Some(Path::new("/etc/tg.toml")),
            true,
        );
        assert_eq!(
            argv,
            vec![
                "twitchgrab",
                "record",
                "alice",
                "--quality",
                "best",
                "--config",
                "/etc/tg.toml",
                "--json-logs"
            ]
        );

        let argv = recorder_argv(&base, "bob", "720p", None, false);
        assert_eq!(argv, vec!["twitchgrab", "record", "bob", "--quality", "720p"]);
    }

    #[tokio::test]
    async fn test_probe_users_preserves_input_order() {
        // Probes run against a missing binary, so every result is
        // "not live", but ordering and fan-out still exercise.
        let users: Vec<String> = (0..8).map(|i| format!("user_{:02}", i)).collect();
        let results = probe_users(&users, "best", Duration::from_secs(1), 3).await;
        assert_eq!(results.len(), 8);
        for (i, (user, live)) in results.iter().enumerate() {
            assert_eq!(user, &users[i]);
            assert!(!live);
        }
    }
}
