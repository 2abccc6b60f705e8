//! Process plumbing: PID liveness probes, signal delivery to external
//! children (including the stop/continue pair used to pause transcodes),
//! and the escalating stop sequence shared by `stop <slot>` and the
//! daemon `stop` subcommands.

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};

/// How often liveness is re-checked while waiting for a signalled process.
const WAIT_POLL: Duration = Duration::from_millis(300);

/// True when `pid` refers to a running process. A process owned by another
/// user (EPERM) still counts as alive.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn send_signal(pid: i32, sig: libc::c_int) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, sig) == 0 }
}

pub fn send_interrupt(pid: i32) -> bool {
    send_signal(pid, libc::SIGINT)
}

pub fn send_term(pid: i32) -> bool {
    send_signal(pid, libc::SIGTERM)
}

pub fn send_kill(pid: i32) -> bool {
    send_signal(pid, libc::SIGKILL)
}

/// Suspend a child without losing its state. The child does not need to
/// cooperate; the kernel stops scheduling it.
pub fn suspend(pid: i32) -> bool {
    send_signal(pid, libc::SIGSTOP)
}

pub fn resume(pid: i32) -> bool {
    send_signal(pid, libc::SIGCONT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The PID was not alive when we looked.
    NotRunning,
    /// The process exited within the grace period.
    Stopped { forced: bool },
    /// The process survived the signal (and SIGKILL, if forced).
    StillRunning,
}

/// Send `sig` to `pid` and wait up to `timeout` for it to exit. With
/// `force`, escalate to SIGKILL after the timeout and wait a further 6s.
pub async fn signal_and_wait(
    pid: i32,
    sig: libc::c_int,
    timeout: Duration,
    force: bool,
) -> StopOutcome {
    if !pid_alive(pid) {
        return StopOutcome::NotRunning;
    }
    if !send_signal(pid, sig) {
        return StopOutcome::NotRunning;
    }
    if wait_for_exit(pid, timeout).await {
        return StopOutcome::Stopped { forced: false };
    }
    if !force {
        return StopOutcome::StillRunning;
    }
    debug!(pid, "escalating to SIGKILL");
    if !send_kill(pid) {
        return StopOutcome::Stopped { forced: true };
    }
    if wait_for_exit(pid, Duration::from_secs(6)).await {
        StopOutcome::Stopped { forced: true }
    } else {
        StopOutcome::StillRunning
    }
}

/// Poll until `pid` is gone or `timeout` elapses. Returns true when gone.
pub async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
}

/// Shared stop flag raised by SIGINT/SIGTERM. Must be called from inside
/// the tokio runtime; the listener tasks live until the process exits.
pub fn stop_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
        match signal(kind) {
            Ok(mut stream) => {
                let flag = flag.clone();
                tokio::spawn(async move {
                    stream.recv().await;
                    info!("received stop signal, shutting down");
                    flag.store(true, Ordering::SeqCst);
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install signal handler");
            }
        }
    }
    flag
}

/// Run an external tool to completion with stdio passed through. With a
/// timeout, a child that outlives it is killed and `Ok(None)` is returned.
pub async fn run_tool(
    program: &str,
    args: &[String],
    timeout: Option<Duration>,
) -> io::Result<Option<std::process::ExitStatus>> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    wait_with_timeout(&mut child, timeout).await
}

/// Same as [`run_tool`] but with stdout/stderr discarded; used for probes.
pub async fn run_tool_quiet(
    program: &str,
    args: &[String],
    timeout: Option<Duration>,
) -> io::Result<Option<std::process::ExitStatus>> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    wait_with_timeout(&mut child, timeout).await
}

async fn wait_with_timeout(
    child: &mut tokio::process::Child,
    timeout: Option<Duration>,
) -> io::Result<Option<std::process::ExitStatus>> {
    match timeout {
        None => child.wait().await.map(Some),
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => {
                child.start_kill().ok();
                // Reap so the child does not linger as a zombie.
                let _ = child.wait().await;
                Ok(None)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_alive_self_and_bogus() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(0));
        assert!(!pid_alive(-4));
        // PIDs above the default kernel pid_max are never allocated.
        assert!(!pid_alive(i32::MAX));
    }

    #[tokio::test]
    async fn test_run_tool_quiet_exit_codes() {
        let status = run_tool_quiet("true", &[], None).await.unwrap().unwrap();
        assert!(status.success());
        let status = run_tool_quiet("false", &[], None).await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_run_tool_timeout_kills_child() {
        let started = std::time::Instant::now();
        let out = run_tool_quiet(
            "sleep",
            &["30".to_string()],
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert!(out.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_signal_and_wait_stops_sleeper() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        // Reap from a helper thread; a zombie would otherwise still probe
        // as alive and the wait below would time out.
        let reaper = std::thread::spawn(move || {
            let _ = child.wait();
        });
        let outcome = signal_and_wait(pid, libc::SIGTERM, Duration::from_secs(5), false).await;
        assert_eq!(outcome, StopOutcome::Stopped { forced: false });
        reaper.join().unwrap();
    }

    #[tokio::test]
    async fn test_signal_and_wait_not_running() {
        let outcome = signal_and_wait(i32::MAX, libc::SIGTERM, Duration::from_millis(10), false).await;
        assert_eq!(outcome, StopOutcome::NotRunning);
    }
}
