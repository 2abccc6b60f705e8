//! Logging setup built on `tracing`.
//!
//! CLI commands log to stdout. Daemons also log to stdout when running
//! under systemd (`JOURNAL_STREAM` is set by the journal); otherwise they
//! get a daily-rolled file under the state logs directory, pruned after a
//! week. The global `--json-logs` flag switches both sinks to JSON lines.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_RETENTION_DAYS: u64 = 7;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize stdout logging for one-shot CLI commands.
pub fn init(json_logs: bool) {
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .init();
}

/// Initialize logging for a long-lived daemon.
///
/// Returns a guard that must stay alive for the non-blocking file writer to
/// flush; `None` when logging went to stdout.
pub fn init_daemon(name: &str, json_logs: bool, logs_dir: &Path) -> Result<Option<WorkerGuard>> {
    let under_systemd = std::env::var_os("JOURNAL_STREAM").is_some();
    if under_systemd {
        init(json_logs);
        return Ok(None);
    }

    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create log directory {:?}", logs_dir))?;
    let basename = format!("{}.log", name);
    prune_old_logs(
        logs_dir,
        &basename,
        Duration::from_secs(60 * 60 * 24 * LOG_RETENTION_DAYS),
    );

    let file_appender = tracing_appender::rolling::daily(logs_dir, &basename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .init();

    Ok(Some(guard))
}

fn prune_old_logs(log_dir: &Path, basename: &str, max_age: Duration) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return;
    };

    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.starts_with(basename) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified < cutoff {
            let _ = std::fs::remove_file(&path);
        }
    }
}
