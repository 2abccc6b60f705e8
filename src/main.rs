//! twitchgrab
//!
//! Twitch stream recorder with a bounded recording-slot registry, a
//! durable encode queue drained by a pausable encode daemon, and a
//! poller that launches recorders as watched users go live.

mod cli;
mod config;
mod doctor;
mod encoderd;
mod error;
mod fsutil;
mod heartbeat;
mod locks;
mod logging;
mod pollerd;
mod procutil;
mod queue;
mod recorder;
mod status;
mod tools;
mod tscompress;
mod users;

use std::path::PathBuf;
use std::time::Duration;

use tracing::error;

use cli::{
    Cli, Command, EncodeDaemonCmd, EncodeModeCmd, GlobalArgs, PollerCmd, UsersAction,
};
use config::Config;
use error::{exit, AppError};
use heartbeat::DaemonStopResult;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match cli::parse(args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(exit::USAGE);
        }
    };

    if let Command::Help(topic) = &cli.command {
        println!("{}", cli::help_text(topic.as_deref()));
        return;
    }

    let config = match Config::load(cli.global.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("twitchgrab: {:#}", e);
            std::process::exit(exit::USAGE);
        }
    };

    // Daemons log to a rolling file unless systemd owns their stdout;
    // everything else logs to stdout. The guard must outlive the runtime.
    let _guard = match &cli.command {
        Command::EncodeDaemon(EncodeDaemonCmd::Run(_)) => {
            logging::init_daemon("encoderd", cli.global.json_logs, &config.paths.logs_dir)
                .unwrap_or_else(|e| {
                    eprintln!("twitchgrab: {:#}", e);
                    logging::init(cli.global.json_logs);
                    None
                })
        }
        Command::Poller(PollerCmd::Run(_)) => {
            logging::init_daemon("pollerd", cli.global.json_logs, &config.paths.logs_dir)
                .unwrap_or_else(|e| {
                    eprintln!("twitchgrab: {:#}", e);
                    logging::init(cli.global.json_logs);
                    None
                })
        }
        _ => {
            logging::init(cli.global.json_logs);
            None
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("twitchgrab: failed to start runtime: {}", e);
            std::process::exit(exit::FAILURE);
        }
    };

    let code = runtime.block_on(dispatch(cli, config));
    std::process::exit(code);
}

async fn dispatch(cli: Cli, config: Config) -> i32 {
    let global = cli.global.clone();
    match cli.command {
        Command::Record(args) => run_record(args, config).await,
        Command::EncodeDaemon(cmd) => run_encode_daemon(cmd, config, &global).await,
        Command::Poller(cmd) => run_poller(cmd, config, &global).await,
        Command::StopSlot(args) => run_stop_slot(args, config, &global).await,
        Command::Status(args) => run_status(args, config, &global),
        Command::Clean(args) => run_clean(args, config, &global),
        Command::Doctor(args) => run_doctor(args, config).await,
        Command::Users(args) => run_users(args, config),
        Command::EncodeMode(cmd) => run_encode_mode(cmd, config, &global),
        Command::TsCompress(args) => run_tscompress(args, config).await,
        Command::Help(_) => exit::OK,
    }
}

fn fail(e: AppError) -> i32 {
    error!("{}", e);
    e.exit_code()
}

/// Structured one-line command output, JSON when `--json-logs` is set.
fn emit(json: bool, event: &str, fields: &[(&str, String)]) {
    if json {
        let mut map = serde_json::Map::new();
        map.insert("event".into(), event.into());
        for (key, value) in fields {
            map.insert((*key).into(), value.clone().into());
        }
        println!("{}", serde_json::Value::Object(map));
    } else if fields.is_empty() {
        println!("{}", event);
    } else {
        let detail: Vec<String> = fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!("{}: {}", event, detail.join(" "));
    }
}

async fn run_record(args: cli::RecordArgs, config: Config) -> i32 {
    if args.delete_input_on_success.is_some() {
        // The deletion decision is made by the encode daemon from its own
        // configuration; the job file does not carry it.
        tracing::warn!(
            "--delete-input-on-success has no effect on 'record'; set record.delete_input_on_success where the encode daemon reads it"
        );
    }
    let opts = recorder::RecordOptions {
        username: args.username,
        quality: args.quality.unwrap_or(config.record.quality),
        retry_delay: Duration::from_secs(args.retry_delay.unwrap_or(config.record.retry_delay)),
        retry_window: Duration::from_secs(args.retry_window.unwrap_or(config.record.retry_window)),
        loglevel: args.loglevel.unwrap_or(config.record.loglevel),
        output_dir: expand(args.output_dir.unwrap_or(config.paths.record_dir)),
        queue_dir: expand(args.queue_dir.unwrap_or(config.paths.queue_dir)),
        enable_remux: args.enable_remux.unwrap_or(config.record.enable_remux),
        delete_ts_after_remux: args
            .delete_ts_after_remux
            .unwrap_or(config.record.delete_ts_after_remux),
        record_limit: args.record_limit.unwrap_or(config.limits.record_limit),
        fail_fast: args.fail_fast,
        disk_free_min_bytes: config.storage.min_free_bytes(),
        encode_params: config.encode_daemon.params(),
    };
    match recorder::record(opts).await {
        Ok(()) => exit::OK,
        Err(e) => fail(e),
    }
}

async fn run_encode_daemon(cmd: EncodeDaemonCmd, config: Config, global: &GlobalArgs) -> i32 {
    match cmd {
        EncodeDaemonCmd::Run(args) => {
            let mut overrides = config.encode_daemon.clone();
            if args.preset.is_some() {
                overrides.preset = args.preset;
            }
            if args.crf.is_some() {
                overrides.crf = args.crf;
            }
            if args.threads.is_some() {
                overrides.threads = args.threads;
            }
            if args.height.is_some() {
                overrides.height = args.height;
            }
            if args.fps.is_some() {
                overrides.fps = args.fps;
            }
            if args.loglevel.is_some() {
                overrides.loglevel = args.loglevel;
            }
            let opts = encoderd::EncodeDaemonOptions {
                queue_dir: expand(args.queue_dir.unwrap_or(config.paths.queue_dir)),
                record_limit: args.record_limit.unwrap_or(config.limits.record_limit),
                disk_free_min_bytes: config.storage.min_free_bytes(),
                overrides,
                delete_input_on_success: config.record.delete_input_on_success,
            };
            match encoderd::run(opts).await {
                Ok(()) => exit::OK,
                Err(AppError::Busy) => {
                    error!("another encode daemon is already running");
                    exit::BUSY
                }
                Err(e) => fail(e),
            }
        }
        EncodeDaemonCmd::Stop(args) => {
            stop_daemon_command(
                &heartbeat::encoder_status_path(),
                "encoder",
                args,
                global.json_logs,
            )
            .await
        }
        EncodeDaemonCmd::Status => {
            let running = heartbeat::singleton_held(&heartbeat::encoder_lock_path());
            let status: Option<heartbeat::EncoderStatus> =
                heartbeat::read(&heartbeat::encoder_status_path());
            if global.json_logs {
                let value = serde_json::json!({
                    "event": "encoder-status",
                    "running": running,
                    "status": status,
                });
                println!("{}", value);
            } else if running {
                match status {
                    Some(s) => {
                        println!("Encoder daemon: running (pid={}, started={})", s.pid, s.started_at.to_rfc3339());
                        println!("State: {}", s.state.as_str());
                        if let Some(job) = s.current_job {
                            println!("Current job: {}", job);
                        }
                        if let Some(job) = s.last_job {
                            println!("Last job: {}", job);
                        }
                    }
                    None => println!("Encoder daemon: running"),
                }
            } else {
                println!("Encoder daemon: not running");
            }
            exit::OK
        }
    }
}

async fn run_poller(cmd: PollerCmd, config: Config, global: &GlobalArgs) -> i32 {
    match cmd {
        PollerCmd::Run(args) => {
            let opts = pollerd::PollerOptions {
                users_file: expand(args.users_file.unwrap_or(config.poller.users_file)),
                interval: Duration::from_secs(args.interval.unwrap_or(config.poller.interval)),
                quality: args.quality.unwrap_or(config.poller.quality),
                download_cmd: args.download_cmd.unwrap_or(config.poller.download_cmd),
                timeout: Duration::from_secs(args.timeout.unwrap_or(config.poller.timeout)),
                probe_concurrency: args
                    .probe_concurrency
                    .unwrap_or(config.poller.probe_concurrency),
                record_limit: args.record_limit.unwrap_or(config.limits.record_limit),
                logs_dir: expand(args.logs_dir.unwrap_or(config.paths.logs_dir)),
                config_path: global.config.clone(),
                json_logs: global.json_logs,
            };
            match pollerd::run(opts).await {
                Ok(()) => exit::OK,
                Err(AppError::Busy) => {
                    error!("another poller is already running");
                    exit::BUSY
                }
                Err(e) => fail(e),
            }
        }
        PollerCmd::Stop(args) => {
            stop_daemon_command(
                &heartbeat::poller_status_path(),
                "poller",
                args,
                global.json_logs,
            )
            .await
        }
        PollerCmd::Status => {
            let running = heartbeat::singleton_held(&heartbeat::poller_lock_path());
            let status: Option<heartbeat::PollerStatus> =
                heartbeat::read(&heartbeat::poller_status_path());
            if global.json_logs {
                let value = serde_json::json!({
                    "event": "poller-status",
                    "running": running,
                    "status": status,
                });
                println!("{}", value);
            } else if running {
                match status {
                    Some(s) => {
                        println!("Poller: running (pid={}, started={})", s.pid, s.started_at.to_rfc3339());
                        if let Some(last) = s.last_poll {
                            println!("Last poll: {}", last.to_rfc3339());
                        }
                        if let Some(next) = s.next_poll {
                            println!("Next poll: {}", next.to_rfc3339());
                            let minutes =
                                (next - chrono::Utc::now()).num_seconds().max(0) as f64 / 60.0;
                            println!("Next poll in: {:.1} minute(s)", minutes);
                        }
                        println!("Interval: {} seconds", s.interval_secs);
                        println!("Cycles: {}", s.cycle_count);
                    }
                    None => println!("Poller: running"),
                }
            } else {
                println!("Poller: not running");
            }
            exit::OK
        }
    }
}

async fn stop_daemon_command(
    status_path: &std::path::Path,
    name: &str,
    args: cli::StopDaemonArgs,
    json: bool,
) -> i32 {
    let timeout = Duration::from_secs(args.timeout_secs);
    match heartbeat::stop_daemon(status_path, timeout, args.force).await {
        DaemonStopResult::NotRunning => {
            emit(json, &format!("{}-not-running", name), &[]);
            exit::OK
        }
        DaemonStopResult::Stopped { pid, forced } => {
            let signal = if forced { "SIGKILL" } else { "SIGTERM" };
            emit(
                json,
                &format!("{}-stopped", name),
                &[("pid", pid.to_string()), ("signal", signal.to_string())],
            );
            exit::OK
        }
        DaemonStopResult::StillRunning { pid } => {
            emit(
                json,
                &format!("{}-stop-timeout", name),
                &[("pid", pid.to_string())],
            );
            exit::FAILURE
        }
    }
}

async fn run_stop_slot(args: cli::StopSlotArgs, config: Config, global: &GlobalArgs) -> i32 {
    let record_limit = args.record_limit.unwrap_or(config.limits.record_limit);
    if args.slot < 1 || args.slot > record_limit {
        emit(
            global.json_logs,
            "invalid-slot",
            &[
                ("slot", args.slot.to_string()),
                ("record_limit", record_limit.to_string()),
            ],
        );
        return exit::USAGE;
    }

    let registry = match locks::SlotRegistry::new(record_limit) {
        Ok(registry) => registry,
        Err(e) => return fail(e),
    };
    let owner = registry
        .enumerate()
        .unwrap_or_default()
        .into_iter()
        .find(|o| o.slot == args.slot);
    let Some(owner) = owner else {
        emit(
            global.json_logs,
            "slot-idle",
            &[("slot", args.slot.to_string())],
        );
        return exit::NOT_LIVE;
    };

    emit(
        global.json_logs,
        "signal-sent",
        &[
            ("slot", args.slot.to_string()),
            ("pid", owner.owner.pid.to_string()),
            ("username", owner.owner.username.clone()),
            ("signal", "SIGINT".to_string()),
        ],
    );

    let outcome = procutil::signal_and_wait(
        owner.owner.pid,
        libc::SIGINT,
        Duration::from_secs(args.timeout_secs),
        args.force,
    )
    .await;
    registry.sweep().ok();

    match outcome {
        procutil::StopOutcome::NotRunning => {
            emit(
                global.json_logs,
                "process-missing",
                &[("slot", args.slot.to_string())],
            );
            exit::OK
        }
        procutil::StopOutcome::Stopped { forced } => {
            let signal = if forced { "SIGKILL" } else { "SIGINT" };
            emit(
                global.json_logs,
                "stopped",
                &[
                    ("slot", args.slot.to_string()),
                    ("pid", owner.owner.pid.to_string()),
                    ("method", signal.to_string()),
                ],
            );
            exit::OK
        }
        procutil::StopOutcome::StillRunning => {
            emit(
                global.json_logs,
                "still-running",
                &[
                    ("slot", args.slot.to_string()),
                    ("pid", owner.owner.pid.to_string()),
                ],
            );
            exit::FAILURE
        }
    }
}

fn run_status(args: cli::StatusArgs, config: Config, global: &GlobalArgs) -> i32 {
    let record_limit = args.record_limit.unwrap_or(config.limits.record_limit);
    let registry = match locks::SlotRegistry::new(record_limit) {
        Ok(registry) => registry,
        Err(e) => return fail(e),
    };
    let queue_dir = expand(args.queue_dir.unwrap_or(config.paths.queue_dir));
    let queue = match queue::JobQueue::open(&queue_dir) {
        Ok(queue) => queue,
        Err(e) => return fail(e),
    };
    match status::gather(&registry, &queue) {
        Ok(report) => {
            if global.json_logs {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        error!("failed to serialize status: {}", e);
                        return exit::FAILURE;
                    }
                }
            } else {
                print!("{}", status::render(&report));
            }
            exit::OK
        }
        Err(e) => {
            error!("failed to gather status: {:#}", e);
            exit::FAILURE
        }
    }
}

fn run_clean(args: cli::CleanArgs, config: Config, global: &GlobalArgs) -> i32 {
    let record_limit = args.record_limit.unwrap_or(config.limits.record_limit);
    let registry = match locks::SlotRegistry::new(record_limit) {
        Ok(registry) => registry,
        Err(e) => return fail(e),
    };
    let queue = match queue::JobQueue::open(&expand(config.paths.queue_dir)) {
        Ok(queue) => queue,
        Err(e) => return fail(e),
    };
    let report = doctor::clean(
        &registry,
        &queue,
        &expand(config.paths.record_dir),
        &locks::default_user_locks_dir(),
    );

    if global.json_logs {
        println!(
            "{}",
            serde_json::json!({ "event": "clean", "report": report })
        );
    } else {
        println!(
            "Removed {} stale owner record(s), recovered {} inflight job(s), removed {} orphaned temp file(s).",
            report.stale_owners_removed, report.inflight_recovered, report.temp_files_removed
        );
        let active = registry.enumerate().unwrap_or_default();
        if active.is_empty() {
            println!("No active downloads.");
        } else {
            println!("Active downloads:");
            for owner in active {
                println!(
                    "  slot {}: {} (pid={}, since={})",
                    owner.slot,
                    owner.owner.username,
                    owner.owner.pid,
                    owner.owner.started_at.to_rfc3339()
                );
            }
        }
    }
    exit::OK
}

async fn run_doctor(args: cli::DoctorArgs, config: Config) -> i32 {
    let registry = match locks::SlotRegistry::new(config.limits.record_limit) {
        Ok(registry) => registry,
        Err(e) => return fail(e),
    };
    let queue_dir = expand(args.queue_dir.unwrap_or(config.paths.queue_dir));
    let queue = match queue::JobQueue::open(&queue_dir) {
        Ok(queue) => queue,
        Err(e) => return fail(e),
    };
    let logs_dir = expand(args.logs_dir.unwrap_or(config.paths.logs_dir));
    if doctor::doctor(&registry, &queue, &logs_dir).await {
        exit::OK
    } else {
        exit::FAILURE
    }
}

fn run_users(args: cli::UsersArgs, config: Config) -> i32 {
    let path = expand(args.users_file.unwrap_or(config.poller.users_file));
    match args.action {
        UsersAction::List => match users::list_users(&path) {
            Ok(list) => {
                if list.is_empty() {
                    println!("No users configured (source: {}).", path.display());
                } else {
                    println!("Users file: {}", path.display());
                    for user in list {
                        println!("{}", user);
                    }
                }
                exit::OK
            }
            Err(e) => {
                error!("{:#}", e);
                exit::FAILURE
            }
        },
        UsersAction::Add(names) => match users::add_users(&path, &names) {
            Ok((added, skipped, invalid)) => {
                if !added.is_empty() {
                    println!("Added {} user(s): {}", added.len(), added.join(", "));
                }
                if !skipped.is_empty() {
                    println!("Skipped existing user(s): {}", skipped.join(", "));
                }
                if !invalid.is_empty() {
                    eprintln!("Invalid username(s): {}", invalid.join(", "));
                    return exit::FAILURE;
                }
                exit::OK
            }
            Err(e) => {
                error!("{:#}", e);
                exit::FAILURE
            }
        },
        UsersAction::Remove(names) => match users::remove_users(&path, &names) {
            Ok(removed) => {
                if removed.is_empty() {
                    println!("No matching users found to remove.");
                    exit::FAILURE
                } else {
                    println!("Removed {} user(s): {}", removed.len(), removed.join(", "));
                    exit::OK
                }
            }
            Err(e) => {
                error!("{:#}", e);
                exit::FAILURE
            }
        },
    }
}

fn run_encode_mode(cmd: EncodeModeCmd, config: Config, global: &GlobalArgs) -> i32 {
    let path = global
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let desired = match cmd {
        EncodeModeCmd::Status => {
            emit(
                global.json_logs,
                "encode-mode-status",
                &[("enabled", config.record.enable_remux.to_string())],
            );
            return exit::OK;
        }
        EncodeModeCmd::On => true,
        EncodeModeCmd::Off => false,
    };

    // Compare against the file itself, not the env-overlaid view, so a
    // masking environment variable cannot suppress a real edit.
    let file_value = std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| toml::from_str::<Config>(&text).ok())
        .map(|file_config| file_config.record.enable_remux);
    if file_value == Some(desired) {
        emit(
            global.json_logs,
            "encode-mode-unchanged",
            &[
                ("enabled", desired.to_string()),
                ("config", path.display().to_string()),
            ],
        );
        return exit::OK;
    }

    match config::set_enable_remux(&path, desired) {
        Ok(()) => {
            emit(
                global.json_logs,
                "encode-mode-set",
                &[
                    ("enabled", desired.to_string()),
                    ("config", path.display().to_string()),
                ],
            );
            exit::OK
        }
        Err(e) => {
            error!("{:#}", e);
            exit::FAILURE
        }
    }
}

async fn run_tscompress(args: cli::TsCompressArgs, config: Config) -> i32 {
    let mut overrides = config.encode_daemon.clone();
    if args.height.is_some() {
        overrides.height = args.height;
    }
    if args.fps.is_some() {
        overrides.fps = args.fps;
    }
    if args.crf.is_some() {
        overrides.crf = args.crf;
    }
    if args.preset.is_some() {
        overrides.preset = args.preset;
    }
    if args.threads.is_some() {
        overrides.threads = args.threads;
    }
    if args.loglevel.is_some() {
        overrides.loglevel = args.loglevel;
    }
    let opts = tscompress::TsCompressOptions {
        inputs: args.inputs,
        params: overrides.params(),
        delete_ts_after_remux: args.delete_ts_after_remux,
        delete_input_on_success: args.delete_input_on_success
            || config.record.delete_input_on_success,
        overwrite: args.overwrite,
    };
    match tscompress::run(opts).await {
        Ok(()) => exit::OK,
        Err(e) => fail(e),
    }
}

fn expand(path: PathBuf) -> PathBuf {
    config::expand_user_path(&path)
}
