//! Hand-rolled command-line parsing: subcommand match plus per-command
//! flag loops, with usage text on stderr for anything malformed.
//!
//! The global flags `--json-logs` and `--config PATH` are accepted
//! anywhere on the line. Bare `poller` / `encode-daemon` imply `run`.

use std::path::PathBuf;

use crate::config::Fps;

#[derive(Debug, Default, Clone)]
pub struct GlobalArgs {
    pub json_logs: bool,
    pub config: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Cli {
    pub global: GlobalArgs,
    pub command: Command,
}

#[derive(Debug)]
pub enum Command {
    Record(RecordArgs),
    EncodeDaemon(EncodeDaemonCmd),
    Poller(PollerCmd),
    StopSlot(StopSlotArgs),
    Status(StatusArgs),
    Clean(CleanArgs),
    Doctor(DoctorArgs),
    Users(UsersArgs),
    EncodeMode(EncodeModeCmd),
    TsCompress(TsCompressArgs),
    Help(Option<String>),
}

#[derive(Debug, Default)]
pub struct RecordArgs {
    pub username: String,
    pub quality: Option<String>,
    pub retry_delay: Option<u64>,
    pub retry_window: Option<u64>,
    pub loglevel: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub queue_dir: Option<PathBuf>,
    pub enable_remux: Option<bool>,
    pub delete_ts_after_remux: Option<bool>,
    pub delete_input_on_success: Option<bool>,
    pub record_limit: Option<u32>,
    pub fail_fast: bool,
}

#[derive(Debug)]
pub enum EncodeDaemonCmd {
    Run(EncodeDaemonRunArgs),
    Stop(StopDaemonArgs),
    Status,
}

#[derive(Debug, Default)]
pub struct EncodeDaemonRunArgs {
    pub queue_dir: Option<PathBuf>,
    pub preset: Option<String>,
    pub crf: Option<u32>,
    pub threads: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<Fps>,
    pub loglevel: Option<String>,
    pub record_limit: Option<u32>,
}

#[derive(Debug)]
pub enum PollerCmd {
    Run(PollerRunArgs),
    Stop(StopDaemonArgs),
    Status,
}

#[derive(Debug, Default)]
pub struct PollerRunArgs {
    pub users_file: Option<PathBuf>,
    pub interval: Option<u64>,
    pub quality: Option<String>,
    pub download_cmd: Option<String>,
    pub timeout: Option<u64>,
    pub probe_concurrency: Option<usize>,
    pub record_limit: Option<u32>,
    pub logs_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct StopDaemonArgs {
    pub timeout_secs: u64,
    pub force: bool,
}

impl Default for StopDaemonArgs {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            force: false,
        }
    }
}

#[derive(Debug)]
pub struct StopSlotArgs {
    pub slot: u32,
    pub record_limit: Option<u32>,
    pub timeout_secs: u64,
    pub force: bool,
}

#[derive(Debug, Default)]
pub struct StatusArgs {
    pub queue_dir: Option<PathBuf>,
    pub record_limit: Option<u32>,
}

#[derive(Debug, Default)]
pub struct CleanArgs {
    pub record_limit: Option<u32>,
}

#[derive(Debug, Default)]
pub struct DoctorArgs {
    pub queue_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct UsersArgs {
    pub users_file: Option<PathBuf>,
    pub action: UsersAction,
}

#[derive(Debug)]
pub enum UsersAction {
    List,
    Add(Vec<String>),
    Remove(Vec<String>),
}

#[derive(Debug)]
pub enum EncodeModeCmd {
    On,
    Off,
    Status,
}

#[derive(Debug, Default)]
pub struct TsCompressArgs {
    pub inputs: Vec<PathBuf>,
    pub height: Option<u32>,
    pub fps: Option<Fps>,
    pub crf: Option<u32>,
    pub preset: Option<String>,
    pub threads: Option<u32>,
    pub loglevel: Option<String>,
    pub delete_ts_after_remux: bool,
    pub overwrite: bool,
    pub delete_input_on_success: bool,
}

#[derive(Debug)]
pub struct UsageError(pub String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn usage() -> &'static str {
    "twitchgrab - Twitch recorder, encode queue and live-user poller

USAGE:
    twitchgrab [--json-logs] [--config PATH] <command> [options]

COMMANDS:
    record USER        record one user to a finalized artifact
    encode-daemon      run | stop | status for the encode daemon
    poller             run | stop | status for the live-user poller
    stop SLOT          interrupt the recorder holding a slot
    status             show slots, queue and daemon state
    clean              sweep stale owners, inflight jobs, temp residue
    doctor             check tools, directories and disk headroom
    users              list | add | remove poller users
    encode-mode        on | off | status for the remux/encode pipeline
    tscompress FILE..  remux and compress existing .ts files serially
    help [command]     show help for a command

Run 'twitchgrab help <command>' for command options."
}

fn command_usage(topic: &str) -> Option<&'static str> {
    Some(match topic {
        "record" => {
            "USAGE: twitchgrab record USER [options]
    --quality Q                 stream quality (default: best)
    --retry-delay S             seconds between retries when offline
    --retry-window S            keep retrying this long after a cut
    --loglevel L                capture/mux tool loglevel
    --output-dir DIR            where finalized artifacts land
    --queue-dir DIR             encode queue base directory
    --remux | --no-remux        toggle remux to mp4 (and the encode queue)
    --delete-ts-after-remux | --no-delete-ts-after-remux
    --delete-input-on-success | --no-delete-input-on-success
    --record-limit N            global concurrent-recording cap
    --fail-fast                 exit busy instead of waiting for a slot"
        }
        "encode-daemon" => {
            "USAGE: twitchgrab encode-daemon [run|stop|status] [options]
  run:
    --queue-dir DIR   --preset P   --crf N   --threads N
    --height N        --fps V (auto, number, or num/den)
    --loglevel L      --record-limit N
  stop:
    --timeout S       --force"
        }
        "poller" => {
            "USAGE: twitchgrab poller [run|stop|status] [options]
  run:
    --users-file F    --interval S   --quality Q
    --download-cmd C  --timeout S    --probe-concurrency N
    --record-limit N  --logs-dir DIR
  stop:
    --timeout S       --force"
        }
        "stop" => {
            "USAGE: twitchgrab stop SLOT [options]
    --record-limit N   --timeout S (default 10)   --force"
        }
        "status" => "USAGE: twitchgrab status [--queue-dir DIR] [--record-limit N]",
        "clean" => "USAGE: twitchgrab clean [--record-limit N]",
        "doctor" => "USAGE: twitchgrab doctor [--queue-dir DIR] [--logs-dir DIR]",
        "users" => {
            "USAGE: twitchgrab users [--users-file F] list
       twitchgrab users [--users-file F] add USER...
       twitchgrab users [--users-file F] remove USER..."
        }
        "encode-mode" => "USAGE: twitchgrab encode-mode on|off|status",
        "tscompress" => {
            "USAGE: twitchgrab tscompress FILE... [options]
    --height N   --fps V   --crf N   --preset P   --threads N
    --loglevel L --delete-ts-after-remux --overwrite
    --delete-input-on-success"
        }
        _ => return None,
    })
}

pub fn help_text(topic: Option<&str>) -> String {
    match topic {
        None => usage().to_string(),
        Some(topic) => command_usage(topic)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown command '{}'\n\n{}", topic, usage())),
    }
}

pub fn parse(mut args: Vec<String>) -> Result<Cli, UsageError> {
    let mut global = GlobalArgs::default();

    // Global flags are stripped wherever they appear.
    let mut stripped: Vec<String> = Vec::with_capacity(args.len());
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--json-logs" => global.json_logs = true,
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| UsageError("missing value for --config".into()))?;
                global.config = Some(PathBuf::from(value));
            }
            _ => stripped.push(args[i].clone()),
        }
        i += 1;
    }
    args = stripped;

    if args.is_empty() {
        return Err(UsageError(format!("missing command\n\n{}", usage())));
    }
    let command_name = args.remove(0);

    let command = match command_name.as_str() {
        "record" => Command::Record(parse_record(args)?),
        "encode-daemon" => Command::EncodeDaemon(parse_encode_daemon(args)?),
        "poller" => Command::Poller(parse_poller(args)?),
        "stop" => Command::StopSlot(parse_stop_slot(args)?),
        "status" => Command::Status(parse_status(args)?),
        "clean" => Command::Clean(parse_clean(args)?),
        "doctor" => Command::Doctor(parse_doctor(args)?),
        "users" => Command::Users(parse_users(args)?),
        "encode-mode" => Command::EncodeMode(parse_encode_mode(args)?),
        "tscompress" => Command::TsCompress(parse_tscompress(args)?),
        "help" | "-h" | "--help" => Command::Help(args.first().cloned()),
        other => {
            return Err(UsageError(format!(
                "unknown command '{}'\n\n{}",
                other,
                usage()
            )))
        }
    };

    Ok(Cli { global, command })
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, UsageError> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| UsageError(format!("missing value for {}", flag)))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T, UsageError> {
    value
        .parse()
        .map_err(|_| UsageError(format!("invalid value '{}' for {}", value, flag)))
}

fn parse_fps(value: &str) -> Result<Fps, UsageError> {
    value.parse().map_err(UsageError)
}

fn parse_record(args: Vec<String>) -> Result<RecordArgs, UsageError> {
    let mut out = RecordArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--quality" => out.quality = Some(take_value(&args, &mut i, "--quality")?),
            "--retry-delay" => {
                out.retry_delay = Some(parse_number(
                    &take_value(&args, &mut i, "--retry-delay")?,
                    "--retry-delay",
                )?)
            }
            "--retry-window" => {
                out.retry_window = Some(parse_number(
                    &take_value(&args, &mut i, "--retry-window")?,
                    "--retry-window",
                )?)
            }
            "--loglevel" => out.loglevel = Some(take_value(&args, &mut i, "--loglevel")?),
            "--output-dir" => {
                out.output_dir = Some(PathBuf::from(take_value(&args, &mut i, "--output-dir")?))
            }
            "--queue-dir" => {
                out.queue_dir = Some(PathBuf::from(take_value(&args, &mut i, "--queue-dir")?))
            }
            "--remux" => out.enable_remux = Some(true),
            "--no-remux" => out.enable_remux = Some(false),
            "--delete-ts-after-remux" => out.delete_ts_after_remux = Some(true),
            "--no-delete-ts-after-remux" => out.delete_ts_after_remux = Some(false),
            "--delete-input-on-success" => out.delete_input_on_success = Some(true),
            "--no-delete-input-on-success" => out.delete_input_on_success = Some(false),
            "--record-limit" => {
                out.record_limit = Some(parse_number(
                    &take_value(&args, &mut i, "--record-limit")?,
                    "--record-limit",
                )?)
            }
            "--fail-fast" => out.fail_fast = true,
            flag if flag.starts_with('-') => {
                return Err(UsageError(format!("unknown flag for record: {}", flag)))
            }
            positional => {
                if !out.username.is_empty() {
                    return Err(UsageError(format!(
                        "unexpected extra argument '{}'",
                        positional
                    )));
                }
                out.username = positional.to_string();
            }
        }
        i += 1;
    }
    if out.username.is_empty() {
        return Err(UsageError("record requires a username".into()));
    }
    Ok(out)
}

fn parse_encode_daemon(mut args: Vec<String>) -> Result<EncodeDaemonCmd, UsageError> {
    auto_insert_run(&mut args);
    let sub = args.remove(0);
    match sub.as_str() {
        "run" => {
            let mut out = EncodeDaemonRunArgs::default();
            let mut i = 0;
            while i < args.len() {
                match args[i].as_str() {
                    "--queue-dir" => {
                        out.queue_dir =
                            Some(PathBuf::from(take_value(&args, &mut i, "--queue-dir")?))
                    }
                    "--preset" => out.preset = Some(take_value(&args, &mut i, "--preset")?),
                    "--crf" => {
                        out.crf = Some(parse_number(&take_value(&args, &mut i, "--crf")?, "--crf")?)
                    }
                    "--threads" => {
                        out.threads = Some(parse_number(
                            &take_value(&args, &mut i, "--threads")?,
                            "--threads",
                        )?)
                    }
                    "--height" => {
                        out.height = Some(parse_number(
                            &take_value(&args, &mut i, "--height")?,
                            "--height",
                        )?)
                    }
                    "--fps" => out.fps = Some(parse_fps(&take_value(&args, &mut i, "--fps")?)?),
                    "--loglevel" => out.loglevel = Some(take_value(&args, &mut i, "--loglevel")?),
                    "--record-limit" => {
                        out.record_limit = Some(parse_number(
                            &take_value(&args, &mut i, "--record-limit")?,
                            "--record-limit",
                        )?)
                    }
                    flag => {
                        return Err(UsageError(format!(
                            "unknown flag for encode-daemon run: {}",
                            flag
                        )))
                    }
                }
                i += 1;
            }
            Ok(EncodeDaemonCmd::Run(out))
        }
        "stop" => Ok(EncodeDaemonCmd::Stop(parse_stop_daemon(args)?)),
        "status" => Ok(EncodeDaemonCmd::Status),
        other => Err(UsageError(format!(
            "unknown encode-daemon subcommand '{}'",
            other
        ))),
    }
}

fn parse_poller(mut args: Vec<String>) -> Result<PollerCmd, UsageError> {
    auto_insert_run(&mut args);
    let sub = args.remove(0);
    match sub.as_str() {
        "run" => {
            let mut out = PollerRunArgs::default();
            let mut i = 0;
            while i < args.len() {
                match args[i].as_str() {
                    "--users-file" => {
                        out.users_file =
                            Some(PathBuf::from(take_value(&args, &mut i, "--users-file")?))
                    }
                    "--interval" => {
                        out.interval = Some(parse_number(
                            &take_value(&args, &mut i, "--interval")?,
                            "--interval",
                        )?)
                    }
                    "--quality" => out.quality = Some(take_value(&args, &mut i, "--quality")?),
                    "--download-cmd" => {
                        out.download_cmd = Some(take_value(&args, &mut i, "--download-cmd")?)
                    }
                    "--timeout" => {
                        out.timeout = Some(parse_number(
                            &take_value(&args, &mut i, "--timeout")?,
                            "--timeout",
                        )?)
                    }
                    "--probe-concurrency" => {
                        out.probe_concurrency = Some(parse_number(
                            &take_value(&args, &mut i, "--probe-concurrency")?,
                            "--probe-concurrency",
                        )?)
                    }
                    "--record-limit" => {
                        out.record_limit = Some(parse_number(
                            &take_value(&args, &mut i, "--record-limit")?,
                            "--record-limit",
                        )?)
                    }
                    "--logs-dir" => {
                        out.logs_dir = Some(PathBuf::from(take_value(&args, &mut i, "--logs-dir")?))
                    }
                    flag => {
                        return Err(UsageError(format!("unknown flag for poller run: {}", flag)))
                    }
                }
                i += 1;
            }
            Ok(PollerCmd::Run(out))
        }
        "stop" => Ok(PollerCmd::Stop(parse_stop_daemon(args)?)),
        "status" => Ok(PollerCmd::Status),
        other => Err(UsageError(format!("unknown poller subcommand '{}'", other))),
    }
}

/// Bare `poller` / `encode-daemon` (or one followed directly by flags)
/// implies the `run` subcommand.
fn auto_insert_run(args: &mut Vec<String>) {
    match args.first().map(String::as_str) {
        None => args.push("run".into()),
        Some("run") | Some("stop") | Some("status") => {}
        Some(_) => args.insert(0, "run".into()),
    }
}

fn parse_stop_daemon(args: Vec<String>) -> Result<StopDaemonArgs, UsageError> {
    let mut out = StopDaemonArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--timeout" => {
                out.timeout_secs =
                    parse_number(&take_value(&args, &mut i, "--timeout")?, "--timeout")?
            }
            "--force" => out.force = true,
            flag => return Err(UsageError(format!("unknown flag for stop: {}", flag))),
        }
        i += 1;
    }
    Ok(out)
}

fn parse_stop_slot(args: Vec<String>) -> Result<StopSlotArgs, UsageError> {
    let mut slot: Option<u32> = None;
    let mut out = StopSlotArgs {
        slot: 0,
        record_limit: None,
        timeout_secs: 10,
        force: false,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--record-limit" => {
                out.record_limit = Some(parse_number(
                    &take_value(&args, &mut i, "--record-limit")?,
                    "--record-limit",
                )?)
            }
            "--timeout" => {
                out.timeout_secs =
                    parse_number(&take_value(&args, &mut i, "--timeout")?, "--timeout")?
            }
            "--force" => out.force = true,
            flag if flag.starts_with('-') => {
                return Err(UsageError(format!("unknown flag for stop: {}", flag)))
            }
            positional => {
                if slot.is_some() {
                    return Err(UsageError(format!(
                        "unexpected extra argument '{}'",
                        positional
                    )));
                }
                slot = Some(parse_number(positional, "SLOT")?);
            }
        }
        i += 1;
    }
    out.slot = slot.ok_or_else(|| UsageError("stop requires a slot number".into()))?;
    Ok(out)
}

fn parse_status(args: Vec<String>) -> Result<StatusArgs, UsageError> {
    let mut out = StatusArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--queue-dir" => {
                out.queue_dir = Some(PathBuf::from(take_value(&args, &mut i, "--queue-dir")?))
            }
            "--record-limit" => {
                out.record_limit = Some(parse_number(
                    &take_value(&args, &mut i, "--record-limit")?,
                    "--record-limit",
                )?)
            }
            flag => return Err(UsageError(format!("unknown flag for status: {}", flag))),
        }
        i += 1;
    }
    Ok(out)
}

fn parse_clean(args: Vec<String>) -> Result<CleanArgs, UsageError> {
    let mut out = CleanArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--record-limit" => {
                out.record_limit = Some(parse_number(
                    &take_value(&args, &mut i, "--record-limit")?,
                    "--record-limit",
                )?)
            }
            flag => return Err(UsageError(format!("unknown flag for clean: {}", flag))),
        }
        i += 1;
    }
    Ok(out)
}

fn parse_doctor(args: Vec<String>) -> Result<DoctorArgs, UsageError> {
    let mut out = DoctorArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--queue-dir" => {
                out.queue_dir = Some(PathBuf::from(take_value(&args, &mut i, "--queue-dir")?))
            }
            "--logs-dir" => {
                out.logs_dir = Some(PathBuf::from(take_value(&args, &mut i, "--logs-dir")?))
            }
            flag => return Err(UsageError(format!("unknown flag for doctor: {}", flag))),
        }
        i += 1;
    }
    Ok(out)
}

fn parse_users(args: Vec<String>) -> Result<UsersArgs, UsageError> {
    let mut users_file: Option<PathBuf> = None;
    let mut rest: Vec<String> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--users-file" => {
                users_file = Some(PathBuf::from(take_value(&args, &mut i, "--users-file")?))
            }
            other => rest.push(other.to_string()),
        }
        i += 1;
    }
    if rest.is_empty() {
        return Err(UsageError("users requires list, add or remove".into()));
    }
    let action = rest.remove(0);
    let action = match action.as_str() {
        "list" => {
            if !rest.is_empty() {
                return Err(UsageError("users list takes no arguments".into()));
            }
            UsersAction::List
        }
        "add" => {
            if rest.is_empty() {
                return Err(UsageError("users add requires at least one username".into()));
            }
            UsersAction::Add(rest)
        }
        "remove" => {
            if rest.is_empty() {
                return Err(UsageError(
                    "users remove requires at least one username".into(),
                ));
            }
            UsersAction::Remove(rest)
        }
        other => {
            return Err(UsageError(format!(
                "unknown users subcommand '{}'",
                other
            )))
        }
    };
    Ok(UsersArgs { users_file, action })
}

fn parse_encode_mode(args: Vec<String>) -> Result<EncodeModeCmd, UsageError> {
    match args.first().map(String::as_str) {
        Some("on") => Ok(EncodeModeCmd::On),
        Some("off") => Ok(EncodeModeCmd::Off),
        Some("status") => Ok(EncodeModeCmd::Status),
        Some(other) => Err(UsageError(format!(
            "unknown encode-mode subcommand '{}'",
            other
        ))),
        None => Err(UsageError("encode-mode requires on, off or status".into())),
    }
}

fn parse_tscompress(args: Vec<String>) -> Result<TsCompressArgs, UsageError> {
    let mut out = TsCompressArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--height" => {
                out.height = Some(parse_number(
                    &take_value(&args, &mut i, "--height")?,
                    "--height",
                )?)
            }
            "--fps" => out.fps = Some(parse_fps(&take_value(&args, &mut i, "--fps")?)?),
            "--crf" => out.crf = Some(parse_number(&take_value(&args, &mut i, "--crf")?, "--crf")?),
            "--preset" => out.preset = Some(take_value(&args, &mut i, "--preset")?),
            "--threads" => {
                out.threads = Some(parse_number(
                    &take_value(&args, &mut i, "--threads")?,
                    "--threads",
                )?)
            }
            "--loglevel" => out.loglevel = Some(take_value(&args, &mut i, "--loglevel")?),
            "--delete-ts-after-remux" => out.delete_ts_after_remux = true,
            "--overwrite" => out.overwrite = true,
            "--delete-input-on-success" => out.delete_input_on_success = true,
            flag if flag.starts_with('-') => {
                return Err(UsageError(format!("unknown flag for tscompress: {}", flag)))
            }
            positional => out.inputs.push(PathBuf::from(positional)),
        }
        i += 1;
    }
    if out.inputs.is_empty() {
        return Err(UsageError("tscompress requires at least one file".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(line: &str) -> Result<Cli, UsageError> {
        parse(line.split_whitespace().map(str::to_string).collect())
    }

    #[test]
    fn test_parse_record_with_flags() {
        let cli = parse_line(
            "record alice --quality 720p --retry-delay 30 --no-remux --fail-fast --record-limit 2",
        )
        .unwrap();
        let Command::Record(args) = cli.command else {
            panic!("expected record");
        };
        assert_eq!(args.username, "alice");
        assert_eq!(args.quality.as_deref(), Some("720p"));
        assert_eq!(args.retry_delay, Some(30));
        assert_eq!(args.enable_remux, Some(false));
        assert_eq!(args.record_limit, Some(2));
        assert!(args.fail_fast);
        assert!(args.delete_ts_after_remux.is_none());
    }

    #[test]
    fn test_parse_record_requires_username() {
        assert!(parse_line("record --fail-fast").is_err());
        assert!(parse_line("record alice bob").is_err());
        assert!(parse_line("record alice --bogus").is_err());
    }

    #[test]
    fn test_global_flags_anywhere() {
        let cli = parse_line("record --json-logs alice --config /etc/tg.toml").unwrap();
        assert!(cli.global.json_logs);
        assert_eq!(cli.global.config, Some(PathBuf::from("/etc/tg.toml")));
        let Command::Record(args) = cli.command else {
            panic!("expected record");
        };
        assert_eq!(args.username, "alice");
    }

    #[test]
    fn test_bare_daemons_imply_run() {
        let cli = parse_line("poller").unwrap();
        assert!(matches!(cli.command, Command::Poller(PollerCmd::Run(_))));

        let cli = parse_line("encode-daemon --crf 28").unwrap();
        let Command::EncodeDaemon(EncodeDaemonCmd::Run(args)) = cli.command else {
            panic!("expected encode-daemon run");
        };
        assert_eq!(args.crf, Some(28));

        let cli = parse_line("poller stop --timeout 5 --force").unwrap();
        let Command::Poller(PollerCmd::Stop(args)) = cli.command else {
            panic!("expected poller stop");
        };
        assert_eq!(args.timeout_secs, 5);
        assert!(args.force);
    }

    #[test]
    fn test_parse_fps_values() {
        let cli = parse_line("encode-daemon run --fps 30000/1001").unwrap();
        let Command::EncodeDaemon(EncodeDaemonCmd::Run(args)) = cli.command else {
            panic!();
        };
        assert_eq!(args.fps, Some(Fps::Fixed("30000/1001".into())));

        assert!(parse_line("encode-daemon run --fps banana").is_err());
    }

    #[test]
    fn test_parse_stop_slot() {
        let cli = parse_line("stop 3 --force --timeout 20").unwrap();
        let Command::StopSlot(args) = cli.command else {
            panic!();
        };
        assert_eq!(args.slot, 3);
        assert!(args.force);
        assert_eq!(args.timeout_secs, 20);

        assert!(parse_line("stop").is_err());
        assert!(parse_line("stop three").is_err());
    }

    #[test]
    fn test_parse_users() {
        let cli = parse_line("users add alice bob").unwrap();
        let Command::Users(args) = cli.command else {
            panic!();
        };
        match args.action {
            UsersAction::Add(names) => assert_eq!(names, vec!["alice", "bob"]),
            other => panic!("expected add, got {:?}", other),
        }

        assert!(parse_line("users").is_err());
        assert!(parse_line("users add").is_err());
        assert!(parse_line("users list extra").is_err());
    }

    #[test]
    fn test_parse_encode_mode_and_help() {
        assert!(matches!(
            parse_line("encode-mode off").unwrap().command,
            Command::EncodeMode(EncodeModeCmd::Off)
        ));
        assert!(parse_line("encode-mode sideways").is_err());

        let cli = parse_line("help record").unwrap();
        assert!(matches!(cli.command, Command::Help(Some(ref t)) if t == "record"));
        assert!(help_text(Some("record")).contains("--fail-fast"));
        assert!(help_text(Some("nonsense")).contains("Unknown command"));
    }

    #[test]
    fn test_parse_tscompress() {
        let cli = parse_line("tscompress a.ts b.ts --crf 30 --overwrite").unwrap();
        let Command::TsCompress(args) = cli.command else {
            panic!();
        };
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.crf, Some(30));
        assert!(args.overwrite);
        assert!(!args.delete_ts_after_remux);

        assert!(parse_line("tscompress").is_err());
    }

    #[test]
    fn test_unknown_command() {
        let err = parse_line("frobnicate").unwrap_err();
        assert!(err.0.contains("unknown command"));
    }
}
