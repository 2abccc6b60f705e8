//! Configuration management.
//!
//! Values layer in a fixed precedence: CLI flag > environment variable >
//! config file > built-in default. The file and environment layers are
//! resolved here; CLI flags are applied by the dispatcher. The
//! `[encode_daemon]` section keeps `Option` fields because the daemon must
//! distinguish "operator set this" (beats the job snapshot) from "built-in
//! default" (the job snapshot wins).

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::{BaseDirs, ProjectDirs, UserDirs};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const GIB: u64 = 1024 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub record: RecordConfig,

    #[serde(default)]
    pub encode_daemon: EncodeDaemonConfig,

    #[serde(default)]
    pub poller: PollerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Encode queue base directory (jobs/, tmp/, inflight/ live below it)
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,

    /// Where detached recorder logs are appended
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Final resting place for recordings
    #[serde(default = "default_record_dir")]
    pub record_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent recordings across the whole host
    #[serde(default = "default_record_limit")]
    pub record_limit: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub disk_free_min_gb: Option<u64>,
    pub disk_free_min_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    #[serde(default = "default_quality")]
    pub quality: String,

    /// Seconds between capture retries while the stream is down
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Rolling window, in seconds, during which retries are attempted
    #[serde(default = "default_retry_window")]
    pub retry_window: u64,

    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    #[serde(default = "default_true")]
    pub enable_remux: bool,

    #[serde(default = "default_true")]
    pub delete_ts_after_remux: bool,

    #[serde(default)]
    pub delete_input_on_success: bool,
}

/// Encoder parameters as the operator configured them. `None` means the
/// operator said nothing and the job snapshot (then the built-in) applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodeDaemonConfig {
    pub preset: Option<String>,
    pub crf: Option<u32>,
    pub threads: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<Fps>,
    pub loglevel: Option<String>,
    pub audio_bitrate_kbps: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,

    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval")]
    pub interval: u64,

    #[serde(default = "default_quality")]
    pub quality: String,

    /// Command the poller launches per live user; resolved via PATH at
    /// spawn time so operators can upgrade the binary in place
    #[serde(default = "default_download_cmd")]
    pub download_cmd: String,

    /// Per-probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,

    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_record_limit() -> u32 {
    6
}

fn default_quality() -> String {
    "best".to_string()
}

fn default_retry_delay() -> u64 {
    60
}

fn default_retry_window() -> u64 {
    900
}

fn default_loglevel() -> String {
    "error".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

fn default_download_cmd() -> String {
    "twitchgrab record".to_string()
}

fn default_probe_timeout() -> u64 {
    15
}

fn default_probe_concurrency() -> usize {
    10
}

/// XDG state directory for queue, logs and daemon heartbeats.
pub fn state_dir() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", "twitchgrab") {
        return dirs
            .state_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dirs.data_local_dir().to_path_buf());
    }
    std::env::temp_dir().join("twitchgrab-state")
}

fn default_queue_dir() -> PathBuf {
    state_dir().join("encode-queue")
}

fn default_logs_dir() -> PathBuf {
    state_dir().join("logs")
}

fn default_record_dir() -> PathBuf {
    if let Some(dirs) = UserDirs::new() {
        if let Some(videos) = dirs.video_dir() {
            if videos.is_dir() {
                return videos.join("twitchgrab");
            }
        }
        return dirs.home_dir().join("Downloads").join("twitchgrab");
    }
    std::env::temp_dir().join("twitchgrab")
}

fn default_users_file() -> PathBuf {
    default_config_path()
        .parent()
        .map(|p| p.join("users.txt"))
        .unwrap_or_else(|| PathBuf::from("users.txt"))
}

/// Default config file path (`~/.config/twitchgrab/config.toml` on Linux).
pub fn default_config_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", "twitchgrab") {
        return dirs.config_dir().join("config.toml");
    }
    std::env::temp_dir().join("twitchgrab-config.toml")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            queue_dir: default_queue_dir(),
            logs_dir: default_logs_dir(),
            record_dir: default_record_dir(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            record_limit: default_record_limit(),
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            retry_delay: default_retry_delay(),
            retry_window: default_retry_window(),
            loglevel: default_loglevel(),
            enable_remux: true,
            delete_ts_after_remux: true,
            delete_input_on_success: false,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            users_file: default_users_file(),
            interval: default_poll_interval(),
            quality: default_quality(),
            download_cmd: default_download_cmd(),
            timeout: default_probe_timeout(),
            probe_concurrency: default_probe_concurrency(),
        }
    }
}

impl StorageConfig {
    /// Effective minimum free space in bytes; explicit bytes beat GiB.
    pub fn min_free_bytes(&self) -> u64 {
        self.disk_free_min_bytes
            .or_else(|| self.disk_free_min_gb.map(|gb| gb * GIB))
            .unwrap_or(10 * GIB)
    }
}

impl Config {
    /// Load from `path` (or the default location), then overlay the
    /// environment. A missing file yields built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read config file {:?}", config_path))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {:?}", config_path))?
        } else {
            Config::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Overlay uppercase environment variables onto the file layer.
    /// Unparseable values are ignored, keeping daemons startable.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_u64("RECORD_LIMIT") {
            self.limits.record_limit = v as u32;
        }
        if let Some(v) = env_str("QUEUE_DIR") {
            self.paths.queue_dir = PathBuf::from(v);
        }
        // Each variable lands in its own field; `min_free_bytes()` applies
        // the bytes-beat-GiB rule the same way it does for file values.
        if let Some(v) = env_u64("DISK_FREE_MIN_BYTES") {
            self.storage.disk_free_min_bytes = Some(v);
        }
        if let Some(v) = env_u64("DISK_FREE_MIN_GB") {
            self.storage.disk_free_min_gb = Some(v);
        }

        if let Some(v) = env_str("QUALITY") {
            self.record.quality = v;
        }
        if let Some(v) = env_u64("RETRY_DELAY") {
            self.record.retry_delay = v;
        }
        if let Some(v) = env_u64("RETRY_WINDOW") {
            self.record.retry_window = v;
        }
        if let Some(v) = env_str("LOGLEVEL") {
            self.record.loglevel = v;
        }
        if let Some(v) = env_bool("REMUX_ENABLED") {
            self.record.enable_remux = v;
        }
        if let Some(v) = env_bool("DELETE_TS_AFTER_REMUX") {
            self.record.delete_ts_after_remux = v;
        }
        if let Some(v) = env_bool("DELETE_INPUT_ON_SUCCESS") {
            self.record.delete_input_on_success = v;
        }

        if let Some(v) = env_str("ENCODER_PRESET") {
            self.encode_daemon.preset = Some(v);
        }
        if let Some(v) = env_u64("ENCODER_CRF") {
            self.encode_daemon.crf = Some(v as u32);
        }
        if let Some(v) = env_u64("ENCODER_THREADS") {
            self.encode_daemon.threads = Some(v as u32);
        }
        if let Some(v) = env_u64("ENCODER_HEIGHT") {
            self.encode_daemon.height = Some(v as u32);
        }
        if let Some(v) = env_str("ENCODER_FPS") {
            if let Ok(fps) = v.parse() {
                self.encode_daemon.fps = Some(fps);
            }
        }
        if let Some(v) = env_str("ENCODER_LOGLEVEL") {
            self.encode_daemon.loglevel = Some(v);
        }

        if let Some(v) = env_str("USERS_FILE") {
            self.poller.users_file = PathBuf::from(v);
        }
        if let Some(v) = env_u64("POLL_INTERVAL") {
            self.poller.interval = v;
        }
        if let Some(v) = env_str("DOWNLOAD_CMD") {
            self.poller.download_cmd = v;
        }
        if let Some(v) = env_u64("PROBE_TIMEOUT") {
            self.poller.timeout = v;
        }
        if let Some(v) = env_u64("PROBE_CONCURRENCY") {
            self.poller.probe_concurrency = v as usize;
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env_str(name).and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    let v = env_str(name)?;
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" | "t" => Some(true),
        "0" | "false" | "no" | "n" | "off" | "f" => Some(false),
        _ => None,
    }
}

/// Output frame-rate selection: preserve the source, or force a fixed rate
/// given as a number or an exact `num/den` fraction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Fps {
    #[default]
    Auto,
    Fixed(String),
}

impl Fps {
    /// Value for an ffmpeg `fps=` filter, or `None` to preserve the source.
    pub fn filter_value(&self) -> Option<&str> {
        match self {
            Fps::Auto => None,
            Fps::Fixed(v) => Some(v),
        }
    }
}

impl fmt::Display for Fps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fps::Auto => f.write_str("auto"),
            Fps::Fixed(v) => f.write_str(v),
        }
    }
}

impl std::str::FromStr for Fps {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.is_empty() || t.eq_ignore_ascii_case("auto") {
            return Ok(Fps::Auto);
        }
        let valid = match t.split_once('/') {
            Some((num, den)) => {
                num.parse::<u64>().is_ok() && den.parse::<u64>().map(|d| d > 0).unwrap_or(false)
            }
            None => t.parse::<f64>().map(|v| v > 0.0).unwrap_or(false),
        };
        if valid {
            Ok(Fps::Fixed(t.to_string()))
        } else {
            Err(format!("invalid fps value '{}'", s))
        }
    }
}

impl Serialize for Fps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Fps::Auto => serializer.serialize_str("auto"),
            Fps::Fixed(v) => {
                if let Ok(n) = v.parse::<u64>() {
                    serializer.serialize_u64(n)
                } else if let Ok(n) = v.parse::<f64>() {
                    serializer.serialize_f64(n)
                } else {
                    serializer.serialize_str(v)
                }
            }
        }
    }
}

impl<'de> Deserialize<'de> for Fps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FpsVisitor;

        impl Visitor<'_> for FpsVisitor {
            type Value = Fps;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"auto\", a number, or a \"num/den\" fraction")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Fps, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Fps, E> {
                if v == 0 {
                    return Err(E::custom("fps must be positive"));
                }
                Ok(Fps::Fixed(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Fps, E> {
                if v <= 0 {
                    return Err(E::custom("fps must be positive"));
                }
                Ok(Fps::Fixed(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Fps, E> {
                if v <= 0.0 {
                    return Err(E::custom("fps must be positive"));
                }
                Ok(Fps::Fixed(format!("{}", v)))
            }
        }

        deserializer.deserialize_any(FpsVisitor)
    }
}

/// A complete encode-parameter set, as snapshotted into job files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeParams {
    pub height: u32,
    pub fps: Fps,
    pub crf: u32,
    pub preset: String,
    pub threads: u32,
    pub loglevel: String,
    pub audio_bitrate_kbps: u32,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            height: 480,
            fps: Fps::Auto,
            crf: 26,
            preset: "medium".to_string(),
            threads: 1,
            loglevel: "error".to_string(),
            audio_bitrate_kbps: 128,
        }
    }
}

impl EncodeParams {
    /// Clamp values into ranges ffmpeg accepts. Returns true when anything
    /// had to change, so callers can log it.
    pub fn sanitize(&mut self) -> bool {
        let before = (self.crf, self.threads, self.height);
        self.crf = self.crf.min(51);
        self.threads = self.threads.clamp(1, 64);
        self.height = self.height.clamp(144, 4320);
        before != (self.crf, self.threads, self.height)
    }
}

impl EncodeDaemonConfig {
    /// Overlay operator-provided values onto `base` (usually a job's
    /// parameter snapshot). Fields the operator never set pass through.
    pub fn overlay(&self, base: &EncodeParams) -> EncodeParams {
        EncodeParams {
            height: self.height.unwrap_or(base.height),
            fps: self.fps.clone().unwrap_or_else(|| base.fps.clone()),
            crf: self.crf.unwrap_or(base.crf),
            preset: self.preset.clone().unwrap_or_else(|| base.preset.clone()),
            threads: self.threads.unwrap_or(base.threads),
            loglevel: self
                .loglevel
                .clone()
                .unwrap_or_else(|| base.loglevel.clone()),
            audio_bitrate_kbps: self.audio_bitrate_kbps.unwrap_or(base.audio_bitrate_kbps),
        }
    }

    /// Effective parameters with built-ins filling the gaps.
    pub fn params(&self) -> EncodeParams {
        self.overlay(&EncodeParams::default())
    }
}

/// Toggle only `record.enable_remux` inside the config TOML text,
/// preserving every other line and comment.
///
/// Handles an explicit `[record]` table, a one-line inline table
/// (`record = { ... }`), and the file having neither (a table is appended).
pub fn set_enable_remux_in_text(text: &str, desired: bool) -> (String, bool) {
    let value = if desired { "true" } else { "false" };
    let lines: Vec<&str> = text.lines().collect();

    // Explicit [record] table.
    if let Some(header) = lines.iter().position(|l| l.trim() == "[record]") {
        let table_end = lines[header + 1..]
            .iter()
            .position(|l| l.trim_start().starts_with('['))
            .map(|off| header + 1 + off)
            .unwrap_or(lines.len());

        for idx in header + 1..table_end {
            if let Some(rewritten) = rewrite_enable_remux_line(lines[idx], value) {
                let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
                out[idx] = rewritten;
                return (join_lines(out, text), true);
            }
        }
        // Key absent: insert right below the table header.
        let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        out.insert(header + 1, format!("enable_remux = {}", value));
        return (join_lines(out, text), true);
    }

    // One-line inline table: record = { ... }
    if let Some(idx) = lines.iter().position(|l| is_inline_record_table(l)) {
        let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        out[idx] = rewrite_inline_record_table(lines[idx], value);
        return (join_lines(out, text), true);
    }

    // Neither: append a fresh table.
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("\n[record]\nenable_remux = {}\n", value));
    (out, true)
}

fn rewrite_enable_remux_line(line: &str, value: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("enable_remux")?;
    let rest = rest.trim_start();
    let after_eq = rest.strip_prefix('=')?;
    let indent = &line[..line.len() - trimmed.len()];
    let comment = after_eq
        .find('#')
        .map(|i| format!(" {}", after_eq[i..].trim_end()))
        .unwrap_or_default();
    Some(format!("{}enable_remux = {}{}", indent, value, comment))
}

fn is_inline_record_table(line: &str) -> bool {
    let t = line.trim_start();
    let Some(rest) = t.strip_prefix("record") else {
        return false;
    };
    let rest = rest.trim_start();
    rest.strip_prefix('=')
        .map(|r| r.trim_start().starts_with('{'))
        .unwrap_or(false)
}

fn rewrite_inline_record_table(line: &str, value: &str) -> String {
    let open = line.find('{').expect("caller checked for inline table");
    let close = line.rfind('}').unwrap_or(line.len());
    let body = &line[open + 1..close];
    let suffix = &line[close..];

    let mut parts: Vec<String> = Vec::new();
    let mut replaced = false;
    for part in body.split(',') {
        if part.trim().starts_with("enable_remux") {
            parts.push(format!(" enable_remux = {}", value));
            replaced = true;
        } else if !part.trim().is_empty() {
            parts.push(format!(" {}", part.trim()));
        }
    }
    if !replaced {
        parts.insert(0, format!(" enable_remux = {}", value));
    }
    format!("{}{{{} }}{}", &line[..open], parts.join(","), suffix)
}

fn join_lines(lines: Vec<String>, original: &str) -> String {
    let mut out = lines.join("\n");
    if original.ends_with('\n') || original.is_empty() {
        out.push('\n');
    }
    out
}

/// Rewrite only `record.enable_remux` in the config file at `path`,
/// creating the file when absent.
pub fn set_enable_remux(path: &Path, desired: bool) -> Result<()> {
    let original = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("failed to read {:?}", path)),
    };
    let (updated, changed) = set_enable_remux_in_text(&original, desired);
    if changed {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        std::fs::write(path, updated).with_context(|| format!("failed to write {:?}", path))?;
    }
    Ok(())
}

/// Expand `~` in operator-supplied paths.
pub fn expand_user_path(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(base) = BaseDirs::new() {
            return base.home_dir().join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.limits.record_limit, 6);
        assert_eq!(cfg.record.quality, "best");
        assert_eq!(cfg.record.retry_delay, 60);
        assert_eq!(cfg.record.retry_window, 900);
        assert!(cfg.record.enable_remux);
        assert!(cfg.record.delete_ts_after_remux);
        assert!(!cfg.record.delete_input_on_success);
        assert_eq!(cfg.poller.interval, 300);
        assert_eq!(cfg.poller.probe_concurrency, 10);
        assert_eq!(cfg.storage.min_free_bytes(), 10 * GIB);
        assert!(cfg.encode_daemon.preset.is_none());
    }

    #[test]
    fn test_parse_partial_file() {
        let cfg: Config = toml::from_str(
            r#"
            [limits]
            record_limit = 2

            [record]
            quality = "720p"

            [encode_daemon]
            crf = 30
            fps = "30000/1001"

            [storage]
            disk_free_min_gb = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.limits.record_limit, 2);
        assert_eq!(cfg.record.quality, "720p");
        // Untouched keys fall back to defaults.
        assert_eq!(cfg.record.retry_delay, 60);
        assert_eq!(cfg.encode_daemon.crf, Some(30));
        assert_eq!(
            cfg.encode_daemon.fps,
            Some(Fps::Fixed("30000/1001".to_string()))
        );
        assert!(cfg.encode_daemon.preset.is_none());
        assert_eq!(cfg.storage.min_free_bytes(), 5 * GIB);
    }

    #[test]
    fn test_storage_bytes_beats_gb() {
        let storage = StorageConfig {
            disk_free_min_gb: Some(5),
            disk_free_min_bytes: Some(123),
        };
        assert_eq!(storage.min_free_bytes(), 123);
    }

    #[test]
    fn test_storage_env_overlay_keeps_bytes_precedence() {
        // Only this test touches these variables.
        std::env::set_var("DISK_FREE_MIN_GB", "5");

        // A GiB-only environment fills the GiB field...
        let mut cfg = Config::default();
        cfg.apply_env();
        assert_eq!(cfg.storage.min_free_bytes(), 5 * GIB);

        // ...but never displaces explicit bytes, from the file layer...
        let mut cfg: Config = toml::from_str(
            "[storage]\ndisk_free_min_bytes = 123\n",
        )
        .unwrap();
        cfg.apply_env();
        assert_eq!(cfg.storage.min_free_bytes(), 123);

        // ...or from the environment itself.
        std::env::set_var("DISK_FREE_MIN_BYTES", "456");
        let mut cfg = Config::default();
        cfg.apply_env();
        assert_eq!(cfg.storage.min_free_bytes(), 456);

        std::env::remove_var("DISK_FREE_MIN_GB");
        std::env::remove_var("DISK_FREE_MIN_BYTES");
    }

    #[test]
    fn test_fps_parsing() {
        assert_eq!("auto".parse::<Fps>().unwrap(), Fps::Auto);
        assert_eq!("".parse::<Fps>().unwrap(), Fps::Auto);
        assert_eq!("30".parse::<Fps>().unwrap(), Fps::Fixed("30".into()));
        assert_eq!(
            "30000/1001".parse::<Fps>().unwrap(),
            Fps::Fixed("30000/1001".into())
        );
        assert!("abc".parse::<Fps>().is_err());
        assert!("30/0".parse::<Fps>().is_err());
        assert_eq!(Fps::Auto.filter_value(), None);
        assert_eq!(Fps::Fixed("24".into()).filter_value(), Some("24"));
    }

    #[test]
    fn test_fps_serde_json_shapes() {
        // Numbers serialize as numbers, fractions as strings.
        assert_eq!(serde_json::to_string(&Fps::Auto).unwrap(), "\"auto\"");
        assert_eq!(
            serde_json::to_string(&Fps::Fixed("30".into())).unwrap(),
            "30"
        );
        assert_eq!(
            serde_json::to_string(&Fps::Fixed("30000/1001".into())).unwrap(),
            "\"30000/1001\""
        );
        let back: Fps = serde_json::from_str("24").unwrap();
        assert_eq!(back, Fps::Fixed("24".into()));
        let back: Fps = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(back, Fps::Auto);
    }

    #[test]
    fn test_encode_overlay_precedence() {
        let job_snapshot = EncodeParams {
            height: 720,
            crf: 20,
            ..EncodeParams::default()
        };
        let operator = EncodeDaemonConfig {
            crf: Some(28),
            ..EncodeDaemonConfig::default()
        };
        let effective = operator.overlay(&job_snapshot);
        // Operator value wins, job snapshot fills the rest.
        assert_eq!(effective.crf, 28);
        assert_eq!(effective.height, 720);
        assert_eq!(effective.preset, "medium");
    }

    #[test]
    fn test_sanitize_clamps() {
        let mut p = EncodeParams {
            crf: 99,
            threads: 0,
            height: 50,
            ..EncodeParams::default()
        };
        assert!(p.sanitize());
        assert_eq!(p.crf, 51);
        assert_eq!(p.threads, 1);
        assert_eq!(p.height, 144);
        assert!(!p.sanitize());
    }

    #[test]
    fn test_set_enable_remux_updates_existing_table() {
        let text = "# my config\n[record]\nquality = \"best\"\nenable_remux = true # keep\n\n[poller]\ninterval = 60\n";
        let (out, changed) = set_enable_remux_in_text(text, false);
        assert!(changed);
        assert!(out.contains("enable_remux = false # keep"));
        assert!(out.contains("# my config"));
        assert!(out.contains("interval = 60"));
        let parsed: Config = toml::from_str(&out).unwrap();
        assert!(!parsed.record.enable_remux);
    }

    #[test]
    fn test_set_enable_remux_inserts_into_table() {
        let text = "[record]\nquality = \"best\"\n";
        let (out, _) = set_enable_remux_in_text(text, false);
        let parsed: Config = toml::from_str(&out).unwrap();
        assert!(!parsed.record.enable_remux);
        assert_eq!(parsed.record.quality, "best");
    }

    #[test]
    fn test_set_enable_remux_inline_table() {
        let text = "record = { quality = \"best\", enable_remux = true }\n";
        let (out, _) = set_enable_remux_in_text(text, false);
        let parsed: Config = toml::from_str(&out).unwrap();
        assert!(!parsed.record.enable_remux);
        assert_eq!(parsed.record.quality, "best");

        let text = "record = { quality = \"best\" }\n";
        let (out, _) = set_enable_remux_in_text(text, true);
        let parsed: Config = toml::from_str(&out).unwrap();
        assert!(parsed.record.enable_remux);
    }

    #[test]
    fn test_set_enable_remux_appends_table() {
        let (out, _) = set_enable_remux_in_text("", true);
        let parsed: Config = toml::from_str(&out).unwrap();
        assert!(parsed.record.enable_remux);

        let text = "[poller]\ninterval = 10\n";
        let (out, _) = set_enable_remux_in_text(text, false);
        let parsed: Config = toml::from_str(&out).unwrap();
        assert!(!parsed.record.enable_remux);
        assert_eq!(parsed.poller.interval, 10);
    }
}
