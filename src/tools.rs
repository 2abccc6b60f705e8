//! Command lines for the external tools: streamlink for capture/probing,
//! ffmpeg for concat, remux and transcode. Builders only; execution lives
//! in `procutil` so every call site gets the same timeout/kill handling.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::config::EncodeParams;

pub const CAPTURE_TOOL: &str = "streamlink";
pub const FFMPEG_TOOL: &str = "ffmpeg";

/// One external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCmd {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    /// Shell-ish rendering for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Resolve a bare command name against PATH.
pub fn which(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub fn stream_url(username: &str) -> String {
    format!("https://twitch.tv/{}", username)
}

/// Capture one segment to `outfile`; exits 0 on a clean end of stream.
pub fn capture_cmd(username: &str, quality: &str, outfile: &Path, loglevel: &str) -> ToolCmd {
    ToolCmd::new(CAPTURE_TOOL)
        .arg(stream_url(username))
        .arg(quality)
        .arg("-o")
        .arg(outfile.to_string_lossy())
        .arg("--loglevel")
        .arg(loglevel)
}

/// Liveness probe: exits 0 and prints a stream URL when the user is live.
pub fn probe_cmd(username: &str, quality: &str) -> ToolCmd {
    ToolCmd::new(CAPTURE_TOOL)
        .arg("--stream-url")
        .arg(stream_url(username))
        .arg(quality)
}

/// Write an ffmpeg concat-demuxer list for `parts`, in `dir` so the list
/// lives on the same filesystem as the segments. The file is removed when
/// the returned handle drops.
pub fn write_concat_list(parts: &[PathBuf], dir: &Path) -> std::io::Result<NamedTempFile> {
    let mut list = NamedTempFile::new_in(dir)?;
    for part in parts {
        // Single quotes are escaped per the concat demuxer's quoting rules.
        let escaped = part.to_string_lossy().replace('\'', "'\\''");
        writeln!(list, "file '{}'", escaped)?;
    }
    list.flush()?;
    Ok(list)
}

/// Stream-copy concatenation of TS segments into one file.
pub fn concat_cmd(list_file: &Path, out_ts: &Path, loglevel: &str) -> ToolCmd {
    ToolCmd::new(FFMPEG_TOOL)
        .arg("-hide_banner")
        .arg("-nostdin")
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(list_file.to_string_lossy())
        .arg("-c")
        .arg("copy")
        .arg("-loglevel")
        .arg(loglevel)
        .arg("-y")
        .arg(out_ts.to_string_lossy())
}

/// Stream-copy remux of a TS into a faststart MP4.
pub fn remux_cmd(in_ts: &Path, out_mp4: &Path, loglevel: &str) -> ToolCmd {
    ToolCmd::new(FFMPEG_TOOL)
        .arg("-hide_banner")
        .arg("-nostdin")
        .arg("-i")
        .arg(in_ts.to_string_lossy())
        .arg("-c")
        .arg("copy")
        .arg("-bsf:a")
        .arg("aac_adtstoasc")
        .arg("-movflags")
        .arg("+faststart")
        .arg("-loglevel")
        .arg(loglevel)
        .arg("-y")
        .arg(out_mp4.to_string_lossy())
}

/// Full transcode to x265 at the given parameters, with `nice`/`ionice`
/// prefixes when available so encodes yield to interactive work.
pub fn encode_cmd(input: &Path, output: &Path, params: &EncodeParams) -> ToolCmd {
    let mut vf = vec![format!("scale=-2:{}", params.height)];
    let mut vsync: Vec<String> = Vec::new();
    if let Some(fps) = params.fps.filter_value() {
        vf.push(format!("fps={}", fps));
        vsync = vec!["-vsync".into(), "cfr".into()];
    }

    // TS inputs get regenerated timestamps to stabilize A/V sync.
    let is_ts = input
        .extension()
        .map(|e| e.eq_ignore_ascii_case("ts"))
        .unwrap_or(false);

    let mut cmd = nice_prefixed(FFMPEG_TOOL);
    cmd = cmd
        .arg("-hide_banner")
        .arg("-nostdin")
        .arg("-loglevel")
        .arg(&params.loglevel)
        .arg("-y");
    if is_ts {
        cmd = cmd.arg("-fflags").arg("+genpts");
    }
    cmd = cmd
        .arg("-i")
        .arg(input.to_string_lossy())
        .arg("-vf")
        .arg(vf.join(","))
        .arg("-c:v")
        .arg("libx265")
        .arg("-crf")
        .arg(params.crf.to_string())
        .arg("-preset")
        .arg(&params.preset)
        .arg("-threads")
        .arg(params.threads.to_string());
    for flag in vsync {
        cmd = cmd.arg(flag);
    }
    cmd.arg("-c:a")
        .arg("aac")
        .arg("-b:a")
        .arg(format!("{}k", params.audio_bitrate_kbps))
        .arg("-ar")
        .arg("48000")
        .arg("-af")
        .arg("aresample=async=1:first_pts=0")
        .arg("-movflags")
        .arg("+faststart")
        .arg(output.to_string_lossy())
}

/// Wrap `program` in nice/ionice when those helpers exist on the host.
fn nice_prefixed(program: &str) -> ToolCmd {
    let mut prefix: Vec<String> = Vec::new();
    if which("nice").is_some() {
        prefix.extend(["nice".into(), "-n".into(), "10".into()]);
    }
    if which("ionice").is_some() {
        prefix.extend(["ionice".into(), "-c".into(), "2".into(), "-n".into(), "7".into()]);
    }
    match prefix.split_first() {
        Some((head, tail)) => {
            let mut cmd = ToolCmd::new(head.clone());
            cmd.args.extend(tail.iter().cloned());
            cmd.args.push(program.to_string());
            cmd
        }
        None => ToolCmd::new(program),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Fps;

    #[test]
    fn test_which_finds_sh() {
        assert!(which("sh").is_some());
        assert!(which("definitely-not-a-real-binary-42").is_none());
    }

    #[test]
    fn test_capture_cmd_shape() {
        let cmd = capture_cmd("alice", "best", Path::new("/t/a.part001"), "error");
        assert_eq!(cmd.program, "streamlink");
        assert_eq!(cmd.args[0], "https://twitch.tv/alice");
        assert_eq!(cmd.args[1], "best");
        assert!(cmd.args.contains(&"-o".to_string()));
        assert!(cmd.args.contains(&"/t/a.part001".to_string()));
    }

    #[test]
    fn test_probe_cmd_shape() {
        let cmd = probe_cmd("bob", "best");
        assert_eq!(cmd.args[0], "--stream-url");
        assert!(cmd.args[1].ends_with("/bob"));
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let dir = tempfile::TempDir::new().unwrap();
        let parts = vec![dir.path().join("it's.ts")];
        let list = write_concat_list(&parts, dir.path()).unwrap();
        let contents = std::fs::read_to_string(list.path()).unwrap();
        assert!(contents.contains("it'\\''s.ts"));
        assert!(contents.starts_with("file '"));
    }

    #[test]
    fn test_encode_cmd_auto_fps_omits_filter() {
        let params = EncodeParams::default();
        let cmd = encode_cmd(Path::new("/v/in.mp4"), Path::new("/v/out.mp4"), &params);
        let joined = cmd.display();
        assert!(joined.contains("scale=-2:480"));
        assert!(!joined.contains("fps="));
        assert!(!joined.contains("-vsync"));
        assert!(!joined.contains("+genpts"));
        assert!(joined.contains("-crf 26"));
        assert!(joined.contains("-b:a 128k"));
    }

    #[test]
    fn test_encode_cmd_fixed_fps_and_ts_input() {
        let params = EncodeParams {
            fps: Fps::Fixed("30000/1001".into()),
            ..EncodeParams::default()
        };
        let cmd = encode_cmd(Path::new("/v/in.ts"), Path::new("/v/out.mp4"), &params);
        let joined = cmd.display();
        assert!(joined.contains("fps=30000/1001"));
        assert!(joined.contains("-vsync cfr"));
        assert!(joined.contains("-fflags +genpts"));
    }

    #[test]
    fn test_remux_cmd_shape() {
        let cmd = remux_cmd(Path::new("/v/x.ts"), Path::new("/v/x.mp4"), "warning");
        let joined = cmd.display();
        assert!(joined.contains("-bsf:a aac_adtstoasc"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.contains("-loglevel warning"));
    }
}
