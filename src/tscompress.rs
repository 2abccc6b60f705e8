//! Serial batch remux + compress for `.ts` files already on disk,
//! sharing the recorder's remux step and the daemon's encode step but
//! driven directly by the operator.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::EncodeParams;
use crate::error::AppError;
use crate::fsutil;
use crate::procutil;
use crate::tools;

/// Ceiling per ffmpeg run; mirrors the encode daemon's bound.
const ENCODE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const REMUX_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone)]
pub struct TsCompressOptions {
    pub inputs: Vec<PathBuf>,
    pub params: EncodeParams,
    pub delete_ts_after_remux: bool,
    pub delete_input_on_success: bool,
    pub overwrite: bool,
}

/// Process every input serially. Returns Ok only when all inputs
/// succeeded; the first failure kind is surfaced after the batch runs to
/// completion.
pub async fn run(opts: TsCompressOptions) -> Result<(), AppError> {
    if tools::which(tools::FFMPEG_TOOL).is_none() {
        return Err(AppError::External(format!(
            "{} not found in PATH",
            tools::FFMPEG_TOOL
        )));
    }

    let inputs = dedupe_existing(&opts.inputs);
    if inputs.is_empty() {
        return Err(AppError::Config("no usable input files".into()));
    }

    let mut first_error: Option<AppError> = None;
    for input in inputs {
        if input
            .extension()
            .map(|e| !e.eq_ignore_ascii_case("ts"))
            .unwrap_or(true)
        {
            warn!(input = %input.display(), "skipping non-TS input");
            first_error.get_or_insert(AppError::Config(format!(
                "not a .ts file: {}",
                input.display()
            )));
            continue;
        }
        if let Err(e) = compress_one(&input, &opts).await {
            warn!(input = %input.display(), error = %e, "compression failed");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Existing inputs, de-duplicated by canonical path, input order kept.
fn dedupe_existing(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut out = Vec::new();
    for input in inputs {
        if !input.exists() {
            warn!(input = %input.display(), "input does not exist");
            continue;
        }
        let key = input.canonicalize().unwrap_or_else(|_| input.clone());
        if seen.insert(key) {
            out.push(input.clone());
        }
    }
    out
}

async fn compress_one(input: &Path, opts: &TsCompressOptions) -> Result<(), AppError> {
    let input = input
        .canonicalize()
        .map_err(|e| AppError::Io(input.to_path_buf(), e))?;
    let base = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = input.parent().map(Path::to_path_buf).unwrap_or_default();
    let remux_mp4 = dir.join(format!("{}.mp4", base));
    let final_mp4 = dir.join(format!("{}_compressed.mp4", base));

    info!(input = %input.display(), "processing");

    // Remux first (skipped when an MP4 already exists, unless asked to
    // overwrite); the encode then reads the MP4, or the TS as fallback.
    let mut encode_input = input.clone();
    if opts.overwrite || !fsutil::non_empty(&remux_mp4) {
        let cmd = tools::remux_cmd(&input, &remux_mp4, &opts.params.loglevel);
        info!(cmd = %cmd.display(), "remux start");
        match procutil::run_tool(&cmd.program, &cmd.args, Some(REMUX_TIMEOUT)).await {
            Ok(Some(status)) if status.success() && fsutil::non_empty(&remux_mp4) => {
                info!(output = %remux_mp4.display(), "remux ok");
                encode_input = remux_mp4.clone();
                if opts.delete_ts_after_remux {
                    let _ = fsutil::remove_if_exists(&input);
                    info!(path = %input.display(), "deleted TS after remux");
                }
            }
            Ok(Some(status)) => {
                warn!(rc = ?status.code(), "remux failed, encoding the TS directly");
            }
            Ok(None) => warn!("remux timed out, encoding the TS directly"),
            Err(e) => {
                return Err(AppError::RemuxFailed(format!("failed to spawn ffmpeg: {}", e)))
            }
        }
    } else {
        info!(output = %remux_mp4.display(), "remux skipped, output exists");
        encode_input = remux_mp4.clone();
    }

    if fsutil::non_empty(&final_mp4) && !opts.overwrite {
        info!(output = %final_mp4.display(), "encode skipped, output exists");
        return Ok(());
    }

    let cmd = tools::encode_cmd(&encode_input, &final_mp4, &opts.params);
    info!(cmd = %cmd.display(), "encode start");
    match procutil::run_tool(&cmd.program, &cmd.args, Some(ENCODE_TIMEOUT)).await {
        Ok(Some(status)) if status.success() && fsutil::non_empty(&final_mp4) => {
            info!(output = %final_mp4.display(), "encode ok");
            if opts.delete_input_on_success {
                let _ = fsutil::remove_if_exists(&encode_input);
                info!(path = %encode_input.display(), "deleted encode input");
            }
            Ok(())
        }
        Ok(Some(status)) => {
            let _ = fsutil::remove_if_exists(&final_mp4);
            Err(AppError::TranscodeFailed(format!(
                "ffmpeg exited with {:?}",
                status.code()
            )))
        }
        Ok(None) => {
            let _ = fsutil::remove_if_exists(&final_mp4);
            Err(AppError::TranscodeFailed("ffmpeg timed out".into()))
        }
        Err(e) => Err(AppError::TranscodeFailed(format!(
            "failed to spawn ffmpeg: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dedupe_existing_keeps_order_and_drops_missing() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.ts");
        let b = dir.path().join("b.ts");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();

        let inputs = vec![
            b.clone(),
            a.clone(),
            b.clone(),
            dir.path().join("missing.ts"),
        ];
        let deduped = dedupe_existing(&inputs);
        assert_eq!(deduped, vec![b, a]);
    }

    #[tokio::test]
    async fn test_run_rejects_empty_and_non_ts() {
        let err = run(TsCompressOptions {
            inputs: vec![],
            params: EncodeParams::default(),
            delete_ts_after_remux: false,
            delete_input_on_success: false,
            overwrite: false,
        })
        .await
        .unwrap_err();
        // Either ffmpeg is missing (External) or nothing to do (Config).
        assert!(matches!(err, AppError::Config(_) | AppError::External(_)));

        let dir = TempDir::new().unwrap();
        let mkv = dir.path().join("video.mkv");
        std::fs::write(&mkv, b"x").unwrap();
        let err = run(TsCompressOptions {
            inputs: vec![mkv],
            params: EncodeParams::default(),
            delete_ts_after_remux: false,
            delete_input_on_success: false,
            overwrite: false,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_) | AppError::External(_)));
    }
}
