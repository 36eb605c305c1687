//! Audio and video through FFmpeg.
//!
//! FFmpeg writes to a fresh scratch path named `<uuid>.<target>`; the output
//! container is picked from that extension. The result is handed back as a
//! scratch file and streamed to the caller, so a large transcode is never
//! held in memory.

use crate::engine::command::ToolCommand;
use crate::engine::{ConvertedOutput, Converter, EngineContext};
use crate::error::ConvertError;
use crate::pipeline::registry::ConverterKind;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Targets that carry no video stream.
const AUDIO_ONLY: &[&str] = &["mp3", "wav", "ogg", "opus", "flac", "aac", "m4a"];

pub fn is_audio_only(target: &str) -> bool {
    AUDIO_ONLY.contains(&target)
}

/// The FFmpeg converter.
#[derive(Debug, Clone)]
pub struct MediaEngine {
    ffmpeg: PathBuf,
}

impl MediaEngine {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

pub fn ffmpeg_args(input: &Path, output: &Path, target: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(input.into());
    if is_audio_only(target) {
        args.push("-vn".into());
    }
    args.push(output.into());
    args
}

#[async_trait]
impl Converter for MediaEngine {
    fn kind(&self) -> ConverterKind {
        ConverterKind::Media
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn convert(&self, ctx: &EngineContext<'_>) -> Result<ConvertedOutput, ConvertError> {
        let output = ctx.scope.acquire(ctx.target)?;
        let timeout = ctx.config.media_timeout_for(ctx.input.len);

        let mut cmd = ToolCommand::new(&self.ffmpeg);
        cmd.args(ffmpeg_args(ctx.input.handle.path(), output.path(), ctx.target))
            .timeout(timeout);

        debug!(job_id = %ctx.job_id, target = ctx.target, ?timeout, "Invoking ffmpeg");
        cmd.execute(ctx.cancel)
            .await
            .map_err(|e| e.into_convert_error(ctx.scope.path(), ctx.config.max_diagnostic_bytes))?;

        let produced = tokio::fs::metadata(output.path())
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if produced == 0 {
            return Err(ConvertError::EngineFailure {
                engine: self.name().to_string(),
                detail: "produced no output".into(),
            });
        }
        Ok(ConvertedOutput::File(output))
    }
}
