//! Office documents through headless LibreOffice.
//!
//! ## Isolation
//!
//! LibreOffice keeps a user profile with a lock file. Two `soffice` processes
//! sharing a profile either block on each other or silently hand the job to
//! the first instance. Every run therefore gets its own profile directory
//! (`-env:UserInstallation`) and its own output directory, both inside the
//! job's scratch scope.
//!
//! `soffice` exits 0 for a surprising number of failures ("source file could
//! not be loaded"), so success is decided by the presence of a non-empty
//! output file, not by the exit code alone.

use crate::engine::command::ToolCommand;
use crate::engine::{ConvertedOutput, Converter, EngineContext};
use crate::error::{sanitize_diagnostic, ConvertError};
use crate::pipeline::registry::ConverterKind;
use crate::pipeline::scratch::ScratchHandle;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The LibreOffice converter.
#[derive(Debug, Clone)]
pub struct OfficeEngine {
    soffice: PathBuf,
}

impl OfficeEngine {
    pub fn new(soffice: impl Into<PathBuf>) -> Self {
        Self {
            soffice: soffice.into(),
        }
    }
}

/// Arguments for one headless conversion.
pub fn soffice_args(profile_dir: &Path, out_dir: &Path, input: &Path, target: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "--headless",
        "--invisible",
        "--norestore",
        "--nolockcheck",
        "--nodefault",
        "--nologo",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(format!("-env:UserInstallation={}", file_url(profile_dir)).into());
    args.push("--convert-to".into());
    args.push(target.into());
    args.push("--outdir".into());
    args.push(out_dir.into());
    args.push(input.into());
    args
}

/// `file://` URL for a local directory, with the few characters that break
/// LibreOffice's URL parsing percent-encoded.
fn file_url(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let mut url = String::from("file://");
    if !raw.starts_with('/') {
        url.push('/');
    }
    for c in raw.chars() {
        match c {
            '%' => url.push_str("%25"),
            ' ' => url.push_str("%20"),
            '#' => url.push_str("%23"),
            '?' => url.push_str("%3F"),
            _ => url.push(c),
        }
    }
    url
}

#[async_trait]
impl Converter for OfficeEngine {
    fn kind(&self) -> ConverterKind {
        ConverterKind::Office
    }

    fn name(&self) -> &str {
        "soffice"
    }

    async fn convert(&self, ctx: &EngineContext<'_>) -> Result<ConvertedOutput, ConvertError> {
        let profile = ctx.scope.acquire_dir("profile")?;
        let out_dir = ctx.scope.acquire_dir("out")?;
        let input = ctx.input.handle.path();

        let mut cmd = ToolCommand::new(&self.soffice);
        cmd.args(soffice_args(profile.path(), out_dir.path(), input, ctx.target))
            .env("HOME", profile.path())
            .current_dir(out_dir.path())
            .timeout(ctx.config.office_timeout());

        debug!(job_id = %ctx.job_id, target = ctx.target, "Invoking soffice");
        let run = cmd.execute(ctx.cancel).await;
        // The profile is only needed while soffice runs.
        ctx.scope.release(&profile);
        let output = run.map_err(|e| e.into_convert_error(ctx.scope.path(), ctx.config.max_diagnostic_bytes))?;

        match find_output(ctx, &out_dir, input).await? {
            Some(handle) => Ok(ConvertedOutput::File(handle)),
            None => {
                let said = format!("{} {}", output.stdout, output.stderr);
                let detail = if said.trim().is_empty() {
                    "produced no output".to_string()
                } else {
                    format!(
                        "produced no output: {}",
                        sanitize_diagnostic(&said, Some(ctx.scope.path()), ctx.config.max_diagnostic_bytes)
                    )
                };
                Err(ConvertError::EngineFailure {
                    engine: self.name().to_string(),
                    detail,
                })
            }
        }
    }
}

/// Register the produced file. LibreOffice names it `<input stem>.<target>`;
/// if that is missing, any other file it put in `out_dir` is taken.
async fn find_output(
    ctx: &EngineContext<'_>,
    out_dir: &ScratchHandle,
    input: &Path,
) -> Result<Option<ScratchHandle>, ConvertError> {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let expected = format!("{stem}.{}", ctx.target);

    let mut candidate = None;
    if non_empty(&out_dir.path().join(&expected)).await {
        candidate = Some(expected);
    } else {
        let mut entries = tokio::fs::read_dir(out_dir.path())
            .await
            .map_err(|e| ConvertError::Internal(format!("reading engine output dir: {e}")))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if non_empty(&entry.path()).await {
                candidate = Some(entry.file_name().to_string_lossy().to_string());
                break;
            }
        }
    }

    match candidate {
        Some(name) => Ok(Some(ctx.scope.acquire_in(out_dir, &name)?)),
        None => Ok(None),
    }
}

async fn non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_isolate_profile_and_output() {
        let args = soffice_args(
            Path::new("/tmp/fileconv-x/profile"),
            Path::new("/tmp/fileconv-x/out"),
            Path::new("/tmp/fileconv-x/abc.docx"),
            "pdf",
        );
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args[0], "--headless");
        assert!(args.contains(&"-env:UserInstallation=file:///tmp/fileconv-x/profile".to_string()));
        let i = args.iter().position(|a| a == "--convert-to").unwrap();
        assert_eq!(args[i + 1], "pdf");
        let o = args.iter().position(|a| a == "--outdir").unwrap();
        assert_eq!(args[o + 1], "/tmp/fileconv-x/out");
        assert_eq!(args.last().unwrap(), "/tmp/fileconv-x/abc.docx");
    }

    #[test]
    fn file_url_escapes() {
        assert_eq!(file_url(Path::new("/a b/c#d")), "file:///a%20b/c%23d");
        assert_eq!(file_url(Path::new("/tmp/x")), "file:///tmp/x");
    }
}
