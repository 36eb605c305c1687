//! Locating the external engine binaries.
//!
//! [`EngineTools::discover`] resolves each engine once per service: an
//! explicit path from the config wins if it exists, otherwise `PATH` is
//! searched with [`which::which`]. An engine that is not found is not an
//! error here. The job that needs it fails with "engine not installed", and
//! every other conversion keeps working.

use crate::config::ConversionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Candidate names for the LibreOffice binary, in lookup order.
const SOFFICE_NAMES: &[&str] = &["soffice", "libreoffice"];
const FFMPEG_NAMES: &[&str] = &["ffmpeg"];

/// Availability information for an engine, returned by [`EngineTools::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// First line of the version output, if the binary answered.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// Resolved engine binaries.
#[derive(Debug, Clone)]
pub struct EngineTools {
    pub soffice: PathBuf,
    pub ffmpeg: PathBuf,
    soffice_found: bool,
    ffmpeg_found: bool,
}

impl EngineTools {
    pub fn discover(config: &ConversionConfig) -> Self {
        let (soffice, soffice_found) = resolve(config.soffice_path.as_deref(), SOFFICE_NAMES);
        let (ffmpeg, ffmpeg_found) = resolve(config.ffmpeg_path.as_deref(), FFMPEG_NAMES);
        debug!(soffice = %soffice.display(), soffice_found, ffmpeg = %ffmpeg.display(), ffmpeg_found, "Engines resolved");
        Self {
            soffice,
            ffmpeg,
            soffice_found,
            ffmpeg_found,
        }
    }

    /// Probe every engine and report what is usable.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        vec![
            info("soffice", &self.soffice, self.soffice_found, "--version"),
            info("ffmpeg", &self.ffmpeg, self.ffmpeg_found, "-version"),
        ]
    }
}

/// Explicit path if it exists, then each candidate on `PATH`, then the bare
/// first candidate name (so spawning fails later with a clear NotFound).
fn resolve(custom: Option<&Path>, names: &[&str]) -> (PathBuf, bool) {
    if let Some(p) = custom {
        if p.exists() {
            return (p.to_path_buf(), true);
        }
        debug!(path = %p.display(), "Configured engine path does not exist; searching PATH");
    }
    for name in names {
        if let Ok(found) = which::which(name) {
            return (found, true);
        }
    }
    (PathBuf::from(names[0]), false)
}

fn info(name: &str, path: &Path, found: bool, version_arg: &str) -> ToolInfo {
    if !found {
        return ToolInfo {
            name: name.to_string(),
            available: false,
            version: None,
            path: None,
        };
    }
    ToolInfo {
        name: name.to_string(),
        available: true,
        version: detect_version(path, version_arg),
        path: Some(path.to_path_buf()),
    }
}

/// Run `<tool> <version_arg>` and return the first non-empty line of stdout.
fn detect_version(path: &Path, version_arg: &str) -> Option<String> {
    let output = std::process::Command::new(path)
        .arg(version_arg)
        .stdin(std::process::Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|s| s.to_string())
}
