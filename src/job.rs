//! Request and job types.
//!
//! A request starts life as a [`ConversionForm`]: raw, untrusted fields as a
//! transport received them. The pipeline turns it into an [`UploadedFile`]
//! plus a validated [`ConversionRequest`], and each admitted request becomes
//! one [`ConversionJob`] that walks the state machine
//!
//! ```text
//! Admitted ──▶ Running ──▶ Succeeded
//!                     ├──▶ Failed(kind)
//!                     └──▶ Cancelled
//! ```

use crate::error::{ConvertError, ErrorKind, WHITESPACE};
use crate::pipeline::classify::Classification;
use crate::pipeline::registry::Capability;
use crate::pipeline::scratch::ScratchHandle;
use crate::progress::JobEvent;
use bytes::Bytes;
use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Largest accepted resize bound, per side.
pub const MAX_DIMENSION: u32 = 16_384;

// ── Inbound form ─────────────────────────────────────────────────────────

/// A conversion request exactly as a transport received it.
///
/// Every field except `bytes` is untrusted text; nothing here has been
/// validated yet.
#[derive(Debug, Clone, Default)]
pub struct ConversionForm {
    pub bytes: Bytes,
    pub filename: Option<String>,
    pub declared_mime: Option<String>,
    pub target: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub upscale: bool,
}

impl ConversionForm {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            ..Default::default()
        }
    }

    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    pub fn declared_mime(mut self, mime: impl Into<String>) -> Self {
        self.declared_mime = Some(mime.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn width(mut self, w: impl Into<String>) -> Self {
        self.width = Some(w.into());
        self
    }

    pub fn height(mut self, h: impl Into<String>) -> Self {
        self.height = Some(h.into());
        self
    }

    pub fn upscale(mut self, v: bool) -> Self {
        self.upscale = v;
        self
    }
}

// ── Validated request ────────────────────────────────────────────────────

/// The upload after it has been written to scratch storage.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub len: u64,
    /// Untrusted; used only to build the output filename.
    pub original_name: Option<String>,
    /// Untrusted; lowest-priority classification hint.
    pub declared_mime: Option<String>,
    pub handle: ScratchHandle,
}

/// Optional resize bounds for image conversions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Allow the output to be larger than the source.
    pub allow_upscale: bool,
}

impl TransformParams {
    /// Parse raw form values. Empty or missing means "no bound"; anything
    /// that is not a positive integer up to [`MAX_DIMENSION`] is rejected.
    pub fn parse(
        width: Option<&str>,
        height: Option<&str>,
        allow_upscale: bool,
    ) -> Result<Self, ConvertError> {
        Ok(Self {
            width: parse_dimension("width", width)?,
            height: parse_dimension("height", height)?,
            allow_upscale,
        })
    }

    pub fn is_resize(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }
}

fn parse_dimension(field: &str, raw: Option<&str>) -> Result<Option<u32>, ConvertError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    match raw.parse::<u32>() {
        Ok(0) => Err(ConvertError::InvalidRequest(format!("{field} must be positive"))),
        Ok(n) if n > MAX_DIMENSION => Err(ConvertError::InvalidRequest(format!(
            "{field} must be at most {MAX_DIMENSION}"
        ))),
        Ok(n) => Ok(Some(n)),
        Err(_) => Err(ConvertError::InvalidRequest(format!(
            "{field} must be a positive integer, got {raw:?}"
        ))),
    }
}

/// A request that passed validation and classification.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub upload: UploadedFile,
    pub classification: Classification,
    /// Normalized: non-empty, lower-case, no leading dot.
    pub target: String,
    pub transform: TransformParams,
}

// ── Job state machine ────────────────────────────────────────────────────

/// Where a job is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Admitted,
    Running,
    Succeeded,
    Failed(ErrorKind),
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed(_) | JobStatus::Cancelled
        )
    }
}

/// One conversion attempt.
#[derive(Debug)]
pub struct ConversionJob {
    pub id: Uuid,
    pub request: ConversionRequest,
    pub capability: Capability,
    status: JobStatus,
    admitted_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl ConversionJob {
    pub fn new(request: ConversionRequest, capability: Capability) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            capability,
            status: JobStatus::Admitted,
            admitted_at: Instant::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// `Admitted → Running`. Returns false if the job was not admitted.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Admitted {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Instant::now());
        true
    }

    pub fn succeed(&mut self) -> bool {
        self.finish(JobStatus::Succeeded)
    }

    /// Record a failure. [`ConvertError::Cancelled`] lands in `Cancelled`.
    pub fn fail(&mut self, err: &ConvertError) -> bool {
        let next = match err {
            ConvertError::Cancelled => JobStatus::Cancelled,
            other => JobStatus::Failed(other.kind()),
        };
        self.finish(next)
    }

    fn finish(&mut self, next: JobStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = next;
        self.finished_at = Some(Instant::now());
        true
    }

    /// Time spent in the engine, once the job has finished.
    pub fn engine_time(&self) -> Option<Duration> {
        Some(self.finished_at?.duration_since(self.started_at?))
    }

    /// Time since admission, or admission to finish for finished jobs.
    pub fn elapsed(&self) -> Duration {
        match self.finished_at {
            Some(end) => end.duration_since(self.admitted_at),
            None => self.admitted_at.elapsed(),
        }
    }

    pub fn event(&self) -> JobEvent {
        JobEvent {
            job_id: self.id,
            filename: self
                .request
                .upload
                .original_name
                .clone()
                .unwrap_or_else(|| "upload".to_string()),
            source: self.request.classification.class,
            target: self.request.target.clone(),
            engine: self.capability.kind,
        }
    }
}

// ── Output naming ────────────────────────────────────────────────────────

/// `<original basename without extension>.<target>`.
///
/// The original name is untrusted: directories are stripped, whitespace runs
/// become `_`, quotes and control characters are replaced. An empty result
/// falls back to `converted`.
pub fn output_filename(original: Option<&str>, target: &str) -> String {
    let base = original
        .map(|n| n.rsplit(['/', '\\']).next().unwrap_or(n))
        .unwrap_or("");
    let stem = match base.rfind('.') {
        Some(i) if i > 0 => &base[..i],
        _ => base,
    };
    let stem = WHITESPACE.replace_all(stem.trim(), "_");
    let stem: String = stem
        .chars()
        .map(|c| if c == '"' || c.is_control() { '_' } else { c })
        .collect();
    let stem = if stem.is_empty() || stem == "." || stem == ".." {
        "converted"
    } else {
        stem.as_str()
    };
    format!("{stem}.{target}")
}
