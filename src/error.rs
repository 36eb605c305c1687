//! Error types for the edgequake-fileconv library.
//!
//! Every failure a conversion request can hit is a variant of
//! [`ConvertError`]. Variants are grouped by the stage that raises them, and
//! each one maps onto a coarse [`ErrorKind`] that transports translate into a
//! status code and a structured `{error, message}` body:
//!
//! | Kind | Status | Raised by |
//! |------|--------|-----------|
//! | `InvalidRequest` | 400 | request validation, corrupt input |
//! | `UnsupportedConversion` | 415 | classifier / registry |
//! | `QueueSaturated` | 503 | job queue admission |
//! | `EngineTimeout` | 500 | runner |
//! | `EngineFailure` | 500 | runner |
//! | `InternalFault` | 500 | anything unexpected |
//! | `Cancelled` | 499 | caller went away mid-job |
//!
//! Engine diagnostics are never passed through raw: see [`sanitize_diagnostic`].

use crate::pipeline::classify::FileClass;
use crate::pipeline::queue::ResourceClass;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// All errors returned by the conversion pipeline.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Request errors ────────────────────────────────────────────────────
    /// The request itself is malformed (empty upload, bad target, bad resize value).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upload exceeds the configured size bound.
    #[error("Upload of {size} bytes exceeds the {max} byte limit")]
    UploadTooLarge { size: u64, max: u64 },

    /// The engine could not read the source (corrupt or truncated file).
    #[error("Input could not be decoded: {detail}")]
    InvalidInput { detail: String },

    // ── Dispatch errors ───────────────────────────────────────────────────
    /// No converter serves this (class, target) pair.
    #[error("Cannot convert {class} to '{target}'")]
    UnsupportedConversion { class: FileClass, target: String },

    /// All permits for this resource class are taken.
    #[error("Server busy: {in_flight}/{limit} {class} conversions already running")]
    QueueSaturated {
        class: ResourceClass,
        in_flight: usize,
        limit: usize,
    },

    // ── Engine errors ─────────────────────────────────────────────────────
    /// The external engine exceeded its wall-clock budget and was killed.
    #[error("{engine} timed out after {secs}s")]
    EngineTimeout { engine: String, secs: u64 },

    /// The engine exited non-zero, produced nothing, or is not installed.
    /// `detail` is already sanitized and bounded.
    #[error("{engine} failed: {detail}")]
    EngineFailure { engine: String, detail: String },

    /// The caller cancelled the request while the engine was running.
    #[error("Conversion cancelled by caller")]
    Cancelled,

    // ── Output errors ─────────────────────────────────────────────────────
    /// Writing the converted file to its destination failed.
    #[error("Failed to write output to {path}: {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (scratch I/O, task panic, …).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error category exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    UnsupportedConversion,
    QueueSaturated,
    EngineTimeout,
    EngineFailure,
    InternalFault,
    Cancelled,
}

impl ErrorKind {
    /// HTTP-style status code for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::UnsupportedConversion => 415,
            ErrorKind::QueueSaturated => 503,
            ErrorKind::Cancelled => 499,
            ErrorKind::EngineTimeout | ErrorKind::EngineFailure | ErrorKind::InternalFault => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::UnsupportedConversion => "UnsupportedConversion",
            ErrorKind::QueueSaturated => "QueueSaturated",
            ErrorKind::EngineTimeout => "EngineTimeout",
            ErrorKind::EngineFailure => "EngineFailure",
            ErrorKind::InternalFault => "InternalFault",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Structured error body returned to callers: `{"error": kind, "message": text}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
}

impl ConvertError {
    /// The caller-facing category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::InvalidRequest(_)
            | ConvertError::UploadTooLarge { .. }
            | ConvertError::InvalidInput { .. } => ErrorKind::InvalidRequest,
            ConvertError::UnsupportedConversion { .. } => ErrorKind::UnsupportedConversion,
            ConvertError::QueueSaturated { .. } => ErrorKind::QueueSaturated,
            ConvertError::EngineTimeout { .. } => ErrorKind::EngineTimeout,
            ConvertError::EngineFailure { .. } => ErrorKind::EngineFailure,
            ConvertError::Cancelled => ErrorKind::Cancelled,
            ConvertError::OutputWriteFailed { .. }
            | ConvertError::InvalidConfig(_)
            | ConvertError::Internal(_) => ErrorKind::InternalFault,
        }
    }

    /// Shorthand for `self.kind().status_code()`.
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// Build the structured body sent back to the caller.
    ///
    /// Internal faults get a generic message; their detail stays in the logs.
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            ConvertError::Internal(_) | ConvertError::InvalidConfig(_) => {
                "internal error while converting the file".to_string()
            }
            other => other.to_string(),
        };
        ErrorBody {
            error: self.kind(),
            message,
        }
    }
}

/// Runs of whitespace, collapsed in diagnostics and output filenames.
pub(crate) static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Reduce raw engine output (stderr, decoder error) to something safe to show
/// a caller: scratch paths replaced with `<scratch>`, whitespace collapsed,
/// at most `max_bytes` bytes (cut on a char boundary, `…` appended).
///
/// The tail of the text is kept because engines print the actual failure last.
pub fn sanitize_diagnostic(raw: &str, scratch_root: Option<&Path>, max_bytes: usize) -> String {
    let mut text = raw.to_string();
    if let Some(root) = scratch_root {
        let root = root.to_string_lossy();
        if !root.is_empty() {
            text = text.replace(root.as_ref(), "<scratch>");
        }
    }
    let text = WHITESPACE.replace_all(text.trim(), " ").into_owned();

    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("\u{2026}{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn status_mapping() {
        assert_eq!(ConvertError::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(
            ConvertError::UnsupportedConversion {
                class: FileClass::Image,
                target: "bmp".into()
            }
            .status_code(),
            415
        );
        assert_eq!(
            ConvertError::QueueSaturated {
                class: ResourceClass::Heavy,
                in_flight: 2,
                limit: 2
            }
            .status_code(),
            503
        );
        assert_eq!(
            ConvertError::EngineTimeout {
                engine: "soffice".into(),
                secs: 60
            }
            .status_code(),
            500
        );
        assert_eq!(ConvertError::Internal("boom".into()).status_code(), 500);
        assert_eq!(ConvertError::Cancelled.status_code(), 499);
    }

    #[test]
    fn invalid_input_is_a_client_error() {
        let e = ConvertError::InvalidInput {
            detail: "truncated PNG".into(),
        };
        assert_eq!(e.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn internal_body_hides_detail() {
        let e = ConvertError::Internal("/tmp/fileconv-abc/secret: permission denied".into());
        let body = e.to_body();
        assert_eq!(body.error, ErrorKind::InternalFault);
        assert!(!body.message.contains("secret"), "got: {}", body.message);
    }

    #[test]
    fn body_serialises_as_error_and_message() {
        let e = ConvertError::UnsupportedConversion {
            class: FileClass::Image,
            target: "bmp".into(),
        };
        let json = serde_json::to_value(e.to_body()).unwrap();
        assert_eq!(json["error"], "UnsupportedConversion");
        assert!(json["message"].as_str().unwrap().contains("bmp"));
    }

    #[test]
    fn sanitize_replaces_scratch_root_and_collapses_whitespace() {
        let root = PathBuf::from("/var/tmp/fileconv-1234");
        let raw = "Error opening\n\n  /var/tmp/fileconv-1234/in.docx:\tbad zip";
        let out = sanitize_diagnostic(raw, Some(&root), 512);
        assert_eq!(out, "Error opening <scratch>/in.docx: bad zip");
    }

    #[test]
    fn sanitize_truncates_keeping_tail() {
        let raw = format!("{}END", "x".repeat(1000));
        let out = sanitize_diagnostic(&raw, None, 16);
        assert!(out.starts_with('\u{2026}'));
        assert!(out.ends_with("END"));
        assert!(out.len() <= 16 + '\u{2026}'.len_utf8());
    }

    #[test]
    fn sanitize_respects_char_boundaries() {
        let raw = "ééééééééé";
        let out = sanitize_diagnostic(raw, None, 5);
        assert!(out.ends_with('é'));
    }
}
