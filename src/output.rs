//! Result types returned by the conversion service.

use crate::pipeline::classify::{Classification, FileClass};
use crate::pipeline::queue::ResourceClass;
use crate::pipeline::registry::ConverterKind;
use crate::stream::OutputStream;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A successful conversion. The body still has to be consumed.
#[derive(Debug)]
pub struct ConversionOutput {
    pub job_id: Uuid,
    /// `<original stem>.<target>`, safe to put in a `Content-Disposition`.
    pub filename: String,
    pub content_type: String,
    pub source: Classification,
    pub target: String,
    pub stats: ConversionStats,
    /// Holds the job's scratch scope and queue permit until consumed or dropped.
    pub body: OutputStream,
}

impl ConversionOutput {
    /// Buffer the body. Convenient for small outputs and tests.
    pub async fn into_bytes(self) -> std::io::Result<Bytes> {
        self.body.into_bytes().await
    }
}

/// Statistics about one conversion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    pub input_bytes: u64,
    /// Known for buffered outputs and finished files.
    pub output_bytes: Option<u64>,
    pub engine: Option<ConverterKind>,
    pub resource_class: Option<ResourceClass>,
    /// Time spent inside the engine.
    pub engine_duration_ms: u64,
    /// Wall-clock time from request to output ready.
    pub total_duration_ms: u64,
}

/// What [`crate::ConversionService::inspect`] learned about an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectReport {
    pub len: u64,
    pub classification: Classification,
    /// Target used when the caller does not name one.
    pub default_target: Option<String>,
    /// Every target the registry serves for this class.
    pub targets: Vec<String>,
    pub engine: Option<ConverterKind>,
}

impl InspectReport {
    pub fn is_supported(&self) -> bool {
        self.classification.class != FileClass::Unknown && !self.targets.is_empty()
    }
}

/// A conversion written to disk by [`crate::ConversionService::convert_to_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrittenOutput {
    pub job_id: Uuid,
    pub path: std::path::PathBuf,
    pub content_type: String,
    pub bytes_written: u64,
    pub stats: ConversionStats,
}
