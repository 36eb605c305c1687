//! Engine registry: which converter serves which (class, target) pair.
//!
//! The table is built once and never mutated afterwards. The process-wide
//! instance is [`EngineRegistry::global`]; embedders and tests can build
//! their own with [`EngineRegistry::builder`].
//!
//! Lookups are exact matches against a normalized target (see
//! [`normalize_target`]). There is no best-effort fallback: a pair that is not
//! registered is rejected before any engine runs.

use crate::error::ConvertError;
use crate::pipeline::classify::{mime_for, FileClass};
use crate::pipeline::queue::ResourceClass;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The kind of engine behind a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConverterKind {
    /// External document engine (LibreOffice).
    Office,
    /// In-process image library.
    Image,
    /// External transcoder (FFmpeg).
    Media,
}

impl ConverterKind {
    /// Admission class in the job queue.
    pub fn resource_class(self) -> ResourceClass {
        match self {
            ConverterKind::Office | ConverterKind::Media => ResourceClass::Heavy,
            ConverterKind::Image => ResourceClass::Light,
        }
    }
}

impl fmt::Display for ConverterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConverterKind::Office => "office",
            ConverterKind::Image => "image",
            ConverterKind::Media => "media",
        })
    }
}

/// A registered converter and the targets it produces for one source class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub kind: ConverterKind,
    pub source: FileClass,
    pub targets: Vec<String>,
}

impl Capability {
    /// Whether `target` (already normalized) is in the declared set.
    pub fn supports(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t.eq_ignore_ascii_case(target))
    }
}

const OFFICE_TARGETS: &[&str] = &[
    "pdf", "docx", "doc", "odt", "rtf", "txt", "html", "xlsx", "xls", "ods", "csv", "pptx", "ppt", "odp",
];
const IMAGE_TARGETS: &[&str] = &["png", "jpg", "jpeg", "webp", "tiff", "gif", "avif"];
const MEDIA_TARGETS: &[&str] = &[
    "mp3", "wav", "ogg", "opus", "flac", "aac", "m4a", "mp4", "webm", "mkv", "mov", "avi",
];

static GLOBAL: Lazy<Arc<EngineRegistry>> = Lazy::new(|| Arc::new(EngineRegistry::standard()));

static TARGET_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]{1,10}$").expect("static regex"));

/// Read-only table of capabilities.
#[derive(Debug, Clone, Default)]
pub struct EngineRegistry {
    capabilities: Vec<Capability>,
}

impl EngineRegistry {
    /// The process-wide registry with the standard capability table.
    pub fn global() -> Arc<EngineRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Office → documents, images → images, audio/video → audio/video.
    pub fn standard() -> Self {
        Self::builder()
            .register(ConverterKind::Office, FileClass::OfficeDocument, OFFICE_TARGETS)
            .register(ConverterKind::Image, FileClass::Image, IMAGE_TARGETS)
            .register(ConverterKind::Media, FileClass::AudioVideo, MEDIA_TARGETS)
            .build()
    }

    pub fn builder() -> EngineRegistryBuilder {
        EngineRegistryBuilder::default()
    }

    /// Find the capability serving `(class, target)`.
    ///
    /// `Unknown` never matches. `target` is compared case-insensitively but
    /// is expected to be normalized already.
    pub fn lookup(&self, class: FileClass, target: &str) -> Option<&Capability> {
        if class == FileClass::Unknown {
            return None;
        }
        self.capabilities
            .iter()
            .find(|c| c.source == class && c.supports(target))
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// All targets registered for `class`, in registration order.
    pub fn targets_for(&self, class: FileClass) -> Vec<&str> {
        self.capabilities
            .iter()
            .filter(|c| c.source == class)
            .flat_map(|c| c.targets.iter().map(String::as_str))
            .collect()
    }
}

/// Builder for [`EngineRegistry`].
#[derive(Debug, Default)]
pub struct EngineRegistryBuilder {
    capabilities: Vec<Capability>,
}

impl EngineRegistryBuilder {
    pub fn register(mut self, kind: ConverterKind, source: FileClass, targets: &[&str]) -> Self {
        self.capabilities.push(Capability {
            kind,
            source,
            targets: targets.iter().map(|t| t.to_ascii_lowercase()).collect(),
        });
        self
    }

    pub fn build(self) -> EngineRegistry {
        EngineRegistry {
            capabilities: self.capabilities,
        }
    }
}

/// Target used when the caller did not name one.
pub fn default_target(class: FileClass) -> Option<&'static str> {
    match class {
        FileClass::OfficeDocument => Some("pdf"),
        FileClass::Image => Some("png"),
        FileClass::AudioVideo => Some("mp3"),
        FileClass::Unknown => None,
    }
}

/// Normalize a caller-supplied target: trimmed, lower-case, no leading dot.
///
/// Anything other than 1–10 ASCII letters/digits is an invalid request; the
/// target ends up in an engine's command line and in a filename.
pub fn normalize_target(raw: &str) -> Result<String, ConvertError> {
    let t = raw.trim().trim_start_matches('.').to_ascii_lowercase();
    if t.is_empty() {
        return Err(ConvertError::InvalidRequest("target format must not be empty".into()));
    }
    if !TARGET_SHAPE.is_match(&t) {
        return Err(ConvertError::InvalidRequest(format!(
            "target format {raw:?} is not a plain format name"
        )));
    }
    Ok(t)
}

/// Content type to answer with for a produced target.
pub fn content_type_for(target: &str) -> &'static str {
    mime_for(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bmp_is_not_an_image_target() {
        assert!(EngineRegistry::global().lookup(FileClass::Image, "bmp").is_none());
    }

    #[test]
    fn avif_is_an_image_target_heic_is_not() {
        let r = EngineRegistry::global();
        assert_eq!(r.lookup(FileClass::Image, "avif").unwrap().kind, ConverterKind::Image);
        assert!(r.lookup(FileClass::Image, "heic").is_none());
        assert_eq!(content_type_for("avif"), "image/avif");
    }

    #[test]
    fn lookup_by_class_and_target() {
        let r = EngineRegistry::global();
        assert_eq!(r.lookup(FileClass::Image, "webp").unwrap().kind, ConverterKind::Image);
        assert_eq!(r.lookup(FileClass::OfficeDocument, "pdf").unwrap().kind, ConverterKind::Office);
        assert_eq!(r.lookup(FileClass::AudioVideo, "MP3").unwrap().kind, ConverterKind::Media);
        // Cross-class targets are not served.
        assert!(r.lookup(FileClass::Image, "pdf").is_none());
        assert!(r.lookup(FileClass::OfficeDocument, "mp3").is_none());
    }

    #[test]
    fn unknown_class_never_matches() {
        for t in ["pdf", "png", "mp3"] {
            assert!(EngineRegistry::global().lookup(FileClass::Unknown, t).is_none());
        }
    }

    #[test]
    fn defaults_per_class() {
        assert_eq!(default_target(FileClass::OfficeDocument), Some("pdf"));
        assert_eq!(default_target(FileClass::Image), Some("png"));
        assert_eq!(default_target(FileClass::AudioVideo), Some("mp3"));
        assert_eq!(default_target(FileClass::Unknown), None);
    }

    #[test]
    fn defaults_are_registered() {
        let r = EngineRegistry::global();
        for class in [FileClass::OfficeDocument, FileClass::Image, FileClass::AudioVideo] {
            let t = default_target(class).unwrap();
            assert!(r.lookup(class, t).is_some(), "{class} default {t} not registered");
        }
    }

    #[test]
    fn normalize_strips_dot_and_case() {
        assert_eq!(normalize_target(" .PDF ").unwrap(), "pdf");
        assert_eq!(normalize_target("Mp3").unwrap(), "mp3");
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize_target("").is_err());
        assert!(normalize_target(" . ").is_err());
        assert!(normalize_target("pdf;rm -rf").is_err());
        assert!(normalize_target("../png").is_err());
        assert!(normalize_target("abcdefghijk").is_err());
    }

    #[test]
    fn custom_registry() {
        let r = EngineRegistry::builder()
            .register(ConverterKind::Image, FileClass::Image, &["PNG"])
            .build();
        assert!(r.lookup(FileClass::Image, "png").is_some());
        assert!(r.lookup(FileClass::Image, "jpg").is_none());
        assert_eq!(r.targets_for(FileClass::Image), vec!["png"]);
    }

    #[test]
    fn resource_classes() {
        assert_eq!(ConverterKind::Office.resource_class(), ResourceClass::Heavy);
        assert_eq!(ConverterKind::Media.resource_class(), ResourceClass::Heavy);
        assert_eq!(ConverterKind::Image.resource_class(), ResourceClass::Light);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("pdf"), "application/pdf");
        assert_eq!(content_type_for("mp3"), "audio/mpeg");
        assert_eq!(content_type_for("jpeg"), "image/jpeg");
    }
}
