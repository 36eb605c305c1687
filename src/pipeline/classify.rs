//! Format classification: decide what an upload really is from its bytes.
//!
//! Filenames and client-declared MIME types are untrusted. Dispatch is driven
//! by magic-byte sniffing over the first few KiB of the upload; the filename is
//! consulted only when the signature is a generic container that many formats
//! share (a bare ZIP or OLE2 compound file), and the declared MIME only when no
//! signature matched at all.
//!
//! ```text
//! head bytes ──▶ signature ──┬─ known format ───────────────▶ Signature
//!                            ├─ ZIP  ─▶ entry names / ext ──▶ Signature | Extension
//!                            └─ OLE2 ─▶ ext ────────────────▶ Extension
//!            (no signature) ──▶ declared MIME ──────────────▶ DeclaredMime
//!                                        (nothing) ─────────▶ Unknown
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Coarse semantic category of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileClass {
    OfficeDocument,
    Image,
    AudioVideo,
    Unknown,
}

impl fmt::Display for FileClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileClass::OfficeDocument => "office document",
            FileClass::Image => "image",
            FileClass::AudioVideo => "audio/video",
            FileClass::Unknown => "unknown file type",
        };
        f.write_str(s)
    }
}

/// Which piece of evidence decided the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionSource {
    /// Magic bytes / container structure.
    Signature,
    /// Filename extension, used to disambiguate a generic container.
    Extension,
    /// Client-declared MIME type; nothing in the bytes matched.
    DeclaredMime,
    /// Nothing matched.
    None,
}

/// Result of classifying an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub class: FileClass,
    /// Best-guess concrete source format, e.g. `"png"`, `"docx"`, `"mp4"`.
    /// `"bin"` when nothing matched.
    pub format: String,
    /// MIME type corresponding to `format`.
    pub mime: String,
    pub source: DetectionSource,
}

impl Classification {
    fn new(class: FileClass, format: &str, source: DetectionSource) -> Self {
        Self {
            class,
            format: format.to_string(),
            mime: mime_for(format).to_string(),
            source,
        }
    }

    fn unknown(format: &str) -> Self {
        Self::new(FileClass::Unknown, format, DetectionSource::None)
    }
}

/// Outcome of the raw signature scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signature {
    Known(FileClass, &'static str),
    Zip,
    Ole2,
}

const ZIP_OFFICE_EXTENSIONS: &[&str] = &["docx", "xlsx", "pptx", "odt", "ods", "odp"];
const OLE2_OFFICE_EXTENSIONS: &[&str] = &["doc", "xls", "ppt"];

/// Classify an upload.
///
/// * `head` — the first bytes of the content (callers pass at most
///   [`crate::ConversionConfig::sniff_len`] bytes; more is fine).
/// * `filename` — original client filename, cosmetic except for ZIP/OLE2.
/// * `declared_mime` — client-declared MIME, consulted last.
pub fn classify(head: &[u8], filename: Option<&str>, declared_mime: Option<&str>) -> Classification {
    match sniff_signature(head) {
        Some(Signature::Known(class, format)) => {
            Classification::new(class, format, DetectionSource::Signature)
        }
        Some(Signature::Zip) => {
            if let Some(format) = sniff_zip_office(head) {
                return Classification::new(FileClass::OfficeDocument, format, DetectionSource::Signature);
            }
            match extension_of(filename) {
                Some(ext) if ZIP_OFFICE_EXTENSIONS.contains(&ext.as_str()) => {
                    Classification::new(FileClass::OfficeDocument, &ext, DetectionSource::Extension)
                }
                _ => Classification::unknown("zip"),
            }
        }
        Some(Signature::Ole2) => match extension_of(filename) {
            Some(ext) if OLE2_OFFICE_EXTENSIONS.contains(&ext.as_str()) => {
                Classification::new(FileClass::OfficeDocument, &ext, DetectionSource::Extension)
            }
            _ => Classification::unknown("ole2"),
        },
        None => declared_mime
            .and_then(classify_declared_mime)
            .unwrap_or_else(|| Classification::unknown("bin")),
    }
}

/// Scan the head for a known magic number.
fn sniff_signature(h: &[u8]) -> Option<Signature> {
    use FileClass::{AudioVideo as Av, Image as Img, OfficeDocument as Office};
    use Signature::Known;

    // ── Images ───────────────────────────────────────────────────────────
    if h.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some(Known(Img, "png"));
    }
    if h.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(Known(Img, "jpg"));
    }
    if h.starts_with(b"GIF87a") || h.starts_with(b"GIF89a") {
        return Some(Known(Img, "gif"));
    }
    if h.starts_with(b"II*\0") || h.starts_with(b"MM\0*") {
        return Some(Known(Img, "tiff"));
    }

    // ── RIFF family ──────────────────────────────────────────────────────
    if h.len() >= 12 && &h[0..4] == b"RIFF" {
        match &h[8..12] {
            b"WEBP" => return Some(Known(Img, "webp")),
            b"WAVE" => return Some(Known(Av, "wav")),
            b"AVI " => return Some(Known(Av, "avi")),
            _ => {}
        }
    }

    // ── ISO base media (ftyp box) ────────────────────────────────────────
    if h.len() >= 12 && &h[4..8] == b"ftyp" {
        let brand = &h[8..12];
        return Some(match brand {
            // Still images, but no decoder is built in for them.
            b"avif" | b"avis" => Known(FileClass::Unknown, "avif"),
            b"heic" | b"heix" | b"hevc" | b"heim" | b"heis" | b"mif1" | b"msf1" => {
                Known(FileClass::Unknown, "heic")
            }
            b"M4A " | b"M4B " => Known(Av, "m4a"),
            b"qt  " => Known(Av, "mov"),
            b if b.starts_with(b"3g") => Known(Av, "3gp"),
            _ => Known(Av, "mp4"),
        });
    }

    // After ftyp: a 256-byte ftyp box also starts 00 00 01 00.
    if h.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return Some(Known(Img, "ico"));
    }

    // ── Other audio/video containers ─────────────────────────────────────
    if h.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        let webm = contains(&h[..h.len().min(64)], b"webm");
        return Some(Known(Av, if webm { "webm" } else { "mkv" }));
    }
    if h.starts_with(b"OggS") {
        let opus = contains(h, b"OpusHead");
        return Some(Known(Av, if opus { "opus" } else { "ogg" }));
    }
    if h.starts_with(b"fLaC") {
        return Some(Known(Av, "flac"));
    }
    if h.len() >= 12 && &h[0..4] == b"FORM" && (&h[8..12] == b"AIFF" || &h[8..12] == b"AIFC") {
        return Some(Known(Av, "aiff"));
    }
    if h.starts_with(b"ID3") {
        return Some(Known(Av, "mp3"));
    }
    if h.len() >= 2 && h[0] == 0xFF && (h[1] & 0xE0) == 0xE0 {
        // Frame sync. Layer bits 00 are reserved in MPEG audio but mark ADTS AAC.
        let layer = (h[1] >> 1) & 0x03;
        return Some(Known(Av, if layer == 0 { "aac" } else { "mp3" }));
    }
    if h.starts_with(b"FLV\x01") {
        return Some(Known(Av, "flv"));
    }
    if h.starts_with(&[0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11]) {
        return Some(Known(Av, "wmv"));
    }
    if h.starts_with(b"#!AMR") {
        return Some(Known(Av, "amr"));
    }
    if h.starts_with(&[0x00, 0x00, 0x01, 0xBA]) {
        return Some(Known(Av, "mpg"));
    }
    if h.len() > 188 && h[0] == 0x47 && h[188] == 0x47 {
        return Some(Known(Av, "ts"));
    }

    // ── Documents ────────────────────────────────────────────────────────
    if h.starts_with(b"{\\rtf") {
        return Some(Known(Office, "rtf"));
    }
    if h.starts_with(b"%PDF-") {
        // Recognised so it is reported accurately, but no converter takes it.
        return Some(Known(FileClass::Unknown, "pdf"));
    }
    if h.starts_with(b"PK\x03\x04") {
        return Some(Signature::Zip);
    }
    if h.starts_with(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]) {
        return Some(Signature::Ole2);
    }

    // BMP last: a two-byte magic is the weakest signature in the table.
    if h.len() >= 14 && h.starts_with(b"BM") {
        return Some(Known(Img, "bmp"));
    }

    None
}

/// Resolve a ZIP container to a concrete office format from its entries.
///
/// ODF stores an uncompressed `mimetype` entry first; OOXML starts with
/// `[Content_Types].xml` and keeps its parts under `word/`, `xl/` or `ppt/`.
fn sniff_zip_office(h: &[u8]) -> Option<&'static str> {
    if let Some(mime) = first_stored_entry(h, b"mimetype") {
        return match mime {
            m if m.starts_with(b"application/vnd.oasis.opendocument.text") => Some("odt"),
            m if m.starts_with(b"application/vnd.oasis.opendocument.spreadsheet") => Some("ods"),
            m if m.starts_with(b"application/vnd.oasis.opendocument.presentation") => Some("odp"),
            _ => None,
        };
    }

    if contains(h, b"[Content_Types].xml") {
        if contains(h, b"word/") {
            return Some("docx");
        }
        if contains(h, b"xl/") {
            return Some("xlsx");
        }
        if contains(h, b"ppt/") {
            return Some("pptx");
        }
    }
    None
}

/// If the first local file header of a ZIP names `name`, return the bytes
/// that follow the header (the stored entry content, up to the end of `h`).
fn first_stored_entry<'a>(h: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if h.len() < 30 {
        return None;
    }
    let name_len = u16::from_le_bytes([h[26], h[27]]) as usize;
    let extra_len = u16::from_le_bytes([h[28], h[29]]) as usize;
    let name_end = 30 + name_len;
    if h.len() < name_end || &h[30..name_end] != name {
        return None;
    }
    h.get(name_end + extra_len..)
}

/// Image formats recognised by name that the image engine cannot decode.
const UNDECODABLE_IMAGES: &[&str] = &["avif", "heic", "heif"];

/// Map a declared MIME onto a class when nothing in the bytes matched.
fn classify_declared_mime(declared: &str) -> Option<Classification> {
    let mime = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let exact = match mime.as_str() {
        "text/plain" => Some((FileClass::OfficeDocument, "txt")),
        "text/csv" => Some((FileClass::OfficeDocument, "csv")),
        "text/html" => Some((FileClass::OfficeDocument, "html")),
        "text/rtf" | "application/rtf" => Some((FileClass::OfficeDocument, "rtf")),
        "application/msword" => Some((FileClass::OfficeDocument, "doc")),
        "application/vnd.ms-excel" => Some((FileClass::OfficeDocument, "xls")),
        "application/vnd.ms-powerpoint" => Some((FileClass::OfficeDocument, "ppt")),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            Some((FileClass::OfficeDocument, "docx"))
        }
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
            Some((FileClass::OfficeDocument, "xlsx"))
        }
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
            Some((FileClass::OfficeDocument, "pptx"))
        }
        "application/vnd.oasis.opendocument.text" => Some((FileClass::OfficeDocument, "odt")),
        "application/vnd.oasis.opendocument.spreadsheet" => Some((FileClass::OfficeDocument, "ods")),
        "application/vnd.oasis.opendocument.presentation" => Some((FileClass::OfficeDocument, "odp")),
        _ => None,
    };
    if let Some((class, format)) = exact {
        return Some(Classification::new(class, format, DetectionSource::DeclaredMime));
    }

    let (family, subtype) = mime.split_once('/')?;
    let class = match family {
        "image" => FileClass::Image,
        "audio" | "video" => FileClass::AudioVideo,
        _ => return None,
    };
    let format = match subtype {
        "jpeg" | "pjpeg" => "jpg".to_string(),
        "mpeg" if family == "audio" => "mp3".to_string(),
        "quicktime" => "mov".to_string(),
        other => other.trim_start_matches("x-").to_string(),
    };
    if format.is_empty() {
        return None;
    }
    let class = if class == FileClass::Image && UNDECODABLE_IMAGES.contains(&format.as_str()) {
        FileClass::Unknown
    } else {
        class
    };
    Some(Classification {
        class,
        mime: mime.clone(),
        format,
        source: DetectionSource::DeclaredMime,
    })
}

/// Lower-cased extension of the basename of an untrusted filename.
fn extension_of(filename: Option<&str>) -> Option<String> {
    let name = filename?.rsplit(['/', '\\']).next()?;
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// MIME type for a concrete format name (source or target).
pub fn mime_for(format: &str) -> &'static str {
    match format {
        // images
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tiff" | "tif" => "image/tiff",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "avif" => "image/avif",
        "heic" => "image/heic",
        // audio
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "opus" => "audio/opus",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "m4a" => "audio/mp4",
        "aiff" => "audio/aiff",
        "amr" => "audio/amr",
        // video
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "3gp" => "video/3gpp",
        "flv" => "video/x-flv",
        "wmv" => "video/x-ms-wmv",
        "mpg" => "video/mpeg",
        "ts" => "video/mp2t",
        // documents
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "odt" => "application/vnd.oasis.opendocument.text",
        "ods" => "application/vnd.oasis.opendocument.spreadsheet",
        "odp" => "application/vnd.oasis.opendocument.presentation",
        "rtf" => "application/rtf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" => "text/html",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
