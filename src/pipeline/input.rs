//! Input resolution: turn a user-supplied path or URL into upload bytes.
//!
//! The request pipeline works on in-memory uploads, exactly like a form post.
//! This module is how the CLI and [`crate::ConversionService::convert_file`]
//! produce one from a local file or an HTTP(S) URL. The upload bound is
//! enforced while reading: a local file is checked by its metadata before it
//! is read, and a download is aborted as soon as it crosses the bound.

use crate::error::ConvertError;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// An input ready to be submitted as a [`crate::ConversionForm`].
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub bytes: Bytes,
    /// Name to derive the output filename from.
    pub filename: Option<String>,
    /// `Content-Type` of a download. Never set for local files.
    pub declared_mime: Option<String>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to upload bytes, reading at most `max_bytes`.
pub async fn resolve_input(
    input: &str,
    max_bytes: u64,
    timeout_secs: u64,
) -> Result<ResolvedInput, ConvertError> {
    if is_url(input) {
        download_url(input, max_bytes, timeout_secs).await
    } else {
        read_local(Path::new(input), max_bytes).await
    }
}

/// Read a local file, refusing it up front if it is over the bound.
pub async fn read_local(path: &Path, max_bytes: u64) -> Result<ResolvedInput, ConvertError> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            ConvertError::InvalidRequest(format!("input file not found: {}", path.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            ConvertError::InvalidRequest(format!("permission denied: {}", path.display()))
        }
        _ => ConvertError::InvalidRequest(format!("cannot read {}: {e}", path.display())),
    })?;
    if !meta.is_file() {
        return Err(ConvertError::InvalidRequest(format!(
            "not a regular file: {}",
            path.display()
        )));
    }
    if meta.len() > max_bytes {
        return Err(ConvertError::UploadTooLarge {
            size: meta.len(),
            max: max_bytes,
        });
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ConvertError::InvalidRequest(format!("cannot read {}: {e}", path.display())))?;
    debug!(path = %path.display(), len = bytes.len(), "Resolved local input");

    Ok(ResolvedInput {
        bytes: Bytes::from(bytes),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string()),
        declared_mime: None,
    })
}

/// Download a URL into memory, aborting once `max_bytes` is exceeded.
async fn download_url(url: &str, max_bytes: u64, timeout_secs: u64) -> Result<ResolvedInput, ConvertError> {
    info!(url, "Downloading input");
    let failed = |reason: String| ConvertError::InvalidRequest(format!("download of {url} failed: {reason}"));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ConvertError::Internal(format!("HTTP client: {e}")))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }
    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(ConvertError::UploadTooLarge { size: len, max: max_bytes });
        }
    }

    let declared_mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty());
    let filename = extract_filename(url);

    let mut buf = BytesMut::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| failed(e.to_string()))?;
        if (buf.len() + chunk.len()) as u64 > max_bytes {
            return Err(ConvertError::UploadTooLarge {
                size: (buf.len() + chunk.len()) as u64,
                max: max_bytes,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    info!(url, len = buf.len(), "Downloaded input");

    Ok(ResolvedInput {
        bytes: buf.freeze(),
        filename,
        declared_mime,
    })
}

/// Last non-empty path segment of the URL, if it looks like a filename.
fn extract_filename(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() || !last.contains('.') {
        return None;
    }
    Some(last.to_string())
}

/// Where `convert_to_file` writes when the caller gave a directory (or nothing).
pub fn output_path_in(dir: Option<&Path>, filename: &str) -> PathBuf {
    match dir {
        Some(d) => d.join(filename),
        None => PathBuf::from(filename),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.docx"));
        assert!(is_url("http://example.com/a.png"));
        assert!(!is_url("/tmp/a.png"));
        assert!(!is_url("a.png"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_from_url() {
        assert_eq!(extract_filename("https://x.test/files/report.docx?x=1").as_deref(), Some("report.docx"));
        assert_eq!(extract_filename("https://x.test/files/"), None);
        assert_eq!(extract_filename("https://x.test/download"), None);
    }

    #[tokio::test]
    async fn local_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("photo.png");
        std::fs::write(&p, b"\x89PNG\r\n\x1a\n").unwrap();
        let r = read_local(&p, 1024).await.unwrap();
        assert_eq!(r.bytes.len(), 8);
        assert_eq!(r.filename.as_deref(), Some("photo.png"));
        assert!(r.declared_mime.is_none());
    }

    #[tokio::test]
    async fn local_file_over_bound_is_rejected_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("big.bin");
        std::fs::write(&p, vec![0u8; 2048]).unwrap();
        let err = read_local(&p, 1024).await.unwrap_err();
        assert!(matches!(err, ConvertError::UploadTooLarge { size: 2048, max: 1024 }));
    }

    #[tokio::test]
    async fn missing_file_is_invalid_request() {
        let err = resolve_input("/definitely/not/here.docx", 1024, 5).await.unwrap_err();
        assert!(matches!(err, ConvertError::InvalidRequest(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn directory_is_not_an_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_local(dir.path(), 1024).await.unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn output_path_joins_dir() {
        assert_eq!(output_path_in(Some(Path::new("/out")), "a.pdf"), PathBuf::from("/out/a.pdf"));
        assert_eq!(output_path_in(None, "a.pdf"), PathBuf::from("a.pdf"));
    }
}
