//! Configuration for the conversion pipeline.
//!
//! Every knob lives in [`ConversionConfig`], built via its
//! [`ConversionConfigBuilder`]. Setters clamp obviously bad values; `build()`
//! rejects combinations that cannot work (for instance a zero upload bound).

use crate::error::ConvertError;
use crate::progress::{JobObserver, ObserverHandle};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Configuration for a [`crate::ConversionService`].
///
/// # Example
/// ```rust
/// use edgequake_fileconv::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .heavy_limit(4)
///     .office_timeout_secs(120)
///     .build()
///     .unwrap();
/// assert_eq!(config.heavy_limit, 4);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Largest accepted upload in bytes. Default: 200 MiB.
    pub max_upload_bytes: u64,

    /// Concurrent office/media jobs. Default: 2.
    ///
    /// Each heavy job is a separate engine process. Keep this near the
    /// number of cores you are willing to give to conversions.
    pub heavy_limit: usize,

    /// Concurrent in-process image jobs. Default: 8.
    pub light_limit: usize,

    /// Wall-clock budget for one LibreOffice run, in seconds. Default: 60.
    pub office_timeout_secs: u64,

    /// Fixed part of the FFmpeg budget, in seconds. Default: 30.
    pub media_timeout_base_secs: u64,

    /// Extra FFmpeg budget per MiB of input, in seconds. Default: 2.
    pub media_timeout_per_mib_secs: u64,

    /// Bytes read from the head of the upload for signature sniffing. Default: 4096.
    pub sniff_len: usize,

    /// Upper bound on engine diagnostics returned to callers. Default: 512.
    pub max_diagnostic_bytes: usize,

    /// Directory under which per-request scratch directories are created.
    /// If None, the system temp dir.
    pub scratch_root: Option<PathBuf>,

    /// Explicit `soffice` binary. If None, looked up on `PATH`.
    pub soffice_path: Option<PathBuf>,

    /// Explicit `ffmpeg` binary. If None, looked up on `PATH`.
    pub ffmpeg_path: Option<PathBuf>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Job lifecycle observer. If None, events are dropped.
    pub observer: Option<ObserverHandle>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 200 * MIB,
            heavy_limit: 2,
            light_limit: 8,
            office_timeout_secs: 60,
            media_timeout_base_secs: 30,
            media_timeout_per_mib_secs: 2,
            sniff_len: 4096,
            max_diagnostic_bytes: 512,
            scratch_root: None,
            soffice_path: None,
            ffmpeg_path: None,
            download_timeout_secs: 120,
            observer: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("heavy_limit", &self.heavy_limit)
            .field("light_limit", &self.light_limit)
            .field("office_timeout_secs", &self.office_timeout_secs)
            .field("media_timeout_base_secs", &self.media_timeout_base_secs)
            .field("media_timeout_per_mib_secs", &self.media_timeout_per_mib_secs)
            .field("sniff_len", &self.sniff_len)
            .field("max_diagnostic_bytes", &self.max_diagnostic_bytes)
            .field("scratch_root", &self.scratch_root)
            .field("soffice_path", &self.soffice_path)
            .field("ffmpeg_path", &self.ffmpeg_path)
            .field("observer", &self.observer.as_ref().map(|_| "<dyn JobObserver>"))
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn office_timeout(&self) -> Duration {
        Duration::from_secs(self.office_timeout_secs)
    }

    /// FFmpeg budget for an input of `input_len` bytes: base + per-MiB, MiB rounded up.
    pub fn media_timeout_for(&self, input_len: u64) -> Duration {
        let mib = input_len.div_ceil(MIB);
        let secs = self
            .media_timeout_base_secs
            .saturating_add(self.media_timeout_per_mib_secs.saturating_mul(mib));
        Duration::from_secs(secs)
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn max_upload_bytes(mut self, n: u64) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn max_upload_mib(self, mib: u64) -> Self {
        self.max_upload_bytes(mib.saturating_mul(MIB))
    }

    pub fn heavy_limit(mut self, n: usize) -> Self {
        self.config.heavy_limit = n.max(1);
        self
    }

    pub fn light_limit(mut self, n: usize) -> Self {
        self.config.light_limit = n.max(1);
        self
    }

    pub fn office_timeout_secs(mut self, secs: u64) -> Self {
        self.config.office_timeout_secs = secs;
        self
    }

    pub fn media_timeout_base_secs(mut self, secs: u64) -> Self {
        self.config.media_timeout_base_secs = secs;
        self
    }

    pub fn media_timeout_per_mib_secs(mut self, secs: u64) -> Self {
        self.config.media_timeout_per_mib_secs = secs;
        self
    }

    /// Clamped to 64 B–64 KiB; container signatures all sit in the first few hundred bytes.
    pub fn sniff_len(mut self, n: usize) -> Self {
        self.config.sniff_len = n.clamp(64, 64 * 1024);
        self
    }

    pub fn max_diagnostic_bytes(mut self, n: usize) -> Self {
        self.config.max_diagnostic_bytes = n.max(16);
        self
    }

    pub fn scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = Some(dir.into());
        self
    }

    pub fn soffice_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.soffice_path = Some(path.into());
        self
    }

    pub fn ffmpeg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ffmpeg_path = Some(path.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, ConvertError> {
        let c = &self.config;
        if c.max_upload_bytes == 0 {
            return Err(ConvertError::InvalidConfig(
                "Upload limit must be > 0 bytes".into(),
            ));
        }
        if c.heavy_limit == 0 || c.light_limit == 0 {
            return Err(ConvertError::InvalidConfig(
                "Job limits must be ≥ 1".into(),
            ));
        }
        if c.office_timeout_secs == 0 || c.media_timeout_base_secs == 0 {
            return Err(ConvertError::InvalidConfig(
                "Engine timeouts must be ≥ 1 second".into(),
            ));
        }
        if let Some(root) = &c.scratch_root {
            if !root.is_dir() {
                return Err(ConvertError::InvalidConfig(format!(
                    "Scratch root {} is not a directory",
                    root.display()
                )));
            }
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ConversionConfig::default();
        assert_eq!(c.max_upload_bytes, 200 * MIB);
        assert_eq!(c.heavy_limit, 2);
        assert_eq!(c.light_limit, 8);
        assert_eq!(c.office_timeout(), Duration::from_secs(60));
        assert_eq!(c.sniff_len, 4096);
        assert_eq!(c.max_diagnostic_bytes, 512);
    }

    #[test]
    fn media_timeout_scales_with_size() {
        let c = ConversionConfig::default();
        assert_eq!(c.media_timeout_for(0), Duration::from_secs(30));
        assert_eq!(c.media_timeout_for(1), Duration::from_secs(32));
        assert_eq!(c.media_timeout_for(10 * MIB), Duration::from_secs(50));
    }

    #[test]
    fn setters_clamp() {
        let c = ConversionConfig::builder()
            .heavy_limit(0)
            .light_limit(0)
            .sniff_len(1)
            .build()
            .unwrap();
        assert_eq!(c.heavy_limit, 1);
        assert_eq!(c.light_limit, 1);
        assert_eq!(c.sniff_len, 64);
    }

    #[test]
    fn zero_upload_limit_rejected() {
        let err = ConversionConfig::builder().max_upload_bytes(0).build().unwrap_err();
        assert!(matches!(err, ConvertError::InvalidConfig(_)));
    }

    #[test]
    fn zero_timeout_rejected() {
        assert!(ConversionConfig::builder().office_timeout_secs(0).build().is_err());
    }

    #[test]
    fn missing_scratch_root_rejected() {
        let err = ConversionConfig::builder()
            .scratch_root("/definitely/not/here/fileconv")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn mib_setter() {
        let c = ConversionConfig::builder().max_upload_mib(5).build().unwrap();
        assert_eq!(c.max_upload_bytes, 5 * MIB);
    }
}
