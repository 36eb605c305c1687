//! Images through the `image` crate.
//!
//! Decoding and encoding are CPU-bound and run on the blocking pool. The
//! decoder gets allocation limits derived from the upload bound, so a small
//! file that claims gigapixel dimensions is rejected instead of allocated.
//!
//! Resizing fits the image inside the requested bounds, keeps the aspect ratio
//! and never enlarges unless the caller asked for it.

use crate::engine::{ConvertedOutput, Converter, EngineContext};
use crate::error::ConvertError;
use crate::job::TransformParams;
use crate::pipeline::classify::FileClass;
use crate::pipeline::registry::ConverterKind;
use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageFormat, ImageReader, Limits};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Decoded pixels may take this many times the upload bound.
const ALLOC_FACTOR: u64 = 8;

/// Hard cap on decoded side length.
const MAX_SIDE: u32 = 32_768;

/// The in-process image converter.
#[derive(Debug, Clone, Default)]
pub struct ImageEngine {
    active: Arc<AtomicUsize>,
}

impl ImageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transcodes currently running on the blocking pool.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Counts one running transcode; decremented even if the transcode panics.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Converter for ImageEngine {
    fn kind(&self) -> ConverterKind {
        ConverterKind::Image
    }

    fn name(&self) -> &str {
        "image"
    }

    async fn convert(&self, ctx: &EngineContext<'_>) -> Result<ConvertedOutput, ConvertError> {
        let data = tokio::fs::read(ctx.input.handle.path())
            .await
            .map_err(|e| ConvertError::Internal(format!("reading scratch input: {e}")))?;
        let target = ctx.target.to_string();
        let transform = *ctx.transform;
        let max_alloc = ctx.config.max_upload_bytes.saturating_mul(ALLOC_FACTOR);
        let active = Arc::clone(&self.active);

        let mut task = tokio::task::spawn_blocking(move || {
            let _guard = ActiveGuard::enter(&active);
            transcode(&data, &target, &transform, max_alloc)
        });

        let out = tokio::select! {
            joined = &mut task => joined
                .map_err(|e| ConvertError::Internal(format!("image task failed: {e}")))??,
            _ = ctx.cancel.cancelled() => {
                // The blocking thread cannot be interrupted. Wait for it so the
                // caller's light permit covers the whole transcode.
                debug!(job_id = %ctx.job_id, "Cancelled; waiting for image transcode to stop");
                let _ = task.await;
                return Err(ConvertError::Cancelled);
            }
        };
        Ok(ConvertedOutput::Bytes(out))
    }
}

/// Encoder for a registered image target.
pub fn output_format(target: &str) -> Option<ImageFormat> {
    match target {
        "png" => Some(ImageFormat::Png),
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        "webp" => Some(ImageFormat::WebP),
        "tiff" => Some(ImageFormat::Tiff),
        "gif" => Some(ImageFormat::Gif),
        "avif" => Some(ImageFormat::Avif),
        _ => None,
    }
}

/// Output dimensions for a `src_w × src_h` image under `t`.
pub fn fit_within(src_w: u32, src_h: u32, t: &TransformParams) -> (u32, u32) {
    if src_w == 0 || src_h == 0 || !t.is_resize() {
        return (src_w, src_h);
    }
    let sx = t.width.map(|w| w as f64 / src_w as f64);
    let sy = t.height.map(|h| h as f64 / src_h as f64);
    let mut scale = match (sx, sy) {
        (Some(x), Some(y)) => x.min(y),
        (Some(x), None) => x,
        (None, Some(y)) => y,
        (None, None) => 1.0,
    };
    if !t.allow_upscale {
        scale = scale.min(1.0);
    }
    let w = ((src_w as f64 * scale).round() as u32).clamp(1, MAX_SIDE);
    let h = ((src_h as f64 * scale).round() as u32).clamp(1, MAX_SIDE);
    (w, h)
}

/// Decode `data`, resize per `t`, encode as `target`.
pub fn transcode(
    data: &[u8],
    target: &str,
    t: &TransformParams,
    max_alloc: u64,
) -> Result<Bytes, ConvertError> {
    let format = output_format(target).ok_or_else(|| ConvertError::UnsupportedConversion {
        class: FileClass::Image,
        target: target.to_string(),
    })?;

    let mut reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ConvertError::InvalidInput {
            detail: e.to_string(),
        })?;
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_SIDE);
    limits.max_image_height = Some(MAX_SIDE);
    limits.max_alloc = Some(max_alloc);
    reader.limits(limits);

    let img = reader.decode().map_err(|e| ConvertError::InvalidInput {
        detail: e.to_string(),
    })?;

    let (w, h) = fit_within(img.width(), img.height(), t);
    let img = if (w, h) != (img.width(), img.height()) {
        debug!(from_w = img.width(), from_h = img.height(), w, h, "Resizing");
        img.resize_exact(w, h, FilterType::Lanczos3)
    } else {
        img
    };

    let img = prepare_for(img, format);
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format)
        .map_err(|e| ConvertError::EngineFailure {
            engine: "image".into(),
            detail: e.to_string(),
        })?;
    Ok(Bytes::from(out.into_inner()))
}

/// Convert pixels to a layout the target encoder accepts.
fn prepare_for(img: DynamicImage, format: ImageFormat) -> DynamicImage {
    match format {
        // No alpha channel in JPEG.
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        ImageFormat::WebP | ImageFormat::Gif | ImageFormat::Avif => DynamicImage::ImageRgba8(img.to_rgba8()),
        _ => match img.color() {
            ColorType::Rgb32F | ColorType::Rgba32F => DynamicImage::ImageRgba16(img.to_rgba16()),
            _ => img,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classify::classify;
    use image::{GenericImageView, Rgba, RgbaImage};

    const LIMIT: u64 = 512 * 1024 * 1024;

    fn png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(w, h, Rgba([200, 30, 30, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn dims(bytes: &[u8]) -> (u32, u32) {
        image::load_from_memory(bytes).unwrap().dimensions()
    }

    fn width(w: u32) -> TransformParams {
        TransformParams {
            width: Some(w),
            ..Default::default()
        }
    }

    #[test]
    fn fit_within_keeps_aspect_ratio() {
        assert_eq!(fit_within(200, 400, &width(100)), (100, 200));
        let t = TransformParams {
            width: Some(100),
            height: Some(100),
            allow_upscale: false,
        };
        assert_eq!(fit_within(200, 400, &t), (50, 100));
    }

    #[test]
    fn fit_within_never_upscales_by_default() {
        assert_eq!(fit_within(200, 400, &width(800)), (200, 400));
        let up = TransformParams {
            width: Some(400),
            height: None,
            allow_upscale: true,
        };
        assert_eq!(fit_within(200, 400, &up), (400, 800));
    }

    #[test]
    fn fit_within_without_bounds_is_identity() {
        assert_eq!(fit_within(7, 9, &TransformParams::default()), (7, 9));
    }

    #[test]
    fn resize_200x400_to_width_100() {
        let out = transcode(&png(200, 400), "png", &width(100), LIMIT).unwrap();
        assert_eq!(dims(&out), (100, 200));
    }

    #[test]
    fn png_output_reclassifies_as_png() {
        let out = transcode(&png(4, 4), "png", &TransformParams::default(), LIMIT).unwrap();
        let c = classify(&out, Some("whatever.bin"), None);
        assert_eq!(c.class, FileClass::Image);
        assert_eq!(c.format, "png");
    }

    #[test]
    fn jpeg_from_rgba_flattens_alpha() {
        let out = transcode(&png(8, 8), "jpg", &TransformParams::default(), LIMIT).unwrap();
        assert_eq!(&out[..3], &[0xFF, 0xD8, 0xFF]);
        assert_eq!(dims(&out), (8, 8));
    }

    #[test]
    fn webp_gif_tiff_targets_encode() {
        for t in ["webp", "gif", "tiff"] {
            let out = transcode(&png(6, 3), t, &TransformParams::default(), LIMIT).unwrap();
            let c = classify(&out, None, None);
            assert_eq!(c.class, FileClass::Image, "{t}");
            assert_eq!(dims(&out), (6, 3), "{t}");
        }
    }

    #[test]
    fn avif_target_encodes_isobmff() {
        let out = transcode(&png(16, 8), "avif", &TransformParams::default(), LIMIT).unwrap();
        assert_eq!(&out[4..8], b"ftyp");
        assert_eq!(classify(&out, None, None).format, "avif");
    }

    #[tokio::test]
    async fn cancel_waits_for_blocking_transcode() {
        use crate::config::ConversionConfig;
        use crate::job::UploadedFile;
        use crate::pipeline::scratch::{ScratchLedger, ScratchScope};
        use tokio_util::sync::CancellationToken;

        let root = tempfile::tempdir().unwrap();
        let scope = ScratchScope::new(Some(root.path()), ScratchLedger::new()).unwrap();
        let bytes = png(800, 800);
        let input = UploadedFile {
            len: bytes.len() as u64,
            original_name: None,
            declared_mime: None,
            handle: scope.acquire_from_bytes("png", &bytes).await.unwrap(),
        };
        let classification = classify(&bytes, None, None);
        let transform = TransformParams {
            width: Some(1600),
            height: None,
            allow_upscale: true,
        };
        let config = ConversionConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let engine = ImageEngine::new();
        let ctx = EngineContext {
            job_id: uuid::Uuid::new_v4(),
            input: &input,
            classification: &classification,
            target: "png",
            transform: &transform,
            scope: &scope,
            cancel: &cancel,
            config: &config,
        };
        let err = engine.convert(&ctx).await.unwrap_err();
        assert!(matches!(err, ConvertError::Cancelled), "{err:?}");
        assert_eq!(engine.active(), 0, "transcode still running after cancel returned");
    }

    #[test]
    fn corrupt_input_is_invalid_input() {
        let mut bytes = png(10, 10);
        bytes.truncate(40);
        let err = transcode(&bytes, "png", &TransformParams::default(), LIMIT).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidInput { .. }), "{err:?}");
    }

    #[test]
    fn unregistered_target_is_rejected() {
        let err = transcode(&png(2, 2), "bmp", &TransformParams::default(), LIMIT).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedConversion { .. }));
    }

    #[test]
    fn allocation_limit_rejects_oversized_decode() {
        let err = transcode(&png(300, 300), "png", &TransformParams::default(), 1024).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidInput { .. }), "{err:?}");
    }
}
