//! Conversion engines.
//!
//! Every engine implements [`Converter`]. The runner hands it an
//! [`EngineContext`] (the job's input handle, target, transform, scratch scope,
//! cancellation token and config), and the engine returns either an in-memory
//! buffer or a scratch file handle that the caller streams out.
//!
//! | Engine | Kind | Runs as |
//! |--------|------|---------|
//! | [`office::OfficeEngine`] | `Office` | `soffice --headless --convert-to` subprocess |
//! | [`image::ImageEngine`]   | `Image`  | `image` crate on the blocking pool |
//! | [`media::MediaEngine`]   | `Media`  | `ffmpeg` subprocess |
//!
//! Engines never create files on their own: every path they touch comes from
//! the scope, so the scope's drain removes everything they left behind.

pub mod command;
pub mod image;
pub mod media;
pub mod office;
pub mod tools;

use crate::config::ConversionConfig;
use crate::error::ConvertError;
use crate::job::{TransformParams, UploadedFile};
use crate::pipeline::classify::Classification;
use crate::pipeline::registry::ConverterKind;
use crate::pipeline::scratch::{ScratchHandle, ScratchScope};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use self::image::ImageEngine;
use self::media::MediaEngine;
use self::office::OfficeEngine;
use self::tools::EngineTools;

/// Everything an engine may use for one job.
pub struct EngineContext<'a> {
    pub job_id: Uuid,
    pub input: &'a UploadedFile,
    pub classification: &'a Classification,
    /// Normalized target format.
    pub target: &'a str,
    pub transform: &'a TransformParams,
    pub scope: &'a ScratchScope,
    pub cancel: &'a CancellationToken,
    pub config: &'a ConversionConfig,
}

/// What an engine produced.
#[derive(Debug)]
pub enum ConvertedOutput {
    /// Fully in memory.
    Bytes(Bytes),
    /// A scratch file owned by the job's scope; streamed out by the caller.
    File(ScratchHandle),
}

/// A conversion engine.
#[async_trait]
pub trait Converter: Send + Sync {
    fn kind(&self) -> ConverterKind;

    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    async fn convert(&self, ctx: &EngineContext<'_>) -> Result<ConvertedOutput, ConvertError>;
}

/// One engine per [`ConverterKind`].
#[derive(Clone)]
pub struct Engines {
    office: Arc<dyn Converter>,
    image: Arc<dyn Converter>,
    media: Arc<dyn Converter>,
}

impl Engines {
    /// The real engines, with binaries resolved from `config`.
    pub fn discover(config: &ConversionConfig) -> Self {
        let tools = EngineTools::discover(config);
        Self {
            office: Arc::new(OfficeEngine::new(tools.soffice)),
            image: Arc::new(ImageEngine::new()),
            media: Arc::new(MediaEngine::new(tools.ffmpeg)),
        }
    }

    pub fn new(
        office: Arc<dyn Converter>,
        image: Arc<dyn Converter>,
        media: Arc<dyn Converter>,
    ) -> Self {
        Self {
            office,
            image,
            media,
        }
    }

    pub fn with_office(mut self, engine: Arc<dyn Converter>) -> Self {
        self.office = engine;
        self
    }

    pub fn with_image(mut self, engine: Arc<dyn Converter>) -> Self {
        self.image = engine;
        self
    }

    pub fn with_media(mut self, engine: Arc<dyn Converter>) -> Self {
        self.media = engine;
        self
    }

    pub fn for_kind(&self, kind: ConverterKind) -> &Arc<dyn Converter> {
        match kind {
            ConverterKind::Office => &self.office,
            ConverterKind::Image => &self.image,
            ConverterKind::Media => &self.media,
        }
    }
}

impl fmt::Debug for Engines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engines")
            .field("office", &self.office.name())
            .field("image", &self.image.name())
            .field("media", &self.media.name())
            .finish()
    }
}
