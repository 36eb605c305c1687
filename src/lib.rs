//! # edgequake-fileconv
//!
//! A managed file-conversion pipeline: office documents through LibreOffice,
//! images through the `image` crate, audio and video through FFmpeg.
//!
//! ## Why this crate?
//!
//! Calling `soffice` or `ffmpeg` is one line. Calling them from a service that
//! takes uploads from strangers is not: uploads lie about their type, engines
//! hang, two LibreOffice instances fight over one profile, temp files pile up
//! on every error path, and twenty concurrent transcodes take the host down.
//! This crate is the orchestration around the engines: it decides what a file
//! is from its bytes, refuses unsupported work before any engine runs, bounds
//! concurrency, enforces timeouts, and guarantees scratch cleanup on every
//! exit path.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Validate  non-empty, under the size bound, resize values positive
//!  ├─ 2. Classify  magic bytes → office document / image / audio-video
//!  ├─ 3. Lookup    (class, target) in the engine registry, else 415
//!  ├─ 4. Admit     heavy (office, media) or light (image) slot, else 503
//!  ├─ 5. Run       engine with timeout + cancellation, in a scratch scope
//!  └─ 6. Deliver   streamed body; scope and permit released when consumed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_fileconv::{ConversionConfig, ConversionForm, ConversionService};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ConversionService::new(ConversionConfig::default());
//!     let form = ConversionForm::new(std::fs::read("report.docx")?)
//!         .filename("report.docx")
//!         .target("pdf");
//!     let output = service.convert(form, CancellationToken::new()).await?;
//!     eprintln!("{} ({})", output.filename, output.content_type);
//!     let pdf = output.into_bytes().await?;
//!     std::fs::write("report.pdf", pdf)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `fileconv` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-fileconv = { version = "0.1", default-features = false }
//! ```
//!
//! ## Engines
//!
//! | Class | Engine | Targets |
//! |-------|--------|---------|
//! | Office document | `soffice` | pdf docx doc odt rtf txt html xlsx xls ods csv pptx ppt odp |
//! | Image | in-process | png jpg jpeg webp tiff gif avif |
//! | Audio/video | `ffmpeg` | mp3 wav ogg opus flac aac m4a mp4 webm mkv mov avi |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionConfig, ConversionConfigBuilder};
pub use convert::{ConversionService, ConversionServiceBuilder, ConvertOptions};
pub use engine::{ConvertedOutput, Converter, EngineContext, Engines};
pub use error::{ConvertError, ErrorBody, ErrorKind};
pub use job::{ConversionForm, ConversionJob, JobStatus, TransformParams};
pub use output::{ConversionOutput, ConversionStats, InspectReport, WrittenOutput};
pub use pipeline::classify::{Classification, DetectionSource, FileClass};
pub use pipeline::queue::{JobQueue, Permit, ResourceClass};
pub use pipeline::registry::{Capability, ConverterKind, EngineRegistry};
pub use pipeline::scratch::{ScratchHandle, ScratchLedger, ScratchScope};
pub use progress::{JobEvent, JobObserver, NoopJobObserver};
pub use stream::OutputStream;
pub use tokio_util::sync::CancellationToken;
