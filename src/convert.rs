//! The request pipeline.
//!
//! [`ConversionService`] is the single entry point every transport goes
//! through. For one request it does, in order:
//!
//! ```text
//! validate ──▶ classify ──▶ resolve target ──▶ registry lookup
//!     ──▶ admit ──▶ materialize ──▶ run ──▶ OutputStream
//! ```
//!
//! Everything up to the lookup is pure and cheap, so requests that will be
//! refused (empty, too large, unsupported) are refused before they take a
//! queue slot or touch the disk. From admission on, the job's scratch scope
//! and permit travel together and are released by whoever holds them last:
//! this function on error, the [`OutputStream`] on success.

use crate::config::ConversionConfig;
use crate::engine::{ConvertedOutput, Engines};
use crate::error::ConvertError;
use crate::job::{
    output_filename, ConversionForm, ConversionJob, ConversionRequest, TransformParams, UploadedFile,
};
use crate::output::{ConversionOutput, ConversionStats, InspectReport, WrittenOutput};
use crate::pipeline::classify::{classify, Classification, FileClass};
use crate::pipeline::input::{self, ResolvedInput};
use crate::pipeline::queue::JobQueue;
use crate::pipeline::registry::{content_type_for, default_target, normalize_target, EngineRegistry};
use crate::pipeline::runner::ConversionJobRunner;
use crate::pipeline::scratch::{ScratchLedger, ScratchScope};
use crate::stream::OutputStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Typed conversion options for path/URL inputs.
///
/// They are rendered into a [`ConversionForm`] so that every transport goes
/// through the same validation.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub target: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub upscale: bool,
}

/// Conversion service: registry, engines, job queue and scratch accounting.
///
/// Cheap to clone; clones share the queue, so limits hold across all of them.
#[derive(Clone)]
pub struct ConversionService {
    config: Arc<ConversionConfig>,
    registry: Arc<EngineRegistry>,
    queue: Arc<JobQueue>,
    runner: ConversionJobRunner,
    ledger: Arc<ScratchLedger>,
}

impl ConversionService {
    /// Service with the standard registry and the engines found on this host.
    pub fn new(config: ConversionConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ConversionConfig) -> ConversionServiceBuilder {
        ConversionServiceBuilder {
            config,
            registry: None,
            engines: None,
            ledger: None,
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn ledger(&self) -> &Arc<ScratchLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Run one request through the pipeline.
    ///
    /// On success the returned [`ConversionOutput::body`] owns the job's
    /// scratch scope and queue permit; they are released when it has been
    /// read to the end or dropped.
    ///
    /// # Errors
    /// - `InvalidRequest` for an empty or oversized upload, a malformed
    ///   target, a non-positive resize value, or undecodable input
    /// - `UnsupportedConversion` when no engine serves (class, target)
    /// - `QueueSaturated` when the resource class is full
    /// - `EngineTimeout` / `EngineFailure` / `Cancelled` from the engine run
    pub async fn convert(
        &self,
        form: ConversionForm,
        cancel: CancellationToken,
    ) -> Result<ConversionOutput, ConvertError> {
        let started = Instant::now();
        let len = form.bytes.len() as u64;
        debug!(
            filename = form.filename.as_deref().unwrap_or(""),
            len,
            target = form.target.as_deref().unwrap_or(""),
            "Request received"
        );

        // ── Step 1: Validate ─────────────────────────────────────────────
        if len == 0 {
            return Err(ConvertError::InvalidRequest("empty upload".into()));
        }
        if len > self.config.max_upload_bytes {
            return Err(ConvertError::UploadTooLarge {
                size: len,
                max: self.config.max_upload_bytes,
            });
        }
        let transform = TransformParams::parse(form.width.as_deref(), form.height.as_deref(), form.upscale)?;

        // ── Step 2: Classify ─────────────────────────────────────────────
        let classification = self.classify(&form.bytes, form.filename.as_deref(), form.declared_mime.as_deref());
        let class = classification.class;

        // ── Step 3: Resolve target and capability ────────────────────────
        let target = match form.target.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(raw) => normalize_target(raw)?,
            None => match default_target(class) {
                Some(t) => t.to_string(),
                None => {
                    return Err(ConvertError::UnsupportedConversion {
                        class,
                        target: String::new(),
                    })
                }
            },
        };
        let capability = self
            .registry
            .lookup(class, &target)
            .cloned()
            .ok_or_else(|| ConvertError::UnsupportedConversion {
                class,
                target: target.clone(),
            })?;

        // ── Step 4: Admit ────────────────────────────────────────────────
        let resource_class = capability.kind.resource_class();
        let permit = self.queue.admit(resource_class)?;

        // ── Step 5: Materialize ──────────────────────────────────────────
        let scope = Arc::new(ScratchScope::new(
            self.config.scratch_root.as_deref(),
            Arc::clone(&self.ledger),
        )?);
        let handle = scope.acquire_from_bytes(&classification.format, &form.bytes).await?;
        drop(form.bytes);

        let request = ConversionRequest {
            upload: UploadedFile {
                len,
                original_name: form.filename,
                declared_mime: form.declared_mime,
                handle,
            },
            classification: classification.clone(),
            target: target.clone(),
            transform,
        };
        let mut job = ConversionJob::new(request, capability);
        info!(
            job_id = %job.id,
            class = %class,
            format = %classification.format,
            target = %target,
            engine = %job.capability.kind,
            queue = %resource_class,
            "Job admitted"
        );
        self.runner.observer().on_job_admitted(&job.event());

        // ── Step 6: Run ──────────────────────────────────────────────────
        // On error `scope` and `permit` drop here: scratch drained, slot freed.
        let output = self.runner.run(&mut job, &scope, &cancel).await?;

        // The input is not needed any more; only the output travels on.
        scope.release(&job.request.upload.handle);

        let body = match output {
            ConvertedOutput::Bytes(bytes) => OutputStream::buffered(bytes, scope, permit),
            ConvertedOutput::File(handle) => {
                OutputStream::from_scratch_file(handle, scope, Some(permit)).await?
            }
        };

        let stats = ConversionStats {
            input_bytes: len,
            output_bytes: body.len(),
            engine: Some(job.capability.kind),
            resource_class: Some(resource_class),
            engine_duration_ms: job.engine_time().map(|d| d.as_millis() as u64).unwrap_or(0),
            total_duration_ms: started.elapsed().as_millis() as u64,
        };

        Ok(ConversionOutput {
            job_id: job.id,
            filename: output_filename(job.request.upload.original_name.as_deref(), &target),
            content_type: content_type_for(&target).to_string(),
            source: classification,
            target,
            stats,
            body,
        })
    }

    /// Convert a local path or HTTP(S) URL.
    pub async fn convert_file(
        &self,
        input: &str,
        options: &ConvertOptions,
        cancel: CancellationToken,
    ) -> Result<ConversionOutput, ConvertError> {
        let resolved = input::resolve_input(
            input,
            self.config.max_upload_bytes,
            self.config.download_timeout_secs,
        )
        .await?;
        self.convert(form_from(resolved, options), cancel).await
    }

    /// Convert and write the result to disk.
    ///
    /// `output` may be a file path, an existing directory (the output
    /// filename is used inside it), or `None` for the current directory.
    /// Uses atomic write (temp file + rename) to prevent partial files.
    pub async fn convert_to_file(
        &self,
        input: &str,
        options: &ConvertOptions,
        output: Option<&Path>,
        cancel: CancellationToken,
    ) -> Result<WrittenOutput, ConvertError> {
        let converted = self.convert_file(input, options, cancel).await?;
        let path = match output {
            Some(p) if p.is_dir() => input::output_path_in(Some(p), &converted.filename),
            Some(p) => p.to_path_buf(),
            None => input::output_path_in(None, &converted.filename),
        };
        let write_err = |source: std::io::Error| ConvertError::OutputWriteFailed {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let tmp_path = temp_path_for(&path, &converted.job_id.to_string());
        let ConversionOutput {
            job_id,
            content_type,
            mut stats,
            body,
            ..
        } = converted;

        let written = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            let n = body.write_to(&mut file).await?;
            file.sync_all().await?;
            Ok::<u64, std::io::Error>(n)
        }
        .await;
        let bytes_written = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(write_err(e));
            }
        };
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(write_err(e));
        }

        stats.output_bytes = Some(bytes_written);
        info!(job_id = %job_id, path = %path.display(), bytes = bytes_written, "Output written");
        Ok(WrittenOutput {
            job_id,
            path,
            content_type,
            bytes_written,
            stats,
        })
    }

    /// Classify an upload and list what it can be converted to. No engine runs.
    pub fn inspect(&self, bytes: &[u8], filename: Option<&str>, declared_mime: Option<&str>) -> InspectReport {
        let classification = self.classify(bytes, filename, declared_mime);
        let class = classification.class;
        let default = default_target(class);
        let engine = default
            .and_then(|t| self.registry.lookup(class, t))
            .map(|c| c.kind);
        let targets = if class == FileClass::Unknown {
            Vec::new()
        } else {
            self.registry
                .targets_for(class)
                .into_iter()
                .map(str::to_string)
                .collect()
        };
        InspectReport {
            len: bytes.len() as u64,
            classification,
            default_target: default.map(str::to_string),
            targets,
            engine,
        }
    }

    /// [`Self::inspect`] for a local path or URL.
    pub async fn inspect_file(&self, input: &str) -> Result<InspectReport, ConvertError> {
        let resolved = input::resolve_input(
            input,
            self.config.max_upload_bytes,
            self.config.download_timeout_secs,
        )
        .await?;
        Ok(self.inspect(
            &resolved.bytes,
            resolved.filename.as_deref(),
            resolved.declared_mime.as_deref(),
        ))
    }

    fn classify(&self, bytes: &[u8], filename: Option<&str>, declared_mime: Option<&str>) -> Classification {
        let head = &bytes[..bytes.len().min(self.config.sniff_len)];
        classify(head, filename, declared_mime)
    }
}

/// Builder for [`ConversionService`].
pub struct ConversionServiceBuilder {
    config: ConversionConfig,
    registry: Option<Arc<EngineRegistry>>,
    engines: Option<Engines>,
    ledger: Option<Arc<ScratchLedger>>,
}

impl ConversionServiceBuilder {
    /// Use a custom capability table instead of the global one.
    pub fn registry(mut self, registry: EngineRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Use these engines instead of discovering the real ones.
    pub fn engines(mut self, engines: Engines) -> Self {
        self.engines = Some(engines);
        self
    }

    /// Share scratch accounting with the caller.
    pub fn ledger(mut self, ledger: Arc<ScratchLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> ConversionService {
        let config = Arc::new(self.config);
        let registry = self.registry.unwrap_or_else(EngineRegistry::global);
        let engines = self.engines.unwrap_or_else(|| Engines::discover(&config));
        let queue = Arc::new(JobQueue::new(config.heavy_limit, config.light_limit));
        let runner = ConversionJobRunner::new(Arc::clone(&registry), engines, Arc::clone(&config));
        ConversionService {
            config,
            registry,
            queue,
            runner,
            ledger: self.ledger.unwrap_or_else(ScratchLedger::new),
        }
    }
}

fn form_from(resolved: ResolvedInput, options: &ConvertOptions) -> ConversionForm {
    ConversionForm {
        bytes: resolved.bytes,
        filename: resolved.filename,
        declared_mime: resolved.declared_mime,
        target: options.target.clone(),
        width: options.width.map(|w| w.to_string()),
        height: options.height.map(|h| h.to_string()),
        upscale: options.upscale,
    }
}

/// Hidden sibling of `path`, so the rename stays on one filesystem.
fn temp_path_for(path: &Path, unique: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!(".{name}.{unique}.tmp"))
}
