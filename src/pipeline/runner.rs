//! Conversion job runner: one admitted job, one engine call.
//!
//! The runner is the boundary between the pipeline and the engines. It
//! re-checks the capability, drives the job's state machine, tells the
//! observer what happened, and makes sure that whatever an engine reports,
//! the caller only sees a sanitized, bounded diagnostic.

use crate::config::ConversionConfig;
use crate::engine::{ConvertedOutput, EngineContext, Engines};
use crate::error::{sanitize_diagnostic, ConvertError};
use crate::job::{ConversionJob, JobStatus};
use crate::pipeline::registry::EngineRegistry;
use crate::pipeline::scratch::ScratchScope;
use crate::progress::{NoopJobObserver, ObserverHandle};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs admitted jobs against the configured engines.
#[derive(Clone)]
pub struct ConversionJobRunner {
    registry: Arc<EngineRegistry>,
    engines: Engines,
    config: Arc<ConversionConfig>,
    observer: ObserverHandle,
}

impl ConversionJobRunner {
    pub fn new(registry: Arc<EngineRegistry>, engines: Engines, config: Arc<ConversionConfig>) -> Self {
        let observer = config
            .observer
            .clone()
            .unwrap_or_else(|| Arc::new(NoopJobObserver));
        Self {
            registry,
            engines,
            config,
            observer,
        }
    }

    pub fn observer(&self) -> &ObserverHandle {
        &self.observer
    }

    /// Run `job` to a terminal state.
    ///
    /// All scratch paths the engine uses come from `scope`. On return the job
    /// is `Succeeded`, `Failed(kind)` or `Cancelled`.
    pub async fn run(
        &self,
        job: &mut ConversionJob,
        scope: &ScratchScope,
        cancel: &CancellationToken,
    ) -> Result<ConvertedOutput, ConvertError> {
        let result = self.run_inner(job, scope, cancel).await;
        let event = job.event();

        match &result {
            Ok(output) => {
                job.succeed();
                let len = output_len(output).await;
                info!(
                    job_id = %job.id,
                    engine = %job.capability.kind,
                    target = %job.request.target,
                    output_bytes = ?len,
                    elapsed_ms = job.elapsed().as_millis() as u64,
                    "Job succeeded"
                );
                self.observer.on_job_complete(&event, len);
            }
            Err(e) => {
                job.fail(e);
                let body = e.to_body();
                if job.status() == JobStatus::Cancelled {
                    info!(job_id = %job.id, "Job cancelled");
                } else {
                    warn!(job_id = %job.id, engine = %job.capability.kind, error = %e, "Job failed");
                }
                self.observer.on_job_failed(&event, body.error, &body.message);
            }
        }
        result
    }

    async fn run_inner(
        &self,
        job: &mut ConversionJob,
        scope: &ScratchScope,
        cancel: &CancellationToken,
    ) -> Result<ConvertedOutput, ConvertError> {
        let class = job.request.classification.class;
        let target = job.request.target.clone();

        // The pipeline already looked this up; a job built by hand may not have.
        let registered = self
            .registry
            .lookup(class, &target)
            .is_some_and(|c| c.kind == job.capability.kind);
        if !registered || job.capability.source != class || !job.capability.supports(&target) {
            return Err(ConvertError::UnsupportedConversion { class, target });
        }
        if cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }

        let engine = self.engines.for_kind(job.capability.kind);
        job.start();
        info!(
            job_id = %job.id,
            engine = engine.name(),
            class = %class,
            target = %target,
            input_bytes = job.request.upload.len,
            "Engine started"
        );
        self.observer.on_engine_start(&job.event());

        let ctx = EngineContext {
            job_id: job.id,
            input: &job.request.upload,
            classification: &job.request.classification,
            target: &target,
            transform: &job.request.transform,
            scope,
            cancel,
            config: &self.config,
        };
        engine
            .convert(&ctx)
            .await
            .map_err(|e| sanitize_error(e, scope.path(), self.config.max_diagnostic_bytes))
    }
}

/// Engines are expected to sanitize, but the runner does not rely on it.
fn sanitize_error(err: ConvertError, scratch_root: &Path, max_bytes: usize) -> ConvertError {
    match err {
        ConvertError::EngineFailure { engine, detail } => ConvertError::EngineFailure {
            engine,
            detail: sanitize_diagnostic(&detail, Some(scratch_root), max_bytes),
        },
        ConvertError::InvalidInput { detail } => ConvertError::InvalidInput {
            detail: sanitize_diagnostic(&detail, Some(scratch_root), max_bytes),
        },
        ConvertError::Internal(detail) => {
            ConvertError::Internal(sanitize_diagnostic(&detail, Some(scratch_root), max_bytes))
        }
        other => other,
    }
}

async fn output_len(output: &ConvertedOutput) -> Option<u64> {
    match output {
        ConvertedOutput::Bytes(b) => Some(b.len() as u64),
        ConvertedOutput::File(h) => tokio::fs::metadata(h.path()).await.ok().map(|m| m.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Converter;
    use crate::error::ErrorKind;
    use crate::job::{ConversionRequest, TransformParams, UploadedFile};
    use crate::pipeline::classify::{Classification, DetectionSource, FileClass};
    use crate::pipeline::registry::{Capability, ConverterKind};
    use crate::pipeline::scratch::ScratchLedger;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fake {
        kind: ConverterKind,
        calls: AtomicUsize,
        fail_with: Option<String>,
    }

    impl Fake {
        fn new(kind: ConverterKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
                fail_with: None,
            })
        }

        fn failing(kind: ConverterKind, msg: &str) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
                fail_with: Some(msg.to_string()),
            })
        }
    }

    #[async_trait]
    impl Converter for Fake {
        fn kind(&self) -> ConverterKind {
            self.kind
        }

        fn name(&self) -> &str {
            "fake"
        }

        async fn convert(&self, ctx: &EngineContext<'_>) -> Result<ConvertedOutput, ConvertError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(msg) => Err(ConvertError::EngineFailure {
                    engine: "fake".into(),
                    detail: format!("{msg} {}", ctx.input.handle.path().display()),
                }),
                None => Ok(ConvertedOutput::Bytes(Bytes::from_static(b"ok"))),
            }
        }
    }

    struct Setup {
        _root: tempfile::TempDir,
        scope: ScratchScope,
        runner: ConversionJobRunner,
    }

    fn setup(engine: Arc<Fake>) -> Setup {
        let root = tempfile::tempdir().unwrap();
        let scope = ScratchScope::new(Some(root.path()), ScratchLedger::new()).unwrap();
        let engines = Engines::new(engine.clone(), engine.clone(), engine);
        let config = ConversionConfig::builder().max_diagnostic_bytes(64).build().unwrap();
        let runner = ConversionJobRunner::new(
            Arc::new(EngineRegistry::standard()),
            engines,
            Arc::new(config),
        );
        Setup {
            _root: root,
            scope,
            runner,
        }
    }

    fn job(scope: &ScratchScope, class: FileClass, target: &str, cap: Capability) -> ConversionJob {
        let handle = scope.acquire("in").unwrap();
        ConversionJob::new(
            ConversionRequest {
                upload: UploadedFile {
                    len: 2,
                    original_name: None,
                    declared_mime: None,
                    handle,
                },
                classification: Classification {
                    class,
                    format: "x".into(),
                    mime: "application/octet-stream".into(),
                    source: DetectionSource::Signature,
                },
                target: target.into(),
                transform: TransformParams::default(),
            },
            cap,
        )
    }

    fn image_cap() -> Capability {
        EngineRegistry::global()
            .lookup(FileClass::Image, "png")
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn success_marks_job_succeeded() {
        let fake = Fake::new(ConverterKind::Image);
        let s = setup(fake.clone());
        let mut j = job(&s.scope, FileClass::Image, "png", image_cap());
        let out = s.runner.run(&mut j, &s.scope, &CancellationToken::new()).await.unwrap();
        assert!(matches!(out, ConvertedOutput::Bytes(ref b) if b.as_ref() == b"ok"));
        assert_eq!(j.status(), JobStatus::Succeeded);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forged_capability_never_reaches_engine() {
        let fake = Fake::new(ConverterKind::Image);
        let s = setup(fake.clone());
        let forged = Capability {
            kind: ConverterKind::Image,
            source: FileClass::Image,
            targets: vec!["bmp".into()],
        };
        let mut j = job(&s.scope, FileClass::Image, "bmp", forged);
        let err = s.runner.run(&mut j, &s.scope, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedConversion);
        assert_eq!(j.status(), JobStatus::Failed(ErrorKind::UnsupportedConversion));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn engine_diagnostics_are_sanitized() {
        let fake = Fake::failing(ConverterKind::Image, &"noise ".repeat(50));
        let s = setup(fake);
        let mut j = job(&s.scope, FileClass::Image, "png", image_cap());
        let err = s.runner.run(&mut j, &s.scope, &CancellationToken::new()).await.unwrap_err();
        match err {
            ConvertError::EngineFailure { detail, .. } => {
                assert!(!detail.contains(&*s.scope.path().to_string_lossy()), "{detail}");
                assert!(detail.contains("<scratch>"), "{detail}");
                assert!(detail.len() <= 64 + '\u{2026}'.len_utf8());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(j.status(), JobStatus::Failed(ErrorKind::EngineFailure));
    }

    #[tokio::test]
    async fn pre_cancelled_job_is_cancelled() {
        let fake = Fake::new(ConverterKind::Image);
        let s = setup(fake.clone());
        let mut j = job(&s.scope, FileClass::Image, "png", image_cap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = s.runner.run(&mut j, &s.scope, &cancel).await.unwrap_err();
        assert!(matches!(err, ConvertError::Cancelled));
        assert_eq!(j.status(), JobStatus::Cancelled);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }
}
