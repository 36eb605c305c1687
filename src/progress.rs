//! Observer trait for job lifecycle events.
//!
//! Inject an [`Arc<dyn JobObserver>`] via
//! [`crate::config::ConversionConfigBuilder::observer`] to hear about each job
//! as it is admitted, handed to its engine, and finished. The CLI uses this to
//! drive its progress bars; a server would forward events to metrics or logs.
//!
//! # Example
//!
//! ```rust
//! use edgequake_fileconv::{ConversionConfig, JobObserver, JobEvent};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingObserver {
//!     done: AtomicUsize,
//! }
//!
//! impl JobObserver for CountingObserver {
//!     fn on_job_complete(&self, job: &JobEvent, output_len: Option<u64>) {
//!         self.done.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{} done ({:?} bytes)", job.filename, output_len);
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .observer(Arc::new(CountingObserver { done: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::error::ErrorKind;
use crate::pipeline::classify::FileClass;
use crate::pipeline::registry::ConverterKind;
use std::sync::Arc;
use uuid::Uuid;

/// Identity of the job an event refers to.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: Uuid,
    /// Original (untrusted) upload name, for display only.
    pub filename: String,
    pub source: FileClass,
    pub target: String,
    pub engine: ConverterKind,
}

/// Called by the pipeline as a job moves through its states.
///
/// Implementations must be `Send + Sync`: jobs run concurrently on the tokio
/// runtime and events for different jobs can interleave. All methods default
/// to no-ops so callers only override what they care about.
pub trait JobObserver: Send + Sync {
    /// The job got a queue permit.
    fn on_job_admitted(&self, job: &JobEvent) {
        let _ = job;
    }

    /// The engine is about to be invoked.
    fn on_engine_start(&self, job: &JobEvent) {
        let _ = job;
    }

    /// The engine produced output. `output_len` is known for buffered outputs.
    fn on_job_complete(&self, job: &JobEvent, output_len: Option<u64>) {
        let _ = (job, output_len);
    }

    /// The job failed or was cancelled. `message` is already sanitized.
    fn on_job_failed(&self, job: &JobEvent, kind: ErrorKind, message: &str) {
        let _ = (job, kind, message);
    }
}

/// Observer that ignores everything. Used when none is configured.
pub struct NoopJobObserver;

impl JobObserver for NoopJobObserver {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ObserverHandle = Arc<dyn JobObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn event() -> JobEvent {
        JobEvent {
            job_id: Uuid::new_v4(),
            filename: "report.docx".into(),
            source: FileClass::OfficeDocument,
            target: "pdf".into(),
            engine: ConverterKind::Office,
        }
    }

    #[derive(Default)]
    struct Tracking {
        admitted: AtomicUsize,
        started: AtomicUsize,
        completed: AtomicUsize,
        failures: Mutex<Vec<ErrorKind>>,
    }

    impl JobObserver for Tracking {
        fn on_job_admitted(&self, _job: &JobEvent) {
            self.admitted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_engine_start(&self, _job: &JobEvent) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_complete(&self, _job: &JobEvent, _output_len: Option<u64>) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_failed(&self, _job: &JobEvent, kind: ErrorKind, _message: &str) {
            self.failures.lock().unwrap().push(kind);
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let o = NoopJobObserver;
        let e = event();
        o.on_job_admitted(&e);
        o.on_engine_start(&e);
        o.on_job_complete(&e, Some(10));
        o.on_job_failed(&e, ErrorKind::EngineTimeout, "soffice timed out");
    }

    #[test]
    fn tracking_observer_receives_events() {
        let t = Tracking::default();
        let e = event();
        t.on_job_admitted(&e);
        t.on_engine_start(&e);
        t.on_job_complete(&e, None);
        t.on_job_admitted(&e);
        t.on_engine_start(&e);
        t.on_job_failed(&e, ErrorKind::EngineFailure, "exit status 1");

        assert_eq!(t.admitted.load(Ordering::SeqCst), 2);
        assert_eq!(t.started.load(Ordering::SeqCst), 2);
        assert_eq!(t.completed.load(Ordering::SeqCst), 1);
        assert_eq!(*t.failures.lock().unwrap(), vec![ErrorKind::EngineFailure]);
    }

    #[test]
    fn arc_dyn_observer_works() {
        let o: ObserverHandle = Arc::new(NoopJobObserver);
        o.on_job_admitted(&event());
    }
}
