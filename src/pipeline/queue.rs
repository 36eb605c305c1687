//! Job queue: bounded admission per resource class.
//!
//! ## Why fail fast
//!
//! Office and media engines are separate processes that each take a full core
//! and hundreds of MB. Queueing requests behind them only moves the overload
//! into memory and request latency, so admission is a non-blocking
//! `try_acquire`: if every permit of the class is taken, the request is
//! rejected with [`ConvertError::QueueSaturated`] and the caller retries later.
//!
//! A [`Permit`] is an RAII guard. It is held for the whole life of the job,
//! including the time the caller spends consuming a streamed output, and gives
//! its slot back exactly once when dropped.

use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Admission class of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    /// External process engines (office, media).
    Heavy,
    /// In-process engines (image).
    Light,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceClass::Heavy => "heavy",
            ResourceClass::Light => "light",
        })
    }
}

#[derive(Debug)]
struct Lane {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    limit: usize,
}

impl Lane {
    fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }
}

/// Per-class concurrency limiter.
#[derive(Debug)]
pub struct JobQueue {
    heavy: Lane,
    light: Lane,
}

impl JobQueue {
    /// Limits must be at least 1; [`crate::ConversionConfig`] validates this.
    pub fn new(heavy_limit: usize, light_limit: usize) -> Self {
        Self {
            heavy: Lane::new(heavy_limit.max(1)),
            light: Lane::new(light_limit.max(1)),
        }
    }

    fn lane(&self, class: ResourceClass) -> &Lane {
        match class {
            ResourceClass::Heavy => &self.heavy,
            ResourceClass::Light => &self.light,
        }
    }

    /// Take a slot in `class` without waiting.
    pub fn admit(&self, class: ResourceClass) -> Result<Permit, ConvertError> {
        let lane = self.lane(class);
        match lane.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let now = lane.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(%class, in_flight = now, limit = lane.limit, "Job admitted");
                Ok(Permit {
                    class,
                    in_flight: Arc::clone(&lane.in_flight),
                    _permit: permit,
                })
            }
            Err(_) => {
                let in_flight = lane.in_flight.load(Ordering::SeqCst);
                debug!(%class, in_flight, limit = lane.limit, "Queue saturated");
                Err(ConvertError::QueueSaturated {
                    class,
                    in_flight,
                    limit: lane.limit,
                })
            }
        }
    }

    /// Jobs of `class` currently holding a permit.
    pub fn in_flight(&self, class: ResourceClass) -> usize {
        self.lane(class).in_flight.load(Ordering::SeqCst)
    }

    pub fn limit(&self, class: ResourceClass) -> usize {
        self.lane(class).limit
    }
}

/// A held admission slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    class: ResourceClass,
    in_flight: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    /// Give the slot back now. Same as dropping the permit.
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        // The counter drops before the semaphore slot, so `in_flight` never
        // reads higher than the limit.
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_heavy_job_is_rejected_until_release() {
        let q = JobQueue::new(2, 8);
        let a = q.admit(ResourceClass::Heavy).unwrap();
        let _b = q.admit(ResourceClass::Heavy).unwrap();
        assert_eq!(q.in_flight(ResourceClass::Heavy), 2);

        match q.admit(ResourceClass::Heavy) {
            Err(ConvertError::QueueSaturated { class, in_flight, limit }) => {
                assert_eq!(class, ResourceClass::Heavy);
                assert_eq!(in_flight, 2);
                assert_eq!(limit, 2);
            }
            other => panic!("expected saturation, got {other:?}"),
        }

        a.release();
        assert_eq!(q.in_flight(ResourceClass::Heavy), 1);
        let _c = q.admit(ResourceClass::Heavy).unwrap();
        assert_eq!(q.in_flight(ResourceClass::Heavy), 2);
    }

    #[test]
    fn classes_are_independent() {
        let q = JobQueue::new(1, 1);
        let _h = q.admit(ResourceClass::Heavy).unwrap();
        assert!(q.admit(ResourceClass::Heavy).is_err());
        let l = q.admit(ResourceClass::Light).unwrap();
        assert_eq!(l.class(), ResourceClass::Light);
        assert_eq!(q.in_flight(ResourceClass::Light), 1);
    }

    #[test]
    fn drop_returns_slot() {
        let q = JobQueue::new(1, 1);
        {
            let _p = q.admit(ResourceClass::Light).unwrap();
            assert_eq!(q.in_flight(ResourceClass::Light), 1);
        }
        assert_eq!(q.in_flight(ResourceClass::Light), 0);
        assert!(q.admit(ResourceClass::Light).is_ok());
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        let q = JobQueue::new(0, 0);
        assert_eq!(q.limit(ResourceClass::Heavy), 1);
        assert!(q.admit(ResourceClass::Heavy).is_ok());
    }

    #[tokio::test]
    async fn permit_moves_into_task() {
        let q = Arc::new(JobQueue::new(1, 1));
        let p = q.admit(ResourceClass::Heavy).unwrap();
        let handle = tokio::spawn(async move {
            let _p = p;
            tokio::task::yield_now().await;
        });
        handle.await.unwrap();
        assert_eq!(q.in_flight(ResourceClass::Heavy), 0);
    }
}
