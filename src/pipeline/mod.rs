//! Pipeline stages for a conversion request.
//!
//! Each submodule owns one concern. The stages are pure or hold only
//! process-wide read-mostly state, so each is testable on its own and the
//! request pipeline in [`crate::convert`] just wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! bytes ──▶ classify ──▶ registry ──▶ queue ──▶ scratch ──▶ runner ──▶ output
//!           (sniff)      (lookup)     (admit)   (materialize) (engine)
//! ```
//!
//! 1. [`classify`] — magic-byte sniffing with narrow extension and MIME fallbacks
//! 2. [`registry`] — (class, target) → capability; rejects unsupported pairs
//! 3. [`queue`]    — fail-fast admission per resource class
//! 4. [`scratch`]  — per-request scratch scope with exactly-once release
//! 5. [`runner`]   — drives one job through its engine and state machine
//!
//! [`input`] sits outside the request path: it turns a path or URL into
//! upload bytes for the CLI and the file-based entry points.

pub mod classify;
pub mod input;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod scratch;
