//! Core types and error definitions for the Escalor engine.
//!
//! This crate provides the foundational types shared across all Escalor
//! crates: the unified error enum, work item and decision representations,
//! content fingerprinting, the tier catalog, and engine configuration.
//!
//! # Main types
//!
//! - [`EscalorError`] — Unified error enum for all Escalor subsystems.
//! - [`EscalorResult`] — Convenience alias for `Result<T, EscalorError>`.
//! - [`Fingerprint`] — Content-addressed identity of a unit of work.
//! - [`WorkItem`] — A single schedulable unit of work.
//! - [`Decision`] — A routing decision binding a work item to a tier.
//! - [`ExecutionRecord`] — The audited outcome of one execution attempt.
//! - [`TierCatalog`] — The validated set of configured executor tiers.

/// Engine configuration loaded from `escalor.toml`.
pub mod config;
/// Content fingerprinting for deduplication and caching.
pub mod fingerprint;
/// Capability traits for classification and tier execution.
pub mod handler;
/// Executor tier definitions and the tier catalog.
pub mod tier;
/// Work items, decisions, and execution records.
pub mod work;

pub use config::{ClassifierConfig, EngineConfig, QuotaConfig, RetryPolicy};
pub use fingerprint::Fingerprint;
pub use handler::{Classifier, HandlerOutcome, TierHandler};
pub use tier::{TierCatalog, TierSpec};
pub use work::{Decision, ExecOutcome, ExecutionRecord, WorkItem, WorkStatus};

// --- Error types ---

/// Top-level error type for the Escalor engine.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum EscalorError {
    /// The classification capability failed or returned unusable output.
    /// The engine never substitutes a guessed tier for a failed classification.
    #[error("Classification error: {0}")]
    Classification(String),

    /// Quota admission was denied on the requested tier and every fallback.
    #[error("Quota exhausted: {0}")]
    Quota(String),

    /// A tier handler could not be invoked, or failed terminally.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A structural workflow error (cycle, unknown dependency, unknown
    /// artifact, unknown run). Not retried.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Misuse of the durable queue (illegal status transition, cancelling a
    /// running item).
    #[error("Queue error: {0}")]
    Queue(String),

    /// A persisted state file exists but cannot be parsed. The engine
    /// refuses to fabricate fresh state over it.
    #[error("State error: {0}")]
    State(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`EscalorError`].
pub type EscalorResult<T> = Result<T, EscalorError>;
