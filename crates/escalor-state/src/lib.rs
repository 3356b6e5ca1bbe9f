//! Durable state for the Escalor engine.
//!
//! Holds everything that survives a process exit: the work queue, the
//! content-addressed result cache, the quota ledger, and the append-only
//! event log. All JSON snapshots go through a write-temp-then-rename
//! publish, so concurrent readers and interrupted writers never observe a
//! partial file.
//!
//! # Main types
//!
//! - [`DurableQueue`] — Crash-safe work queue persisted as `queue.json`.
//! - [`ContentStore`] — TTL result cache, one JSON file per fingerprint.
//! - [`QuotaLedger`] — Per-tier windowed admission ledger (`quota.json`).
//! - [`EventRecorder`] — Append-only JSONL event log (`events.jsonl`).
//! - [`ComplianceSummary`] — Aggregate view computed from recorded events.
//! - [`DataDirLock`] — Advisory lock pinning a data dir to one live process.

/// Atomic JSON file publish and strict reads.
pub mod atomic;
/// Content-addressed result cache with TTL eviction.
pub mod cache;
/// Append-only event log.
pub mod events;
/// Exclusive data-dir ownership.
pub mod lock;
/// Durable work queue.
pub mod queue;
/// Windowed quota admission ledger.
pub mod quota;
/// Compliance reporting over the event log.
pub mod report;

pub use atomic::{read_json, write_json_atomic};
pub use cache::{CacheEntry, ContentStore};
pub use events::{Event, EventKind, EventRecorder};
pub use lock::DataDirLock;
pub use queue::{DurableQueue, QueueCounts};
pub use quota::{QuotaLedger, QuotaWindow};
pub use report::{summarize, ComplianceSummary};
