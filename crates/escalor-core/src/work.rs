use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Status of a work item in the durable queue.
///
/// Transitions are monotonic: `Pending → Running → {Done, Failed}`,
/// `Pending → Cancelled`, and `Pending → Failed` for an item denied
/// admission across its whole fallback chain. The single sanctioned
/// regression is `Running → Pending` during crash recovery, which the
/// queue performs through a dedicated path rather than
/// [`WorkStatus::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl WorkStatus {
    /// Whether this status is terminal (the item is retired).
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Done | WorkStatus::Failed | WorkStatus::Cancelled)
    }

    /// Whether a transition to `next` is legal in normal operation.
    pub fn can_transition(self, next: WorkStatus) -> bool {
        matches!(
            (self, next),
            (WorkStatus::Pending, WorkStatus::Running)
                | (WorkStatus::Pending, WorkStatus::Cancelled)
                | (WorkStatus::Pending, WorkStatus::Failed)
                | (WorkStatus::Running, WorkStatus::Done)
                | (WorkStatus::Running, WorkStatus::Failed)
        )
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkStatus::Pending => write!(f, "pending"),
            WorkStatus::Running => write!(f, "running"),
            WorkStatus::Done => write!(f, "done"),
            WorkStatus::Failed => write!(f, "failed"),
            WorkStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single schedulable unit of work.
///
/// Identified by its [`Fingerprint`]; two items with equal fingerprints are
/// the same unit of work, and at most one of them may be running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Content-addressed identity (also the deduplication key).
    pub id: Fingerprint,
    /// The request text handed to the tier handler.
    pub payload: String,
    /// Tier this item was routed to.
    pub required_tier: String,
    pub created_at: DateTime<Utc>,
    /// Fingerprints of items that must be `Done` before this one runs.
    #[serde(default)]
    pub depends_on: BTreeSet<Fingerprint>,
    pub status: WorkStatus,
}

impl WorkItem {
    /// Create a pending work item, computing its fingerprint from the
    /// payload and tier.
    pub fn new(payload: impl Into<String>, required_tier: impl Into<String>) -> Self {
        let payload = payload.into();
        let required_tier = required_tier.into();
        Self {
            id: Fingerprint::compute(&payload, &required_tier),
            payload,
            required_tier,
            created_at: Utc::now(),
            depends_on: BTreeSet::new(),
            status: WorkStatus::Pending,
        }
    }

    pub fn with_depends_on(mut self, deps: BTreeSet<Fingerprint>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Whether this item is pending with all dependencies completed.
    pub fn is_ready(&self, done: &BTreeSet<Fingerprint>) -> bool {
        self.status == WorkStatus::Pending && self.depends_on.iter().all(|dep| done.contains(dep))
    }
}

/// A routing decision binding a request to a tier.
///
/// Immutable once produced; the enforcer carries it through execution so the
/// audit trail can compare the decided tier against the tier that actually
/// ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// The tier the request should execute on.
    pub tier: String,
    /// Classifier confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    /// Human-readable reason for the decision.
    pub rationale: String,
    /// Whether this decision was (or is being) enforced rather than merely
    /// surfaced.
    #[serde(default)]
    pub enforced: bool,
}

impl Decision {
    pub fn new(tier: impl Into<String>, confidence: f32, rationale: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            confidence,
            rationale: rationale.into(),
            enforced: false,
        }
    }

    /// A decision produced by an explicit operator override.
    pub fn overridden(tier: impl Into<String>) -> Self {
        Self::new(tier, 1.0, "explicit override")
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOutcome {
    Success,
    Timeout,
    Error,
    /// The attempt was abandoned on this tier and the work escalated to the
    /// next-higher tier.
    Escalated,
}

/// The audited outcome of one execution attempt.
///
/// Append-only: every attempt (including retries and escalations) produces
/// its own record, totally ordered per work item by `attempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Fingerprint of the work item this attempt belongs to.
    pub work_item: Fingerprint,
    /// Tier the attempt ran on (may differ from the decided tier after
    /// fallback or escalation).
    pub tier: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Process exit status, when the handler ran to completion.
    pub exit_status: Option<i32>,
    /// Zero-based attempt counter across retries and escalation.
    pub attempt: u32,
    pub outcome: ExecOutcome,
    /// Set when the record was synthesized from a cache hit and no handler
    /// was invoked.
    #[serde(default)]
    pub from_cache: bool,
}

impl ExecutionRecord {
    /// A record synthesized for a cache hit: zero-duration, no exit status,
    /// no quota consumed.
    pub fn cache_hit(work_item: Fingerprint, tier: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            work_item,
            tier: tier.into(),
            started_at: now,
            ended_at: now,
            exit_status: None,
            attempt: 0,
            outcome: ExecOutcome::Success,
            from_cache: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExecOutcome::Success
    }

    /// Compliance check: did the work execute on the tier the decision
    /// named?
    pub fn matches_decision(&self, decision: &Decision) -> bool {
        self.tier == decision.tier
    }

    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}
