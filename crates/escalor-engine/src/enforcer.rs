//! The decision enforcement pipeline.
//!
//! [`DecisionEnforcer::enforce`] carries one work item from routing
//! decision to terminal status: cache lookup, quota admission (walking
//! the configured fallback chain), bounded execution, retry with
//! exponential backoff, and a single escalation to the next-higher
//! tier once retries are exhausted. Every decision and outcome is
//! written to the event log before the call returns.
//!
//! Concurrent enforcement of the same fingerprint is deduplicated
//! in-process: the first caller executes, later callers wait and
//! receive the same execution record.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use escalor_core::{
    Decision, EscalorError, EscalorResult, ExecOutcome, ExecutionRecord, Fingerprint, RetryPolicy,
    TierCatalog, TierHandler, TierSpec, WorkItem, WorkStatus,
};
use escalor_state::{
    CacheEntry, ContentStore, DataDirLock, DurableQueue, EventKind, EventRecorder, QuotaLedger,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Shared handles to the durable state layer.
///
/// Encodes the standard layout under one data directory: `queue.json`,
/// `cache/`, `quota.json` and `events.jsonl`. The handles own the
/// directory's [`DataDirLock`] for as long as any clone is alive.
#[derive(Clone, Debug)]
pub struct StateHandles {
    pub queue: Arc<DurableQueue>,
    pub cache: Arc<ContentStore>,
    pub quota: Arc<QuotaLedger>,
    pub events: Arc<EventRecorder>,
    _lock: Arc<DataDirLock>,
}

impl StateHandles {
    /// Open every state component under `data_dir`, creating files and
    /// directories as needed and recovering orphaned queue items.
    ///
    /// The data dir is locked exclusively first: a second live process
    /// (or a second set of handles in this one) is refused with a
    /// [`EscalorError::State`] until the holder drops. The lock is what
    /// makes the `Running` recovery in [`DurableQueue::open`] sound.
    pub async fn open(data_dir: &Path, quota_window_secs: u64) -> EscalorResult<Self> {
        let lock = Arc::new(DataDirLock::acquire(data_dir)?);
        Ok(Self {
            queue: Arc::new(DurableQueue::open(data_dir.join("queue.json")).await?),
            cache: Arc::new(ContentStore::open(data_dir.join("cache")).await?),
            quota: Arc::new(
                QuotaLedger::open(data_dir.join("quota.json"), quota_window_secs).await?,
            ),
            events: Arc::new(EventRecorder::open(data_dir.join("events.jsonl")).await?),
            _lock: lock,
        })
    }
}

type InFlightMap = HashMap<Fingerprint, watch::Receiver<Option<ExecutionRecord>>>;

/// One finished handler invocation, before it is judged terminal.
struct Attempt {
    record: ExecutionRecord,
    stdout: Option<String>,
    error: Option<String>,
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// Wait on an in-flight execution. `None` means the holder gave up
/// without publishing a record.
async fn wait_for_record(
    mut rx: watch::Receiver<Option<ExecutionRecord>>,
) -> Option<ExecutionRecord> {
    if let Some(record) = rx.borrow().clone() {
        return Some(record);
    }
    while rx.changed().await.is_ok() {
        if let Some(record) = rx.borrow().clone() {
            return Some(record);
        }
    }
    None
}

/// Enforces routing decisions through the tiered execution pipeline.
pub struct DecisionEnforcer {
    catalog: TierCatalog,
    retry: RetryPolicy,
    cache_ttl_secs: u64,
    state: StateHandles,
    handler: Arc<dyn TierHandler>,
    in_flight: Mutex<InFlightMap>,
}

impl DecisionEnforcer {
    pub fn new(
        catalog: TierCatalog,
        retry: RetryPolicy,
        cache_ttl_secs: u64,
        state: StateHandles,
        handler: Arc<dyn TierHandler>,
    ) -> Self {
        Self {
            catalog,
            retry,
            cache_ttl_secs,
            state,
            handler,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// Enforce a routing decision for one work item.
    ///
    /// Returns the terminal [`ExecutionRecord`] — which may describe a
    /// failure; callers distinguish via [`ExecutionRecord::is_success`].
    /// Errors are reserved for conditions where nothing ran: quota
    /// exhausted across the whole fallback chain (which also fails the
    /// item), state corruption, or queue misuse.
    pub async fn enforce(
        &self,
        item: &WorkItem,
        decision: &Decision,
    ) -> EscalorResult<ExecutionRecord> {
        let fingerprint = item.id.clone();

        // At most one execution per fingerprint inside this process: the
        // first caller takes the slot, later callers wait for its record.
        let publish = loop {
            let rx = {
                let mut in_flight = self.in_flight.lock().await;
                match in_flight.get(&fingerprint) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(fingerprint.clone(), rx);
                        break tx;
                    }
                }
            };
            debug!(fingerprint = %fingerprint.short(), "joining in-flight execution");
            if let Some(record) = wait_for_record(rx).await {
                return Ok(record);
            }
            // The holder failed without a record; contend for the slot.
        };

        let result = self.enforce_inner(item, decision).await;

        if let Ok(record) = &result {
            let _ = publish.send(Some(record.clone()));
        }
        self.in_flight.lock().await.remove(&fingerprint);
        drop(publish);

        result
    }

    async fn enforce_inner(
        &self,
        item: &WorkItem,
        decision: &Decision,
    ) -> EscalorResult<ExecutionRecord> {
        let fingerprint = item.id.clone();

        let mut enforced = decision.clone();
        enforced.enforced = true;
        self.state
            .events
            .record(EventKind::DecisionMade {
                fingerprint: fingerprint.clone(),
                decision: enforced,
            })
            .await?;

        self.state.queue.enqueue(item.clone()).await?;
        if let Some(existing) = self.state.queue.get(&fingerprint).await {
            if existing.status == WorkStatus::Running {
                return Err(EscalorError::Queue(format!(
                    "work item {} is already marked running",
                    fingerprint.short()
                )));
            }
        }

        // Cache lookup: an unexpired result retires the item without
        // consuming quota or touching a handler.
        if self.state.cache.get(&fingerprint).await?.is_some() {
            info!(fingerprint = %fingerprint.short(), "serving from cache");
            self.state
                .events
                .record(EventKind::CacheHit {
                    fingerprint: fingerprint.clone(),
                    tier: decision.tier.clone(),
                })
                .await?;
            let record = ExecutionRecord::cache_hit(fingerprint.clone(), decision.tier.clone());
            self.state.queue.mark_running(&fingerprint).await?;
            self.state.queue.mark_done(&fingerprint).await?;
            self.state
                .events
                .record(EventKind::ExecutionFinished {
                    record: record.clone(),
                    error: None,
                })
                .await?;
            return Ok(record);
        }

        // Quota admission, walking the configured fallback chain. Each
        // hop is recorded as an escalation so the audit trail shows why
        // the work left its decided tier.
        let chain = self.catalog.fallback_chain(&decision.tier);
        if chain.is_empty() {
            return Err(EscalorError::Config(format!(
                "decision names unknown tier '{}'",
                decision.tier
            )));
        }

        let mut admitted: Option<&TierSpec> = None;
        for (idx, tier) in chain.iter().copied().enumerate() {
            if self.state.quota.try_consume(tier).await? {
                if idx > 0 {
                    info!(
                        decided = %decision.tier,
                        admitted = %tier.name,
                        "tier admitted after quota fallback"
                    );
                }
                admitted = Some(tier);
                break;
            }

            warn!(tier = %tier.name, fingerprint = %fingerprint.short(), "quota denied");
            self.state
                .events
                .record(EventKind::QuotaDenied {
                    fingerprint: fingerprint.clone(),
                    tier: tier.name.clone(),
                })
                .await?;
            if let Some(next) = chain.get(idx + 1) {
                self.state
                    .events
                    .record(EventKind::Escalated {
                        fingerprint: fingerprint.clone(),
                        from_tier: tier.name.clone(),
                        to_tier: next.name.clone(),
                    })
                    .await?;
            }
        }

        // Denied on every tier in the chain: the item fails terminally
        // with a no-run record, and the quota error still reaches the
        // caller.
        let Some(admitted) = admitted else {
            let now = Utc::now();
            let record = ExecutionRecord {
                work_item: fingerprint.clone(),
                tier: decision.tier.clone(),
                started_at: now,
                ended_at: now,
                exit_status: None,
                attempt: 0,
                outcome: ExecOutcome::Error,
                from_cache: false,
            };
            self.state
                .events
                .record(EventKind::ExecutionFinished {
                    record,
                    error: Some("quota-exhausted".to_string()),
                })
                .await?;
            self.state.queue.mark_failed(&fingerprint).await?;
            error!(
                fingerprint = %fingerprint.short(),
                tier = %decision.tier,
                "quota exhausted across the fallback chain, failing item"
            );
            return Err(EscalorError::Quota(format!(
                "tier '{}' and its fallback chain are out of quota",
                decision.tier
            )));
        };

        self.state.queue.mark_running(&fingerprint).await?;

        // Bounded attempts on the admitted tier, with exponential
        // backoff between them. The final failed attempt is held back:
        // its outcome depends on whether escalation is possible.
        let mut last: Option<Attempt> = None;
        for attempt in 0..=self.retry.max_retries {
            let result = self.attempt(item, admitted, attempt).await?;
            if result.record.is_success() {
                return self.finish_success(item, result).await;
            }
            if attempt < self.retry.max_retries {
                self.state
                    .events
                    .record(EventKind::ExecutionFinished {
                        record: result.record.clone(),
                        error: result.error.clone(),
                    })
                    .await?;
                let delay = compute_backoff(&self.retry, attempt);
                info!(
                    fingerprint = %fingerprint.short(),
                    attempt,
                    delay_ms = delay,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            } else {
                last = Some(result);
            }
        }
        let Some(mut last) = last else {
            return Err(EscalorError::Handler(
                "retry loop yielded no attempt".to_string(),
            ));
        };

        // Escalate once to the next-higher tier, if one exists and
        // admits the work. The abandoned attempt is recorded as
        // escalated rather than failed.
        if let Some(target) = self.catalog.next_higher(&admitted.name) {
            if self.state.quota.try_consume(target).await? {
                last.record.outcome = ExecOutcome::Escalated;
                self.state
                    .events
                    .record(EventKind::ExecutionFinished {
                        record: last.record.clone(),
                        error: last.error.clone(),
                    })
                    .await?;
                self.state
                    .events
                    .record(EventKind::Escalated {
                        fingerprint: fingerprint.clone(),
                        from_tier: admitted.name.clone(),
                        to_tier: target.name.clone(),
                    })
                    .await?;
                info!(
                    from = %admitted.name,
                    to = %target.name,
                    fingerprint = %fingerprint.short(),
                    "escalating after exhausted retries"
                );

                let escalated = self
                    .attempt(item, target, self.retry.max_retries + 1)
                    .await?;
                if escalated.record.is_success() {
                    return self.finish_success(item, escalated).await;
                }
                self.state
                    .events
                    .record(EventKind::ExecutionFinished {
                        record: escalated.record.clone(),
                        error: escalated.error.clone(),
                    })
                    .await?;
                self.state.queue.mark_failed(&fingerprint).await?;
                error!(
                    fingerprint = %fingerprint.short(),
                    tier = %target.name,
                    "work item failed at escalated tier"
                );
                return Ok(escalated.record);
            }
            self.state
                .events
                .record(EventKind::QuotaDenied {
                    fingerprint: fingerprint.clone(),
                    tier: target.name.clone(),
                })
                .await?;
            debug!(target = %target.name, "escalation target out of quota");
        }

        self.state
            .events
            .record(EventKind::ExecutionFinished {
                record: last.record.clone(),
                error: last.error.clone(),
            })
            .await?;
        self.state.queue.mark_failed(&fingerprint).await?;
        error!(
            fingerprint = %fingerprint.short(),
            tier = %admitted.name,
            outcome = ?last.record.outcome,
            "work item failed after exhausting retries"
        );
        Ok(last.record)
    }

    /// One timeout-bounded handler invocation. Handler failures of any
    /// kind (non-zero exit, spawn error, timeout) are folded into the
    /// attempt's outcome so the retry ladder treats them uniformly.
    async fn attempt(
        &self,
        item: &WorkItem,
        tier: &TierSpec,
        attempt: u32,
    ) -> EscalorResult<Attempt> {
        self.state
            .events
            .record(EventKind::ExecutionStarted {
                fingerprint: item.id.clone(),
                tier: tier.name.clone(),
                attempt,
            })
            .await?;

        let started_at = Utc::now();
        let bound = Duration::from_secs(tier.timeout_secs);
        let (outcome, exit_status, stdout, error) =
            match tokio::time::timeout(bound, self.handler.execute(tier, &item.payload)).await {
                Ok(Ok(out)) if out.success() => {
                    (ExecOutcome::Success, out.exit_code, Some(out.stdout), None)
                }
                Ok(Ok(out)) => {
                    let reason = if out.stderr.trim().is_empty() {
                        let code = out
                            .exit_code
                            .map_or_else(|| "signal".to_string(), |c| c.to_string());
                        format!("handler exited with code {code}")
                    } else {
                        out.stderr.trim().to_string()
                    };
                    (ExecOutcome::Error, out.exit_code, None, Some(reason))
                }
                Ok(Err(e)) => (ExecOutcome::Error, None, None, Some(e.to_string())),
                Err(_elapsed) => {
                    warn!(
                        tier = %tier.name,
                        timeout_secs = tier.timeout_secs,
                        "handler timed out"
                    );
                    (
                        ExecOutcome::Timeout,
                        None,
                        None,
                        Some(format!("timed out after {}s", tier.timeout_secs)),
                    )
                }
            };

        if let Some(reason) = &error {
            warn!(
                fingerprint = %item.id.short(),
                tier = %tier.name,
                attempt,
                reason = %reason,
                "attempt failed"
            );
        }

        Ok(Attempt {
            record: ExecutionRecord {
                work_item: item.id.clone(),
                tier: tier.name.clone(),
                started_at,
                ended_at: Utc::now(),
                exit_status,
                attempt,
                outcome,
                from_cache: false,
            },
            stdout,
            error,
        })
    }

    /// Publish the result to the cache before retiring the item, so a
    /// crash between the two steps heals as a cache hit on re-run.
    async fn finish_success(
        &self,
        item: &WorkItem,
        attempt: Attempt,
    ) -> EscalorResult<ExecutionRecord> {
        let result = attempt.stdout.unwrap_or_default();
        self.state
            .cache
            .put(&CacheEntry::new(
                item.id.clone(),
                result,
                self.cache_ttl_secs,
            ))
            .await?;
        self.state.queue.mark_done(&item.id).await?;
        self.state
            .events
            .record(EventKind::ExecutionFinished {
                record: attempt.record.clone(),
                error: None,
            })
            .await?;
        info!(
            fingerprint = %item.id.short(),
            tier = %attempt.record.tier,
            attempt = attempt.record.attempt,
            duration_ms = attempt.record.duration_ms(),
            "execution succeeded"
        );
        Ok(attempt.record)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
