use crate::events::{Event, EventKind};
use escalor_core::{ExecOutcome, Fingerprint};
use serde::Serialize;
use std::collections::HashMap;

/// Aggregate compliance view computed purely from the event log.
///
/// Attempt-level: `executions`, `successes`, and `failures` count
/// individual attempts, not work items. An execution is compliant when it
/// succeeded on the tier its decision named; fallback and escalation both
/// show up as non-compliant successes plus an escalation event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ComplianceSummary {
    pub decisions: u64,
    pub cache_hits: u64,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub escalations: u64,
    pub quota_denials: u64,
    pub cancellations: u64,
    pub compliant: u64,
    pub non_compliant: u64,
}

/// Compute the compliance summary over recorded events.
pub fn summarize(events: &[Event]) -> ComplianceSummary {
    let mut decided: HashMap<Fingerprint, String> = HashMap::new();
    let mut summary = ComplianceSummary::default();

    for event in events {
        match &event.kind {
            EventKind::DecisionMade {
                fingerprint,
                decision,
            } => {
                summary.decisions += 1;
                decided.insert(fingerprint.clone(), decision.tier.clone());
            }
            EventKind::CacheHit { .. } => summary.cache_hits += 1,
            EventKind::ExecutionFinished { record, .. } => {
                summary.executions += 1;
                match record.outcome {
                    ExecOutcome::Success => {
                        summary.successes += 1;
                        if let Some(tier) = decided.get(&record.work_item) {
                            if *tier == record.tier {
                                summary.compliant += 1;
                            } else {
                                summary.non_compliant += 1;
                            }
                        }
                    }
                    ExecOutcome::Timeout | ExecOutcome::Error => summary.failures += 1,
                    // Abandonment marker; the escalation itself is counted
                    // through its own event
                    ExecOutcome::Escalated => {}
                }
            }
            EventKind::QuotaDenied { .. } => summary.quota_denials += 1,
            EventKind::Escalated { .. } => summary.escalations += 1,
            EventKind::WorkCancelled { .. } => summary.cancellations += 1,
            _ => {}
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use escalor_core::{Decision, ExecutionRecord};

    fn fp(payload: &str) -> Fingerprint {
        Fingerprint::compute(payload, "fast")
    }

    fn event(kind: EventKind) -> Event {
        Event {
            timestamp: Utc::now(),
            kind,
        }
    }

    fn finished(payload: &str, tier: &str, outcome: ExecOutcome) -> Event {
        let now = Utc::now();
        event(EventKind::ExecutionFinished {
            record: ExecutionRecord {
                work_item: fp(payload),
                tier: tier.to_string(),
                started_at: now,
                ended_at: now,
                exit_status: Some(0),
                attempt: 0,
                outcome,
                from_cache: false,
            },
            error: None,
        })
    }

    #[test]
    fn test_empty_log() {
        assert_eq!(summarize(&[]), ComplianceSummary::default());
    }

    #[test]
    fn test_compliant_execution() {
        let events = vec![
            event(EventKind::DecisionMade {
                fingerprint: fp("job"),
                decision: Decision::new("fast", 0.9, "short"),
            }),
            finished("job", "fast", ExecOutcome::Success),
        ];

        let summary = summarize(&events);
        assert_eq!(summary.decisions, 1);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.compliant, 1);
        assert_eq!(summary.non_compliant, 0);
    }

    #[test]
    fn test_escalated_execution_is_non_compliant() {
        let events = vec![
            event(EventKind::DecisionMade {
                fingerprint: fp("job"),
                decision: Decision::new("fast", 0.9, "short"),
            }),
            finished("job", "fast", ExecOutcome::Escalated),
            event(EventKind::Escalated {
                fingerprint: fp("job"),
                from_tier: "fast".to_string(),
                to_tier: "deep".to_string(),
            }),
            finished("job", "deep", ExecOutcome::Success),
        ];

        let summary = summarize(&events);
        assert_eq!(summary.escalations, 1);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.compliant, 0);
        assert_eq!(summary.non_compliant, 1);
        // The abandoned attempt is an execution but not a failure
        assert_eq!(summary.executions, 2);
        assert_eq!(summary.failures, 0);
    }

    #[test]
    fn test_failed_attempts_counted() {
        let events = vec![
            finished("job", "fast", ExecOutcome::Error),
            finished("job", "fast", ExecOutcome::Timeout),
            finished("job", "fast", ExecOutcome::Success),
        ];

        let summary = summarize(&events);
        assert_eq!(summary.executions, 3);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.successes, 1);
    }

    #[test]
    fn test_cache_hits_and_denials() {
        let events = vec![
            event(EventKind::CacheHit {
                fingerprint: fp("job"),
                tier: "fast".to_string(),
            }),
            event(EventKind::QuotaDenied {
                fingerprint: fp("job"),
                tier: "deep".to_string(),
            }),
            event(EventKind::WorkCancelled { fingerprint: fp("other") }),
        ];

        let summary = summarize(&events);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.quota_denials, 1);
        assert_eq!(summary.cancellations, 1);
    }
}
