use chrono::{DateTime, Utc};
use escalor_core::{Decision, EscalorError, EscalorResult, ExecutionRecord, Fingerprint};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// A single audited engine event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Everything the engine records about decisions, executions, and
/// workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    DecisionMade {
        fingerprint: Fingerprint,
        decision: Decision,
    },
    CacheHit {
        fingerprint: Fingerprint,
        tier: String,
    },
    ExecutionStarted {
        fingerprint: Fingerprint,
        tier: String,
        attempt: u32,
    },
    ExecutionFinished {
        record: ExecutionRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    QuotaDenied {
        fingerprint: Fingerprint,
        tier: String,
    },
    Escalated {
        fingerprint: Fingerprint,
        from_tier: String,
        to_tier: String,
    },
    WorkCancelled {
        fingerprint: Fingerprint,
    },
    WorkflowStarted {
        run_id: Uuid,
        name: String,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        fingerprint: Fingerprint,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        reason: String,
    },
    WorkflowFinished {
        run_id: Uuid,
        status: String,
    },
}

/// Append-only JSONL event log.
///
/// `record` appends one line and syncs it before returning, so once a
/// caller observes a transition the matching event is on disk; a crash can
/// cost at most the single record being written at that moment.
#[derive(Debug)]
pub struct EventRecorder {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventRecorder {
    pub async fn open(path: PathBuf) -> EscalorResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Append one event, durably, before returning.
    pub async fn record(&self, kind: EventKind) -> EscalorResult<()> {
        let event = Event {
            timestamp: Utc::now(),
            kind,
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Read back every recorded event, oldest first.
    ///
    /// A truncated final line — the one record a crash is allowed to cost —
    /// is skipped. A malformed line anywhere else means the log was
    /// tampered with and surfaces as a [`EscalorError::State`] error.
    pub async fn read_all(&self) -> EscalorResult<Vec<Event>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) if idx + 1 == lines.len() => {
                    warn!(error = %e, "dropping truncated final event line");
                }
                Err(e) => {
                    return Err(EscalorError::State(format!(
                        "corrupt event log '{}' at line {}: {e}",
                        self.path.display(),
                        idx + 1
                    )));
                }
            }
        }
        Ok(events)
    }
}
