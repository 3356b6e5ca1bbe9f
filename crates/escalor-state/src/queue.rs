use crate::atomic::{read_json, write_json_atomic};
use escalor_core::{EscalorError, EscalorResult, Fingerprint, WorkItem, WorkStatus};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Per-status item counts, for inspection commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// The durable work queue, persisted as a single JSON snapshot.
///
/// Every mutation rewrites `queue.json` through the atomic publish path, so
/// a crash leaves either the previous snapshot or the new one. Items found
/// `Running` on open belonged to a dead process and are re-offered as
/// `Pending`; tier handlers are expected to be idempotent per fingerprint,
/// and the content cache absorbs most of the re-execution cost.
#[derive(Debug)]
pub struct DurableQueue {
    path: PathBuf,
    items: Mutex<Vec<WorkItem>>,
}

impl DurableQueue {
    /// Open the queue at `path`, recovering orphaned `Running` items.
    ///
    /// Callers must hold the data dir's [`DataDirLock`] first: the
    /// recovery assumes any `Running` item belonged to a process that is
    /// gone. A malformed snapshot is a [`EscalorError::State`] error; the
    /// queue never starts fresh over a file it cannot read.
    ///
    /// [`DataDirLock`]: crate::lock::DataDirLock
    pub async fn open(path: PathBuf) -> EscalorResult<Self> {
        let mut items: Vec<WorkItem> = read_json(&path).await?.unwrap_or_default();

        let mut recovered = 0;
        for item in &mut items {
            if item.status == WorkStatus::Running {
                item.status = WorkStatus::Pending;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(recovered, "re-offering running items from a previous process");
            write_json_atomic(&path, &items).await?;
        }

        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    /// Add a pending item, deduplicating by fingerprint.
    ///
    /// Returns `false` without touching the queue when an item with the
    /// same fingerprint is already pending or running. A retired item
    /// (done, failed, cancelled) is replaced by the fresh one.
    pub async fn enqueue(&self, item: WorkItem) -> EscalorResult<bool> {
        if item.status != WorkStatus::Pending {
            return Err(EscalorError::Queue(format!(
                "cannot enqueue an item in status {}",
                item.status
            )));
        }

        let mut items = self.items.lock().await;
        match items.iter().position(|i| i.id == item.id) {
            Some(idx) if items[idx].status.is_terminal() => {
                items[idx] = item;
            }
            Some(_) => return Ok(false),
            None => items.push(item),
        }
        write_json_atomic(&self.path, &*items).await?;
        Ok(true)
    }

    /// The earliest-created pending item whose dependencies are all done.
    pub async fn next_pending(&self) -> Option<WorkItem> {
        let items = self.items.lock().await;
        let done: BTreeSet<Fingerprint> = items
            .iter()
            .filter(|i| i.status == WorkStatus::Done)
            .map(|i| i.id.clone())
            .collect();

        let mut ready: Vec<&WorkItem> = items.iter().filter(|i| i.is_ready(&done)).collect();
        ready.sort_by_key(|i| i.created_at);
        ready.first().map(|i| (*i).clone())
    }

    /// Look up an item by fingerprint.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<WorkItem> {
        let items = self.items.lock().await;
        items.iter().find(|i| &i.id == fingerprint).cloned()
    }

    pub async fn mark_running(&self, fingerprint: &Fingerprint) -> EscalorResult<()> {
        self.transition(fingerprint, WorkStatus::Running).await
    }

    pub async fn mark_done(&self, fingerprint: &Fingerprint) -> EscalorResult<()> {
        self.transition(fingerprint, WorkStatus::Done).await
    }

    pub async fn mark_failed(&self, fingerprint: &Fingerprint) -> EscalorResult<()> {
        self.transition(fingerprint, WorkStatus::Failed).await
    }

    /// Cancel a pending item. Running items cannot be interrupted and
    /// retired items stay retired.
    pub async fn cancel(&self, fingerprint: &Fingerprint) -> EscalorResult<()> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|i| &i.id == fingerprint)
            .ok_or_else(|| {
                EscalorError::Queue(format!("unknown work item {}", fingerprint.short()))
            })?;

        match item.status {
            WorkStatus::Pending => {
                item.status = WorkStatus::Cancelled;
            }
            WorkStatus::Running => {
                return Err(EscalorError::Queue(format!(
                    "work item {} is running and cannot be cancelled",
                    fingerprint.short()
                )));
            }
            status => {
                return Err(EscalorError::Queue(format!(
                    "work item {} is already {status}",
                    fingerprint.short()
                )));
            }
        }
        info!(fingerprint = %fingerprint.short(), "work item cancelled");
        write_json_atomic(&self.path, &*items).await?;
        Ok(())
    }

    async fn transition(&self, fingerprint: &Fingerprint, next: WorkStatus) -> EscalorResult<()> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|i| &i.id == fingerprint)
            .ok_or_else(|| {
                EscalorError::Queue(format!("unknown work item {}", fingerprint.short()))
            })?;

        if !item.status.can_transition(next) {
            return Err(EscalorError::Queue(format!(
                "illegal transition {} -> {next} for work item {}",
                item.status,
                fingerprint.short()
            )));
        }
        item.status = next;
        write_json_atomic(&self.path, &*items).await?;
        Ok(())
    }

    /// Per-status counts.
    pub async fn counts(&self) -> QueueCounts {
        let items = self.items.lock().await;
        let mut counts = QueueCounts::default();
        for item in items.iter() {
            match item.status {
                WorkStatus::Pending => counts.pending += 1,
                WorkStatus::Running => counts.running += 1,
                WorkStatus::Done => counts.done += 1,
                WorkStatus::Failed => counts.failed += 1,
                WorkStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// All items, in enqueue order.
    pub async fn snapshot(&self) -> Vec<WorkItem> {
        let items = self.items.lock().await;
        items.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_queue() -> (DurableQueue, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let queue = DurableQueue::open(tmp.path().join("queue.json")).await.unwrap();
        (queue, tmp)
    }

    #[tokio::test]
    async fn test_enqueue_and_next_pending() {
        let (queue, _tmp) = temp_queue().await;
        let item = WorkItem::new("first", "fast");
        assert!(queue.enqueue(item.clone()).await.unwrap());

        let next = queue.next_pending().await.unwrap();
        assert_eq!(next.id, item.id);
    }

    #[tokio::test]
    async fn test_enqueue_dedups_by_fingerprint() {
        let (queue, _tmp) = temp_queue().await;
        let item = WorkItem::new("same payload", "fast");

        assert!(queue.enqueue(item.clone()).await.unwrap());
        assert!(!queue.enqueue(item.clone()).await.unwrap());
        assert_eq!(queue.counts().await.pending, 1);
    }

    #[tokio::test]
    async fn test_reenqueue_after_retirement() {
        let (queue, _tmp) = temp_queue().await;
        let item = WorkItem::new("job", "fast");
        queue.enqueue(item.clone()).await.unwrap();
        queue.mark_running(&item.id).await.unwrap();
        queue.mark_done(&item.id).await.unwrap();

        // Retired items can be superseded by a fresh pending one
        assert!(queue.enqueue(WorkItem::new("job", "fast")).await.unwrap());
        assert_eq!(queue.counts().await.pending, 1);
        assert_eq!(queue.counts().await.done, 0);
    }

    #[tokio::test]
    async fn test_status_lifecycle() {
        let (queue, _tmp) = temp_queue().await;
        let item = WorkItem::new("job", "fast");
        queue.enqueue(item.clone()).await.unwrap();

        queue.mark_running(&item.id).await.unwrap();
        assert_eq!(queue.get(&item.id).await.unwrap().status, WorkStatus::Running);
        assert!(queue.next_pending().await.is_none());

        queue.mark_done(&item.id).await.unwrap();
        assert_eq!(queue.get(&item.id).await.unwrap().status, WorkStatus::Done);
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let (queue, _tmp) = temp_queue().await;
        let item = WorkItem::new("job", "fast");
        queue.enqueue(item.clone()).await.unwrap();

        // Pending cannot jump straight to done
        assert!(queue.mark_done(&item.id).await.is_err());

        queue.mark_running(&item.id).await.unwrap();
        queue.mark_failed(&item.id).await.unwrap();
        // Terminal states are final
        assert!(queue.mark_running(&item.id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let (queue, _tmp) = temp_queue().await;
        let pending = WorkItem::new("pending job", "fast");
        let running = WorkItem::new("running job", "fast");
        queue.enqueue(pending.clone()).await.unwrap();
        queue.enqueue(running.clone()).await.unwrap();
        queue.mark_running(&running.id).await.unwrap();

        queue.cancel(&pending.id).await.unwrap();
        assert_eq!(
            queue.get(&pending.id).await.unwrap().status,
            WorkStatus::Cancelled
        );

        let err = queue.cancel(&running.id).await.unwrap_err();
        assert!(err.to_string().contains("running"));
    }

    #[tokio::test]
    async fn test_unknown_item_errors() {
        let (queue, _tmp) = temp_queue().await;
        let ghost = WorkItem::new("never enqueued", "fast");
        assert!(queue.mark_running(&ghost.id).await.is_err());
        assert!(queue.cancel(&ghost.id).await.is_err());
        assert!(queue.get(&ghost.id).await.is_none());
    }

    #[tokio::test]
    async fn test_next_pending_respects_dependencies() {
        let (queue, _tmp) = temp_queue().await;
        let first = WorkItem::new("first", "fast");
        let second = WorkItem::new("second", "fast")
            .with_depends_on(BTreeSet::from([first.id.clone()]));
        // Enqueue the dependent one first to prove ordering is by readiness
        queue.enqueue(second.clone()).await.unwrap();
        queue.enqueue(first.clone()).await.unwrap();

        assert_eq!(queue.next_pending().await.unwrap().id, first.id);

        queue.mark_running(&first.id).await.unwrap();
        queue.mark_done(&first.id).await.unwrap();
        assert_eq!(queue.next_pending().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_fifo_among_ready_items() {
        let (queue, _tmp) = temp_queue().await;
        let a = WorkItem::new("a", "fast");
        let mut b = WorkItem::new("b", "fast");
        b.created_at = a.created_at - chrono::Duration::seconds(5);
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b.clone()).await.unwrap();

        assert_eq!(queue.next_pending().await.unwrap().id, b.id);
    }
}
