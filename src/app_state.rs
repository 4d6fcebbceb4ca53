use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::models::item::{ItemStatus, ItemUpdate};
use crate::services::scheduler::{BatchHandle, BatchScheduler};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<BatchScheduler>,
    batches: Arc<RwLock<HashMap<Uuid, BatchHandle>>>,
    /// How long an idle or cancelled batch stays queryable.
    retention: Duration,
}

impl AppState {
    pub fn new(scheduler: BatchScheduler, retention: Duration) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            batches: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Track a new run, drain its update events into the log and evict it
    /// once it has been idle for the retention period.
    pub fn register(&self, handle: BatchHandle, mut events: UnboundedReceiver<ItemUpdate>) {
        let batch_id = handle.id();
        self.batches.write().insert(batch_id, handle);
        metrics::gauge!("studio_batches_tracked").set(self.batch_count() as f64);
        self.spawn_eviction(batch_id);

        tokio::spawn(async move {
            while let Some(update) = events.recv().await {
                let snapshot = &update.snapshot;
                match snapshot.status {
                    ItemStatus::Completed => tracing::info!(
                        batch_id = %batch_id,
                        item_id = %update.item_id,
                        label = snapshot.label.as_deref().unwrap_or_default(),
                        "Item completed"
                    ),
                    ItemStatus::Failed => tracing::warn!(
                        batch_id = %batch_id,
                        item_id = %update.item_id,
                        error = snapshot.last_error.as_deref().unwrap_or_default(),
                        "Item failed"
                    ),
                    status => tracing::debug!(
                        batch_id = %batch_id,
                        item_id = %update.item_id,
                        status = %status,
                        "Item updated"
                    ),
                }
            }
            tracing::debug!(batch_id = %batch_id, "Batch event stream closed");
        });
    }

    /// Idle runs are dropped after `retention`; a run that picked up new
    /// work in the meantime is waited on again.
    fn spawn_eviction(&self, batch_id: Uuid) {
        let batches = Arc::clone(&self.batches);
        let retention = self.retention;

        tokio::spawn(async move {
            loop {
                let handle = batches.read().get(&batch_id).cloned();
                let Some(handle) = handle else {
                    return;
                };
                let _ = handle.wait().await;
                drop(handle);

                tokio::time::sleep(retention).await;

                let evicted = {
                    let mut registry = batches.write();
                    let idle = registry.get(&batch_id).map(BatchHandle::is_idle);
                    match idle {
                        Some(true) => registry.remove(&batch_id).is_some(),
                        Some(false) => false,
                        None => return,
                    }
                };
                if evicted {
                    let remaining = batches.read().len();
                    metrics::gauge!("studio_batches_tracked").set(remaining as f64);
                    tracing::info!(batch_id = %batch_id, remaining, "Evicted idle batch");
                    return;
                }
            }
        });
    }

    /// Stop tracking a run. The caller decides whether to cancel it.
    pub fn remove(&self, batch_id: Uuid) -> Option<BatchHandle> {
        let removed = self.batches.write().remove(&batch_id);
        if removed.is_some() {
            metrics::gauge!("studio_batches_tracked").set(self.batch_count() as f64);
        }
        removed
    }

    pub fn batch(&self, batch_id: Uuid) -> Option<BatchHandle> {
        self.batches.read().get(&batch_id).cloned()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.read().len()
    }

    /// Batches that are neither cancelled nor idle.
    pub fn active_batch_count(&self) -> usize {
        self.batches
            .read()
            .values()
            .filter(|b| !b.is_cancelled() && b.progress().active() > 0)
            .count()
    }
}
