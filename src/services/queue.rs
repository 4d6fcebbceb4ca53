use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::models::batch::BatchProgress;
use crate::models::item::{ItemStatus, ItemUpdate, WorkItem};

/// Ordered set of work items holding the latest snapshot of each.
///
/// Every accepted snapshot is forwarded to the update channel. A closed
/// channel only means nobody is listening any more; processing continues.
#[derive(Debug)]
pub struct WorkQueue {
    order: Vec<Uuid>,
    items: HashMap<Uuid, WorkItem>,
    events: UnboundedSender<ItemUpdate>,
}

impl WorkQueue {
    pub fn new(events: UnboundedSender<ItemUpdate>) -> Self {
        Self {
            order: Vec::new(),
            items: HashMap::new(),
            events,
        }
    }

    /// Add or replace an item. Items a processor currently owns cannot be
    /// replaced.
    pub fn insert(&mut self, item: WorkItem) -> Result<(), QueueError> {
        match self.items.get(&item.id) {
            Some(existing) if existing.status.is_in_flight() => {
                return Err(QueueError::Busy {
                    item_id: item.id,
                    status: existing.status,
                })
            }
            Some(_) => {}
            None => self.order.push(item.id),
        }
        self.items.insert(item.id, item);
        Ok(())
    }

    /// Move every Pending item to Queued and emit one update per item moved.
    /// Items in any other status are left alone, so calling this twice is a
    /// no-op the second time.
    pub fn initialize(&mut self) -> Vec<WorkItem> {
        let pending: Vec<Uuid> = self
            .order
            .iter()
            .filter(|id| {
                self.items
                    .get(id)
                    .is_some_and(|item| item.status == ItemStatus::Pending)
            })
            .copied()
            .collect();

        pending
            .into_iter()
            .filter_map(|id| {
                let queued = self.items.get(&id)?.mark_status(ItemStatus::Queued, None);
                Some(self.apply(queued))
            })
            .collect()
    }

    /// Store a new snapshot and emit it. A label set independently of
    /// processing is kept when the incoming snapshot carries none.
    pub fn apply(&mut self, mut snapshot: WorkItem) -> WorkItem {
        match self.items.get(&snapshot.id) {
            Some(existing) => {
                if snapshot.label.is_none() {
                    snapshot.label = existing.label.clone();
                }
            }
            None => self.order.push(snapshot.id),
        }
        self.items.insert(snapshot.id, snapshot.clone());
        let _ = self.events.send(ItemUpdate::from(snapshot.clone()));
        snapshot
    }

    /// Set the descriptive label without touching status.
    pub fn set_label(&mut self, item_id: Uuid, label: &str) -> Option<WorkItem> {
        let labelled = self.items.get(&item_id)?.with_label(label);
        Some(self.apply(labelled))
    }

    pub fn get(&self, item_id: Uuid) -> Option<&WorkItem> {
        self.items.get(&item_id)
    }

    /// Snapshots in submission order.
    pub fn items(&self) -> Vec<WorkItem> {
        self.order
            .iter()
            .filter_map(|id| self.items.get(id).cloned())
            .collect()
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress::from_items(self.items.values())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Cloneable handle to a queue shared by the processors of one run.
#[derive(Debug, Clone)]
pub struct SharedQueue {
    inner: Arc<Mutex<WorkQueue>>,
}

impl SharedQueue {
    pub fn new(events: UnboundedSender<ItemUpdate>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WorkQueue::new(events))),
        }
    }

    pub fn insert(&self, item: WorkItem) -> Result<(), QueueError> {
        self.inner.lock().insert(item)
    }

    pub fn initialize(&self) -> Vec<WorkItem> {
        self.inner.lock().initialize()
    }

    pub fn publish(&self, snapshot: WorkItem) -> WorkItem {
        self.inner.lock().apply(snapshot)
    }

    pub fn set_label(&self, item_id: Uuid, label: &str) -> Option<WorkItem> {
        self.inner.lock().set_label(item_id, label)
    }

    pub fn get(&self, item_id: Uuid) -> Option<WorkItem> {
        self.inner.lock().get(item_id).cloned()
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.inner.lock().items()
    }

    pub fn progress(&self) -> BatchProgress {
        self.inner.lock().progress()
    }

    /// Run `f` with the queue locked. `f` must not block.
    pub fn with<R>(&self, f: impl FnOnce(&mut WorkQueue) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Item {item_id} is {status} and cannot be replaced")]
    Busy { item_id: Uuid, status: ItemStatus },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::item::{ImageAsset, ImageMime};
    use tokio::sync::mpsc;

    fn item() -> WorkItem {
        WorkItem::new(ImageAsset::new(vec![1u8; 4], ImageMime::Jpeg))
    }

    #[test]
    fn test_initialize_queues_pending_only_and_emits_per_item() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = WorkQueue::new(tx);

        let pending = item();
        let done = item().complete(ImageAsset::new(vec![2u8; 4], ImageMime::Png), None);
        let failed = item().mark_status(ItemStatus::Failed, Some("no".into()));
        queue.insert(pending.clone()).unwrap();
        queue.insert(done.clone()).unwrap();
        queue.insert(failed.clone()).unwrap();

        let queued = queue.initialize();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, pending.id);
        assert_eq!(queue.get(pending.id).unwrap().status, ItemStatus::Queued);
        assert_eq!(queue.get(done.id).unwrap().status, ItemStatus::Completed);
        assert_eq!(queue.get(failed.id).unwrap().status, ItemStatus::Failed);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.item_id, pending.id);
        assert_eq!(event.snapshot.status, ItemStatus::Queued);
        assert!(rx.try_recv().is_err());

        assert!(queue.initialize().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_apply_preserves_independent_label() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut queue = WorkQueue::new(tx);
        let original = item();
        queue.insert(original.clone()).unwrap();

        queue.set_label(original.id, "Front Quarter");
        let processing = queue.apply(original.mark_status(ItemStatus::Processing, None));
        assert_eq!(processing.label.as_deref(), Some("Front Quarter"));
        assert_eq!(processing.status, ItemStatus::Processing);
    }

    #[test]
    fn test_set_label_keeps_status() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = WorkQueue::new(tx);
        let original = item();
        queue.insert(original.clone()).unwrap();
        queue.initialize();
        let _ = rx.try_recv();

        let labelled = queue.set_label(original.id, "Interior").unwrap();
        assert_eq!(labelled.status, ItemStatus::Queued);
        assert_eq!(rx.try_recv().unwrap().snapshot.label.as_deref(), Some("Interior"));
        assert!(queue.set_label(uuid::Uuid::new_v4(), "x").is_none());
    }

    #[test]
    fn test_insert_rejects_in_flight_replacement() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut queue = WorkQueue::new(tx);
        let original = item();
        queue.insert(original.clone()).unwrap();
        queue.apply(original.mark_status(ItemStatus::Processing, None));

        let err = queue.insert(original.reset()).unwrap_err();
        assert_eq!(
            err,
            QueueError::Busy {
                item_id: original.id,
                status: ItemStatus::Processing
            }
        );
    }

    #[test]
    fn test_items_keep_submission_order() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut queue = WorkQueue::new(tx);
        let ids: Vec<Uuid> = (0..4)
            .map(|_| {
                let it = item();
                queue.insert(it.clone()).unwrap();
                it.id
            })
            .collect();
        let listed: Vec<Uuid> = queue.items().iter().map(|i| i.id).collect();
        assert_eq!(listed, ids);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.progress().pending, 4);
    }

    #[test]
    fn test_closed_channel_does_not_stop_updates() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut queue = WorkQueue::new(tx);
        let original = item();
        queue.insert(original.clone()).unwrap();
        assert_eq!(queue.initialize().len(), 1);
    }
}
