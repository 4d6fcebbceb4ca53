use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::item::{ItemStatus, WorkItem};

/// Aggregate counts per status, derived from the latest snapshots.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: usize,
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub retouching: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BatchProgress {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        let mut progress = Self::default();
        for item in items {
            progress.total += 1;
            match item.status {
                ItemStatus::Pending => progress.pending += 1,
                ItemStatus::Queued => progress.queued += 1,
                ItemStatus::Processing => progress.processing += 1,
                ItemStatus::Retouching => progress.retouching += 1,
                ItemStatus::Paused => progress.paused += 1,
                ItemStatus::Completed => progress.completed += 1,
                ItemStatus::Failed => progress.failed += 1,
            }
        }
        progress
    }

    /// Items that still have work ahead of them.
    pub fn active(&self) -> usize {
        self.queued + self.processing + self.retouching + self.paused
    }
}

/// Item snapshot as returned over HTTP (image bytes are served separately).
#[derive(Debug, Serialize)]
pub struct ItemView {
    pub id: Uuid,
    pub status: ItemStatus,
    pub label: Option<String>,
    pub error: Option<String>,
    pub has_result: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkItem> for ItemView {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            status: item.status,
            label: item.label.clone(),
            error: item.last_error.clone(),
            has_result: item.result().is_some(),
            updated_at: item.updated_at,
        }
    }
}

/// An `image` field that failed validation. `index` counts `image` fields
/// from zero in upload order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RejectedImage {
    pub index: usize,
    pub error: String,
}

/// Response after submitting images to a new or running batch.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub batch_id: Uuid,
    pub item_ids: Vec<Uuid>,
    pub rejected: Vec<RejectedImage>,
    pub message: String,
}

/// Response for querying a batch.
#[derive(Debug, Serialize)]
pub struct BatchStatusResponse {
    pub batch_id: Uuid,
    pub paused: bool,
    pub progress: BatchProgress,
    pub items: Vec<ItemView>,
}

/// Targeted edit of a finished item.
#[derive(Debug, Deserialize, Validate)]
pub struct RetouchRequest {
    #[garde(length(min = 1, max = 2000))]
    pub instruction: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::item::{ImageAsset, ImageMime};

    #[test]
    fn test_progress_counts_each_status() {
        let asset = ImageAsset::new(vec![0u8; 4], ImageMime::Png);
        let pending = WorkItem::new(asset.clone());
        let queued = pending.mark_status(ItemStatus::Queued, None);
        let done = pending.complete(asset.clone(), None);
        let failed = pending.mark_status(ItemStatus::Failed, Some("x".into()));
        let items = vec![pending, queued, done.clone(), done, failed];

        let progress = BatchProgress::from_items(&items);
        assert_eq!(progress.total, 5);
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.queued, 1);
        assert_eq!(progress.completed, 2);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.active(), 1);
    }

    #[test]
    fn test_retouch_request_rejects_empty_instruction() {
        let request = RetouchRequest {
            instruction: String::new(),
        };
        assert!(request.validate().is_err());
    }
}
