use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::services::validation::{self, ValidationError};

/// Processing status of a work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Queued,
    Processing,
    Retouching,
    Paused,
    Completed,
    Failed,
}

impl ItemStatus {
    /// Completed and Failed see no further automatic transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }

    /// Statuses that only exist while a processor owns the item. A reload
    /// never trusts them.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ItemStatus::Queued
                | ItemStatus::Processing
                | ItemStatus::Retouching
                | ItemStatus::Paused
        )
    }
}

/// Image formats accepted by the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
pub enum ImageMime {
    #[strum(serialize = "image/jpeg")]
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[strum(serialize = "image/png")]
    #[serde(rename = "image/png")]
    Png,
    #[strum(serialize = "image/gif")]
    #[serde(rename = "image/gif")]
    Gif,
    #[strum(serialize = "image/webp")]
    #[serde(rename = "image/webp")]
    Webp,
}

impl ImageMime {
    pub fn extension(self) -> &'static str {
        match self {
            ImageMime::Jpeg => "jpg",
            ImageMime::Png => "png",
            ImageMime::Gif => "gif",
            ImageMime::Webp => "webp",
        }
    }

    pub fn from_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(ImageMime::Jpeg),
            image::ImageFormat::Png => Some(ImageMime::Png),
            image::ImageFormat::Gif => Some(ImageMime::Gif),
            image::ImageFormat::WebP => Some(ImageMime::Webp),
            _ => None,
        }
    }
}

/// Immutable image bytes. Clones share the buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageAsset {
    data: Arc<[u8]>,
    mime: ImageMime,
}

impl ImageAsset {
    pub fn new(data: impl Into<Arc<[u8]>>, mime: ImageMime) -> Self {
        Self {
            data: data.into(),
            mime,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn mime(&self) -> ImageMime {
        self.mime
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for ImageAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageAsset")
            .field("mime", &self.mime)
            .field("len", &self.data.len())
            .finish()
    }
}

/// One image's processing record.
///
/// Transition helpers take `&self` and return a new snapshot; the owner of
/// the batch publishes snapshots, nothing mutates a shared item in place.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: Uuid,
    pub source: ImageAsset,
    pub reference: Option<ImageAsset>,
    pub status: ItemStatus,
    result: Option<ImageAsset>,
    pub label: Option<String>,
    pub last_error: Option<String>,
    attempt_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(source: ImageAsset) -> Self {
        Self::with_id(Uuid::new_v4(), source)
    }

    pub fn with_id(id: Uuid, source: ImageAsset) -> Self {
        Self {
            id,
            source,
            reference: None,
            status: ItemStatus::Pending,
            result: None,
            label: None,
            last_error: None,
            attempt_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Validate caller-supplied bytes and wrap them in a Pending item.
    pub fn from_upload(bytes: Vec<u8>) -> Result<Self, ValidationError> {
        validation::validate_source(bytes).map(Self::new)
    }

    /// Rebuild a stored item. Non-terminal statuses come back as Pending and
    /// a result is only kept for Completed items.
    pub fn restore(
        id: Uuid,
        source: ImageAsset,
        status: ItemStatus,
        result: Option<ImageAsset>,
        label: Option<String>,
        last_error: Option<String>,
    ) -> Self {
        let mut item = Self::with_id(id, source);
        item.label = label;
        match (status, result) {
            (ItemStatus::Completed, Some(result)) => {
                item.status = ItemStatus::Completed;
                item.result = Some(result);
            }
            (ItemStatus::Failed, _) => {
                item.status = ItemStatus::Failed;
                item.last_error = last_error;
            }
            _ => {}
        }
        item
    }

    pub fn result(&self) -> Option<&ImageAsset> {
        self.result.as_ref()
    }

    /// Generation calls issued for this item in the current run.
    pub fn attempts(&self) -> u32 {
        self.attempt_count
    }

    /// Pure status assignment. Any status other than Completed drops the
    /// result; the error is replaced by `error`.
    pub fn mark_status(&self, status: ItemStatus, error: Option<String>) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.last_error = error;
        if status != ItemStatus::Completed {
            next.result = None;
        }
        if status == ItemStatus::Pending {
            next.attempt_count = 0;
        }
        next.updated_at = Utc::now();
        next
    }

    /// Completed snapshot carrying `result`. A label returned alongside the
    /// image replaces the current one.
    pub fn complete(&self, result: ImageAsset, label: Option<String>) -> Self {
        let mut next = self.mark_status(ItemStatus::Completed, None);
        next.result = Some(result);
        if let Some(label) = label.filter(|l| !l.trim().is_empty()) {
            next.label = Some(label.trim().to_string());
        }
        next
    }

    /// Pending snapshot ready to re-enter a queue.
    pub fn reset(&self) -> Self {
        self.mark_status(ItemStatus::Pending, None)
    }

    pub fn with_label(&self, label: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.label = Some(label.into());
        next.updated_at = Utc::now();
        next
    }

    pub(crate) fn with_reference(mut self, reference: Option<ImageAsset>) -> Self {
        self.reference = reference;
        self
    }

    pub(crate) fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt_count += 1;
        next
    }

    /// Input image for a retouch or hero render: the current result, or the
    /// source when there is none.
    pub fn edit_input(&self) -> ImageAsset {
        self.result.clone().unwrap_or_else(|| self.source.clone())
    }

    /// Enter an edit status. The returned image is the edit input, taken
    /// before the snapshot drops its result.
    pub fn begin_edit(&self, status: ItemStatus) -> (Self, ImageAsset) {
        let input = self.edit_input();
        (self.mark_status(status, None), input)
    }
}

/// `(item id, new snapshot)` event emitted on every published change.
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub item_id: Uuid,
    pub snapshot: WorkItem,
}

impl From<WorkItem> for ItemUpdate {
    fn from(snapshot: WorkItem) -> Self {
        Self {
            item_id: snapshot.id,
            snapshot,
        }
    }
}
