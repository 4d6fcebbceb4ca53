use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::item::{ImageAsset, ImageMime, ItemStatus, WorkItem};

const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

/// Directory-backed project: a JSON manifest plus one file per image.
pub struct ProjectStore {
    root: PathBuf,
    manifest: Mutex<Manifest>,
}

/// Items and reference image read back from disk.
#[derive(Debug, Default)]
pub struct StoredProject {
    pub items: Vec<WorkItem>,
    pub reference: Option<ImageAsset>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    #[serde(default)]
    reference: Option<StoredFile>,
    #[serde(default)]
    items: Vec<ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            reference: None,
            items: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredFile {
    file: String,
    mime: ImageMime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    id: Uuid,
    status: ItemStatus,
    label: Option<String>,
    last_error: Option<String>,
    source: StoredFile,
    result: Option<StoredFile>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Project I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid project manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Unsupported manifest version {0}")]
    UnsupportedVersion(u32),
}

impl ProjectStore {
    /// Open (or create) a project directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let manifest = match tokio::fs::read(root.join(MANIFEST_FILE)).await {
            Ok(bytes) => {
                let manifest: Manifest = serde_json::from_slice(&bytes)?;
                if manifest.version != MANIFEST_VERSION {
                    return Err(StoreError::UnsupportedVersion(manifest.version));
                }
                manifest
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Manifest::default(),
            Err(e) => return Err(e.into()),
        };

        debug!(root = %root.display(), items = manifest.items.len(), "Opened project store");
        Ok(Self {
            root,
            manifest: Mutex::new(manifest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn contains(&self, item_id: Uuid) -> bool {
        self.manifest
            .lock()
            .await
            .items
            .iter()
            .any(|e| e.id == item_id)
    }

    /// Read every stored item. Statuses that only make sense while a run is
    /// live come back as Pending without a result, except an interrupted
    /// retouch or hero render: that item still has its last completed render
    /// on disk and comes back as Completed with it.
    pub async fn load(&self) -> Result<StoredProject, StoreError> {
        let manifest = self.manifest.lock().await;

        let reference = match &manifest.reference {
            Some(file) => self.read_asset(file).await?,
            None => None,
        };

        let mut items = Vec::with_capacity(manifest.items.len());
        for entry in &manifest.items {
            let Some(source) = self.read_asset(&entry.source).await? else {
                warn!(item_id = %entry.id, file = %entry.source.file, "Source image missing, skipping item");
                continue;
            };
            let result = match &entry.result {
                Some(file)
                    if entry.status == ItemStatus::Completed || entry.status.is_in_flight() =>
                {
                    self.read_asset(file).await?
                }
                _ => None,
            };
            let status = if result.is_some() {
                ItemStatus::Completed
            } else {
                entry.status
            };
            let mut item = WorkItem::restore(
                entry.id,
                source,
                status,
                result,
                entry.label.clone(),
                entry.last_error.clone(),
            );
            item.reference = reference.clone();
            items.push(item);
        }

        Ok(StoredProject { items, reference })
    }

    /// Insert or update one item. The source file is written once; the
    /// result file tracks the snapshot's result, but an in-flight snapshot
    /// keeps the previous completed render until the edit lands or fails.
    pub async fn save(&self, item: &WorkItem) -> Result<(), StoreError> {
        let mut manifest = self.manifest.lock().await;

        let source = StoredFile {
            file: format!("{}.source.{}", item.id, item.source.mime().extension()),
            mime: item.source.mime(),
        };
        let source_path = self.root.join(&source.file);
        if !tokio::fs::try_exists(&source_path).await? {
            tokio::fs::write(&source_path, item.source.bytes()).await?;
        }

        let previous_result = manifest
            .items
            .iter()
            .find(|e| e.id == item.id)
            .and_then(|e| e.result.clone());

        let result = match item.result() {
            Some(asset) => {
                let file = StoredFile {
                    file: format!("{}.result.{}", item.id, asset.mime().extension()),
                    mime: asset.mime(),
                };
                write_atomic(&self.root.join(&file.file), asset.bytes()).await?;
                Some(file)
            }
            None if item.status.is_in_flight() => previous_result.clone(),
            None => None,
        };

        // Pending and Failed snapshots drop their result; stale files go too.
        if let Some(stale) = previous_result {
            if result.as_ref().map(|f| &f.file) != Some(&stale.file) {
                remove_if_exists(&self.root.join(&stale.file)).await?;
            }
        }

        let entry = ManifestEntry {
            id: item.id,
            status: item.status,
            label: item.label.clone(),
            last_error: item.last_error.clone(),
            source,
            result,
            updated_at: item.updated_at,
        };
        match manifest.items.iter_mut().find(|e| e.id == item.id) {
            Some(existing) => *existing = entry,
            None => manifest.items.push(entry),
        }

        self.write_manifest(&manifest).await
    }

    pub async fn save_reference(&self, reference: &ImageAsset) -> Result<(), StoreError> {
        let mut manifest = self.manifest.lock().await;

        let file = StoredFile {
            file: format!("reference.{}", reference.mime().extension()),
            mime: reference.mime(),
        };
        write_atomic(&self.root.join(&file.file), reference.bytes()).await?;
        if let Some(old) = manifest.reference.replace(file.clone()) {
            if old.file != file.file {
                remove_if_exists(&self.root.join(&old.file)).await?;
            }
        }

        self.write_manifest(&manifest).await
    }

    async fn read_asset(&self, file: &StoredFile) -> Result<Option<ImageAsset>, StoreError> {
        match tokio::fs::read(self.root.join(&file.file)).await {
            Ok(bytes) => Ok(Some(ImageAsset::new(bytes, file.mime))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.root.join(MANIFEST_FILE), &json).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
