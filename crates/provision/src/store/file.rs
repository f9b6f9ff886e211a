//! JSON-file store.
//!
//! Each document lives at `{root}/{kind}/{uuid}.json`. Writes are
//! serialized so version bumps stay monotonic within one process.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::traits::{bump_version, Kind, Store, StoreError, StoreResult};

/// File-backed [`Store`].
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Create a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, kind: Kind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    fn document_path(&self, kind: Kind, uuid: &str) -> StoreResult<PathBuf> {
        if uuid.is_empty() || uuid.contains(['/', '\\']) || uuid.starts_with('.') {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid document id '{uuid}'"),
            )));
        }
        Ok(self.collection_dir(kind).join(format!("{uuid}.json")))
    }

    async fn read_document(path: &Path) -> StoreResult<Option<Value>> {
        match fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn fetch_all(&self, kind: Kind) -> StoreResult<Vec<Value>> {
        let dir = self.collection_dir(kind);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut docs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_document(&path).await {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable document"),
            }
        }
        Ok(docs)
    }

    async fn fetch_by_uuid(&self, kind: Kind, uuid: &str) -> StoreResult<Option<Value>> {
        let path = self.document_path(kind, uuid)?;
        Self::read_document(&path).await
    }

    async fn persist(&self, kind: Kind, uuid: &str, mut doc: Value) -> StoreResult<Value> {
        let path = self.document_path(kind, uuid)?;
        let _guard = self.write_lock.lock().await;

        let previous = Self::read_document(&path).await.unwrap_or(None);
        bump_version(previous.as_ref(), &mut doc);

        fs::create_dir_all(self.collection_dir(kind)).await?;
        let content = serde_json::to_string_pretty(&doc)?;
        fs::write(&path, content).await?;
        debug!(kind = %kind, uuid = %uuid, "Persisted document");
        Ok(doc)
    }

    async fn delete(&self, kind: Kind, uuid: &str) -> StoreResult<bool> {
        let path = self.document_path(kind, uuid)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
