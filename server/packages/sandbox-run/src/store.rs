//! Persistence seam for run records.
//!
//! The store is a passive document store: it never interprets `data`. Only the
//! orchestrator and the stream proxy write run records through it.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use sandbox_run_error::RunError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid document id: {0}")]
    InvalidId(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

impl From<StoreError> for RunError {
    fn from(value: StoreError) -> Self {
        RunError::Persistence {
            message: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub id: String,
    pub owner_id: String,
    pub collection_id: String,
    pub run_id: String,
    pub record_type: String,
    pub data: Value,
}

/// Document store used for run records.
pub trait RunStore: Send + Sync + 'static {
    fn create(
        &self,
        owner_id: &str,
        collection_id: &str,
        run_id: &str,
        record_type: &str,
        data: Value,
    ) -> StoreFuture<'_, StoredRef>;

    /// Replaces the data of an existing document.
    fn update(&self, id: &str, data: Value) -> StoreFuture<'_, ()>;

    fn get_by_id(&self, id: &str) -> StoreFuture<'_, Option<StoredDocument>>;

    fn find_by_run_id(&self, run_id: &str) -> StoreFuture<'_, Option<StoredDocument>>;
}

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    documents: RwLock<HashMap<String, StoredDocument>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }
}

impl RunStore for MemoryRunStore {
    fn create(
        &self,
        owner_id: &str,
        collection_id: &str,
        run_id: &str,
        record_type: &str,
        data: Value,
    ) -> StoreFuture<'_, StoredRef> {
        let document = StoredDocument {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            collection_id: collection_id.to_string(),
            run_id: run_id.to_string(),
            record_type: record_type.to_string(),
            data,
        };
        Box::pin(async move {
            let id = document.id.clone();
            self.documents.write().await.insert(id.clone(), document);
            Ok(StoredRef { id })
        })
    }

    fn update(&self, id: &str, data: Value) -> StoreFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let mut documents = self.documents.write().await;
            let document = documents
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            document.data = data;
            Ok(())
        })
    }

    fn get_by_id(&self, id: &str) -> StoreFuture<'_, Option<StoredDocument>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.documents.read().await.get(&id).cloned()) })
    }

    fn find_by_run_id(&self, run_id: &str) -> StoreFuture<'_, Option<StoredDocument>> {
        let run_id = run_id.to_string();
        Box::pin(async move {
            Ok(self
                .documents
                .read()
                .await
                .values()
                .find(|document| document.run_id == run_id)
                .cloned())
        })
    }
}

/// One JSON file per document under a data directory.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sandbox-run")
            .join("runs")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn read_document(path: &Path) -> Result<Option<StoredDocument>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_document(&self, document: &StoredDocument) -> Result<(), StoreError> {
        let path = self.path_for(&document.id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

impl RunStore for FileRunStore {
    fn create(
        &self,
        owner_id: &str,
        collection_id: &str,
        run_id: &str,
        record_type: &str,
        data: Value,
    ) -> StoreFuture<'_, StoredRef> {
        let document = StoredDocument {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            collection_id: collection_id.to_string(),
            run_id: run_id.to_string(),
            record_type: record_type.to_string(),
            data,
        };
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            self.write_document(&document).await?;
            Ok(StoredRef { id: document.id })
        })
    }

    fn update(&self, id: &str, data: Value) -> StoreFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let path = self.path_for(&id)?;
            let mut document = Self::read_document(&path)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            document.data = data;
            self.write_document(&document).await
        })
    }

    fn get_by_id(&self, id: &str) -> StoreFuture<'_, Option<StoredDocument>> {
        let id = id.to_string();
        Box::pin(async move {
            let path = self.path_for(&id)?;
            Self::read_document(&path).await
        })
    }

    fn find_by_run_id(&self, run_id: &str) -> StoreFuture<'_, Option<StoredDocument>> {
        let run_id = run_id.to_string();
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                match Self::read_document(&path).await {
                    Ok(Some(document)) if document.run_id == run_id => return Ok(Some(document)),
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %err,
                            "file_store: skipping unreadable document"
                        );
                    }
                }
            }
            Ok(None)
        })
    }
}
