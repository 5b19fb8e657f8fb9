use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use system::uuid::Uuid;
use system::{DocumentId, EncodedRaster, PixelBuffer, RasterSnapshot, Username};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{broadcast, Mutex, MutexGuard};

use crate::gateway::{
    AccessChange, AuthorizationOracle, DocumentStatus, EditorAccess, GatewayError, LoadError,
    PersistenceGateway,
};

const EXTENSION: &str = "pxl";
const LOCK_EXTENSION: &str = "lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document record is malformed: {0}")]
    Format(#[from] serde_json::Error),
    #[error("document {0} does not exist")]
    NotFound(DocumentId),
    #[error("invalid dimensions {0}x{1}")]
    Dimensions(u32, u32),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::Unavailable(e.to_string())
    }
}

/// On-disk form of a document: `<data_dir>/<id>.pxl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub owner: Username,
    #[serde(default)]
    pub collaborators: Vec<Username>,
    pub status: DocumentStatus,
    pub raster: EncodedRaster,
}

/// Exclusive advisory lock on `<id>.lock`, held for a whole
/// read-modify-write of a record. Other processes sharing the data
/// directory, such as the maintenance CLI, take the same lock.
struct RecordLock(File);

impl RecordLock {
    async fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        let file = tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        Ok(Self(file))
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

/// The access fields of a [`DocumentRecord`]; the raster is skipped while
/// parsing.
#[derive(Deserialize)]
struct RecordAccess {
    owner: Username,
    #[serde(default)]
    collaborators: Vec<Username>,
    status: DocumentStatus,
}

impl RecordAccess {
    fn can_edit(&self, username: &str) -> bool {
        self.owner == username || self.collaborators.iter().any(|c| c == username)
    }
}

/// Project store backed by one JSON file per document.
pub struct FileDocumentStore {
    data_dir: PathBuf,
    changes: broadcast::Sender<AccessChange>,
    // Serializes read-modify-write cycles within this process; `RecordLock`
    // covers other processes.
    write_lock: Mutex<()>,
}

impl FileDocumentStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).await?;
        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            data_dir,
            changes,
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn create_document(
        &self,
        owner: &str,
        width: u32,
        height: u32,
    ) -> Result<DocumentId, StoreError> {
        let buffer =
            PixelBuffer::blank(width, height).map_err(|_| StoreError::Dimensions(width, height))?;
        let document_id = Uuid::new_v4();
        let record = DocumentRecord {
            owner: owner.to_owned(),
            collaborators: Vec::new(),
            status: DocumentStatus::Active,
            raster: EncodedRaster::encode(&buffer),
        };
        let _guard = self.lock(document_id).await?;
        self.write_record(document_id, &record).await?;
        log::info!("Created document {} ({}x{}) for {}", document_id, width, height, owner);
        Ok(document_id)
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let mut result = Vec::new();
        let mut entries = fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(document_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<DocumentId>().ok())
            {
                result.push(document_id);
            }
        }
        result.sort();
        Ok(result)
    }

    pub async fn record(&self, document_id: DocumentId) -> Result<DocumentRecord, StoreError> {
        self.read_record(document_id)
            .await?
            .ok_or(StoreError::NotFound(document_id))
    }

    pub async fn set_status(
        &self,
        document_id: DocumentId,
        status: DocumentStatus,
    ) -> Result<(), StoreError> {
        self.update(document_id, |record| record.status = status)
            .await?;
        let _ = self.changes.send(AccessChange::StatusChanged {
            document_id,
            status,
        });
        Ok(())
    }

    pub async fn add_collaborator(
        &self,
        document_id: DocumentId,
        username: &str,
    ) -> Result<(), StoreError> {
        self.update(document_id, |record| {
            if !record.collaborators.iter().any(|c| c == username) {
                record.collaborators.push(username.to_owned());
            }
        })
        .await
        .map(|_| ())
    }

    pub async fn revoke_collaborator(
        &self,
        document_id: DocumentId,
        username: &str,
    ) -> Result<(), StoreError> {
        self.update(document_id, |record| {
            record.collaborators.retain(|c| c != username)
        })
        .await?;
        let _ = self.changes.send(AccessChange::AccessRevoked {
            document_id,
            username: username.to_owned(),
        });
        Ok(())
    }

    async fn update<F>(&self, document_id: DocumentId, f: F) -> Result<DocumentRecord, StoreError>
    where
        F: FnOnce(&mut DocumentRecord),
    {
        let _guard = self.lock(document_id).await?;
        let mut record = self.record(document_id).await?;
        f(&mut record);
        self.write_record(document_id, &record).await?;
        Ok(record)
    }

    async fn lock(
        &self,
        document_id: DocumentId,
    ) -> Result<(MutexGuard<'_, ()>, RecordLock), StoreError> {
        let local = self.write_lock.lock().await;
        let shared = RecordLock::acquire(self.file_name(document_id).with_extension(LOCK_EXTENSION))
            .await?;
        Ok((local, shared))
    }

    async fn read_record(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        self.read_as(document_id).await
    }

    async fn read_access(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<RecordAccess>, StoreError> {
        self.read_as(document_id).await
    }

    async fn read_as<T: DeserializeOwned>(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<T>, StoreError> {
        match fs::read(self.file_name(document_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(
        &self,
        document_id: DocumentId,
        record: &DocumentRecord,
    ) -> Result<(), StoreError> {
        let file_name = self.file_name(document_id);
        let temp_name = file_name.with_extension(format!("{}.tmp", EXTENSION));
        fs::write(&temp_name, serde_json::to_vec(record)?).await?;
        fs::rename(&temp_name, &file_name).await?;
        Ok(())
    }

    fn file_name(&self, document_id: DocumentId) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", document_id, EXTENSION))
    }
}

#[async_trait]
impl AuthorizationOracle for FileDocumentStore {
    async fn can_edit(&self, username: &str, document_id: DocumentId) -> Result<bool, GatewayError> {
        Ok(self
            .read_access(document_id)
            .await?
            .map_or(false, |access| access.can_edit(username)))
    }

    async fn document_status(&self, document_id: DocumentId) -> Result<DocumentStatus, GatewayError> {
        Ok(self
            .read_access(document_id)
            .await?
            .map_or(DocumentStatus::Deleted, |access| access.status))
    }

    async fn editor_access(
        &self,
        username: &str,
        document_id: DocumentId,
    ) -> Result<EditorAccess, GatewayError> {
        Ok(match self.read_access(document_id).await? {
            Some(access) => EditorAccess {
                status: access.status,
                can_edit: access.can_edit(username),
            },
            None => EditorAccess {
                status: DocumentStatus::Deleted,
                can_edit: false,
            },
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<AccessChange> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl PersistenceGateway for FileDocumentStore {
    async fn load_raster(&self, document_id: DocumentId) -> Result<PixelBuffer, LoadError> {
        let record = self
            .read_record(document_id)
            .await
            .map_err(|e| LoadError::Unavailable(e.to_string()))?
            .ok_or(LoadError::NotFound)?;
        if record.status == DocumentStatus::Deleted {
            return Err(LoadError::NotFound);
        }
        Ok(record.raster.decode()?)
    }

    async fn save_raster(
        &self,
        document_id: DocumentId,
        snapshot: &RasterSnapshot,
    ) -> Result<(), GatewayError> {
        let _guard = self.lock(document_id).await?;
        let mut record = self
            .read_record(document_id)
            .await?
            .ok_or(GatewayError::NotWritable(DocumentStatus::Deleted))?;
        if record.status != DocumentStatus::Active {
            return Err(GatewayError::NotWritable(record.status));
        }
        record.raster = snapshot.encode();
        self.write_record(document_id, &record).await?;
        Ok(())
    }
}
