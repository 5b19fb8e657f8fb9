use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use system::{DocumentId, PixelBuffer, RasterSnapshot, Username};
use tokio::sync::broadcast;

use crate::gateway::{
    AccessChange, AuthorizationOracle, DocumentStatus, GatewayError, LoadError,
    PersistenceGateway,
};

struct MemoryDocument {
    owner: Username,
    collaborators: HashSet<Username>,
    status: DocumentStatus,
    raster: Result<PixelBuffer, LoadError>,
}

/// Project store kept entirely in memory.
///
/// Besides serving as both gateways it counts loads and saves and can be
/// told to fail or stall, so the engine's persistence paths can be driven
/// deterministically.
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<DocumentId, MemoryDocument>>,
    changes: broadcast::Sender<AccessChange>,
    loads: AtomicUsize,
    saves: AtomicUsize,
    failing_saves: AtomicU32,
    delays: Mutex<StoreDelays>,
}

#[derive(Default, Clone, Copy)]
struct StoreDelays {
    load: Option<Duration>,
    save: Option<Duration>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            documents: Mutex::new(HashMap::new()),
            changes,
            loads: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
            failing_saves: AtomicU32::new(0),
            delays: Mutex::new(StoreDelays::default()),
        }
    }

    pub fn insert(&self, document_id: DocumentId, owner: &str, buffer: PixelBuffer) {
        self.insert_raster(document_id, owner, Ok(buffer));
    }

    /// Stores a document whose raster cannot be loaded.
    pub fn insert_unloadable(&self, document_id: DocumentId, owner: &str, error: LoadError) {
        self.insert_raster(document_id, owner, Err(error));
    }

    fn insert_raster(
        &self,
        document_id: DocumentId,
        owner: &str,
        raster: Result<PixelBuffer, LoadError>,
    ) {
        self.documents.lock().insert(
            document_id,
            MemoryDocument {
                owner: owner.to_owned(),
                collaborators: HashSet::new(),
                status: DocumentStatus::Active,
                raster,
            },
        );
    }

    pub fn add_collaborator(&self, document_id: DocumentId, username: &str) {
        if let Some(document) = self.documents.lock().get_mut(&document_id) {
            document.collaborators.insert(username.to_owned());
        }
    }

    pub fn revoke_collaborator(&self, document_id: DocumentId, username: &str) {
        if self.revoke_collaborator_unannounced(document_id, username) {
            let _ = self.changes.send(AccessChange::AccessRevoked {
                document_id,
                username: username.to_owned(),
            });
        }
    }

    /// Revokes without a notice on the push channel, the way a change made
    /// by another process looks. Returns whether `username` was a collaborator.
    pub fn revoke_collaborator_unannounced(&self, document_id: DocumentId, username: &str) -> bool {
        self.documents
            .lock()
            .get_mut(&document_id)
            .map_or(false, |document| document.collaborators.remove(username))
    }

    pub fn set_status(&self, document_id: DocumentId, status: DocumentStatus) {
        if let Some(document) = self.documents.lock().get_mut(&document_id) {
            document.status = status;
        }
        let _ = self.changes.send(AccessChange::StatusChanged {
            document_id,
            status,
        });
    }

    /// The raster as last saved (or inserted).
    pub fn stored(&self, document_id: DocumentId) -> Option<PixelBuffer> {
        self.documents
            .lock()
            .get(&document_id)
            .and_then(|document| document.raster.as_ref().ok().cloned())
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Successful saves only.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    pub fn delay_loads(&self, delay: Duration) {
        self.delays.lock().load = Some(delay);
    }

    pub fn delay_saves(&self, delay: Duration) {
        self.delays.lock().save = Some(delay);
    }

    fn take_failure(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthorizationOracle for MemoryDocumentStore {
    async fn can_edit(&self, username: &str, document_id: DocumentId) -> Result<bool, GatewayError> {
        Ok(self
            .documents
            .lock()
            .get(&document_id)
            .map_or(false, |document| {
                document.owner == username || document.collaborators.contains(username)
            }))
    }

    async fn document_status(&self, document_id: DocumentId) -> Result<DocumentStatus, GatewayError> {
        Ok(self
            .documents
            .lock()
            .get(&document_id)
            .map_or(DocumentStatus::Deleted, |document| document.status))
    }

    fn subscribe(&self) -> broadcast::Receiver<AccessChange> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryDocumentStore {
    async fn load_raster(&self, document_id: DocumentId) -> Result<PixelBuffer, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().load;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.documents.lock().get(&document_id) {
            Some(document) if document.status != DocumentStatus::Deleted => {
                document.raster.clone()
            }
            _ => Err(LoadError::NotFound),
        }
    }

    async fn save_raster(
        &self,
        document_id: DocumentId,
        snapshot: &RasterSnapshot,
    ) -> Result<(), GatewayError> {
        let delay = self.delays.lock().save;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_failure() {
            return Err(GatewayError::Unavailable("scripted failure".into()));
        }
        let mut documents = self.documents.lock();
        let document = documents
            .get_mut(&document_id)
            .ok_or(GatewayError::NotWritable(DocumentStatus::Deleted))?;
        if document.status != DocumentStatus::Active {
            return Err(GatewayError::NotWritable(document.status));
        }
        document.raster = Ok(snapshot.buffer().clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
