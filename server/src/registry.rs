use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use system::DocumentId;
use tokio::sync::OnceCell;

use crate::config::PersistenceConfig;
use crate::error::SessionError;
use crate::gateway::{AuthorizationOracle, LoadError, PersistenceGateway};
use crate::persistence::{persist, SaveOutcome};
use crate::session::{Joined, Participant, Session};

type Slot = Arc<OnceCell<Arc<Session>>>;

/// A slot looked up by [`SessionRegistry::get_or_create`]. When it goes out
/// of scope still empty, because the load failed or the caller was
/// cancelled mid-load, it is dropped from the map unless another caller is
/// still waiting on it.
struct PendingSlot<'a> {
    slots: &'a Mutex<HashMap<DocumentId, Slot>>,
    document_id: DocumentId,
    slot: Slot,
}

impl PendingSlot<'_> {
    fn is_current(&self) -> bool {
        self.slots
            .lock()
            .get(&self.document_id)
            .map_or(false, |s| Arc::ptr_eq(s, &self.slot))
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.slot.initialized() {
            return;
        }
        let mut slots = self.slots.lock();
        let current = slots
            .get(&self.document_id)
            .map_or(false, |s| Arc::ptr_eq(s, &self.slot));
        // Held by the map and by us only.
        if current && Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.document_id);
        }
    }
}

/// Owns the live sessions, at most one per document.
///
/// The map lock is only held for bookkeeping. Loading a raster happens in
/// the document's slot, so concurrent first joins share a single load and
/// other documents are never blocked by it.
pub struct SessionRegistry {
    gateway: Arc<dyn PersistenceGateway>,
    oracle: Arc<dyn AuthorizationOracle>,
    persistence: PersistenceConfig,
    slots: Mutex<HashMap<DocumentId, Slot>>,
}

impl SessionRegistry {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        oracle: Arc<dyn AuthorizationOracle>,
        persistence: PersistenceConfig,
    ) -> Self {
        Self {
            gateway,
            oracle,
            persistence,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live session for a document, loading it if needed. The
    /// flag tells whether this call created it.
    pub async fn get_or_create(
        &self,
        document_id: DocumentId,
    ) -> Result<(Arc<Session>, bool), LoadError> {
        loop {
            let pending = PendingSlot {
                slots: &self.slots,
                document_id,
                slot: self
                    .slots
                    .lock()
                    .entry(document_id)
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone(),
            };

            let mut created = false;
            let session = pending
                .slot
                .get_or_try_init(|| {
                    created = true;
                    self.load(document_id)
                })
                .await?
                .clone();

            if pending.is_current() {
                return Ok((session, created));
            }
            // The slot was dropped while we waited on it.
        }
    }

    async fn load(&self, document_id: DocumentId) -> Result<Arc<Session>, LoadError> {
        let buffer = self.gateway.load_raster(document_id).await.map_err(|e| {
            log::warn!("Failed to load {}: {}", document_id, e);
            e
        })?;
        log::info!(
            "Opened session for {} ({}x{})",
            document_id,
            buffer.width(),
            buffer.height()
        );
        Ok(Arc::new(Session::new(document_id, buffer)))
    }

    /// Joins `participant` to the session of its document, retrying when it
    /// races with the eviction of that session.
    pub async fn join(
        &self,
        participant: &Participant,
    ) -> Result<(Arc<Session>, Joined), LoadError> {
        loop {
            let (session, _) = self.get_or_create(participant.document_id).await?;
            match session.join(participant.clone()) {
                Ok(joined) => {
                    log::info!(
                        "{} (connection {}) joined {} at revision {}",
                        participant.username,
                        participant.connection_id,
                        participant.document_id,
                        joined.snapshot.revision()
                    );
                    return Ok((session, joined));
                }
                Err(SessionError::SessionRetired(_)) => {
                    log::debug!("Session {} retired during join, reloading", participant.document_id);
                }
                Err(e) => unreachable!("join only fails on retired sessions: {}", e),
            }
        }
    }

    pub fn get(&self, document_id: DocumentId) -> Option<Arc<Session>> {
        self.slots
            .lock()
            .get(&document_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Evicts a session unconditionally. Its participants keep their
    /// connections until they leave; later joins load a fresh session.
    pub fn remove(&self, document_id: DocumentId) -> Option<Arc<Session>> {
        let slot = self.slots.lock().remove(&document_id)?;
        let session = slot.get().cloned()?;
        session.retire();
        Some(session)
    }

    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self
            .slots
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        sessions.sort_by_key(|s| s.document_id());
        sessions
    }

    /// Called once the last participant left: saves the raster and evicts
    /// the session unless someone joined again in the meantime.
    pub async fn release(&self, session: Arc<Session>) -> SaveOutcome {
        let outcome = self.persist(&session).await;
        if self.evict_if_empty(&session) {
            log::info!(
                "Closed session for {} at revision {}",
                session.document_id(),
                session.current_revision()
            );
        } else {
            log::debug!("Session {} was rejoined during save", session.document_id());
        }
        outcome
    }

    /// Saves every live session; used on shutdown.
    pub async fn persist_all(&self) {
        for session in self.live_sessions() {
            self.persist(&session).await;
        }
    }

    async fn persist(&self, session: &Session) -> SaveOutcome {
        persist(&*self.gateway, &*self.oracle, &self.persistence, session).await
    }

    fn evict_if_empty(&self, session: &Arc<Session>) -> bool {
        let mut slots = self.slots.lock();
        let document_id = session.document_id();
        let current = slots
            .get(&document_id)
            .and_then(|slot| slot.get())
            .map_or(false, |s| Arc::ptr_eq(s, session));
        if !current {
            return session.is_retired();
        }
        if session.retire_if_empty() {
            slots.remove(&document_id);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::DocumentStatus;
    use crate::memory_store::MemoryDocumentStore;
    use std::time::Duration;
    use system::uuid::Uuid;
    use system::{Delta, PixelBuffer, RasterError, SessionEvent};
    use tokio::sync::mpsc::{channel, Receiver};

    fn registry(store: &Arc<MemoryDocumentStore>) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            store.clone(),
            store.clone(),
            PersistenceConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
            },
        ))
    }

    fn document(store: &MemoryDocumentStore) -> DocumentId {
        let id = Uuid::new_v4();
        store.insert(id, "alice", PixelBuffer::blank(2, 2).expect(""));
        id
    }

    fn participant(
        document_id: DocumentId,
        connection_id: u32,
    ) -> (Participant, Receiver<SessionEvent>) {
        let (tx, rx) = channel(16);
        (
            Participant::new(connection_id, "alice".into(), document_id, tx),
            rx,
        )
    }

    fn paint(session: &Session, from: u32) {
        let mut delta = Delta::new();
        delta.insert(0, 255);
        session.apply_delta(from, &delta).expect("");
    }

    #[tokio::test]
    async fn it_creates_single_session_for_concurrent_joins() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.delay_loads(Duration::from_millis(20));
        let registry = registry(&store);
        let id = document(&store);

        let handles: Vec<_> = (1..=8)
            .map(|connection_id| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let (p, rx) = participant(id, connection_id);
                    let (session, _) = registry.join(&p).await.expect("");
                    (session, rx)
                })
            })
            .collect();

        let mut joined = Vec::new();
        for handle in handles {
            joined.push(handle.await.expect(""));
        }
        let first = joined[0].0.clone();
        assert!(joined.iter().all(|(s, _)| Arc::ptr_eq(s, &first)));
        assert_eq!(first.participant_count(), 8);
        assert_eq!(store.load_count(), 1);
        assert_eq!(registry.live_sessions().len(), 1);
    }

    #[tokio::test]
    async fn it_persists_once_and_evicts_when_last_leaves() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let id = document(&store);
        let (a, _rx_a) = participant(id, 1);
        let (b, _rx_b) = participant(id, 2);

        let (session, _) = registry.join(&a).await.expect("");
        registry.join(&b).await.expect("");
        paint(&session, 1);

        assert_eq!(session.leave(1), 1);
        assert_eq!(session.leave(2), 0);
        assert_eq!(registry.release(session.clone()).await, SaveOutcome::Saved(1));
        assert_eq!(store.save_count(), 1);
        assert!(registry.get(id).is_none());
        assert!(session.is_retired());

        // Releasing again is harmless.
        assert_eq!(registry.release(session).await, SaveOutcome::UpToDate);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn it_keeps_session_rejoined_during_save() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.delay_saves(Duration::from_millis(50));
        let registry = registry(&store);
        let id = document(&store);
        let (a, _rx_a) = participant(id, 1);
        let (b, _rx_b) = participant(id, 2);

        let (session, _) = registry.join(&a).await.expect("");
        paint(&session, 1);
        assert_eq!(session.leave(1), 0);

        let release = tokio::spawn({
            let registry = registry.clone();
            let session = session.clone();
            async move { registry.release(session).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (rejoined, joined) = registry.join(&b).await.expect("");
        assert_eq!(release.await.expect(""), SaveOutcome::Saved(1));

        assert!(Arc::ptr_eq(&rejoined, &session));
        assert_eq!(joined.snapshot.revision(), 1);
        assert!(registry.get(id).is_some());
        assert!(!session.is_retired());
    }

    #[tokio::test]
    async fn it_loads_fresh_session_after_eviction() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let id = document(&store);
        let (a, _rx_a) = participant(id, 1);

        let (session, _) = registry.join(&a).await.expect("");
        paint(&session, 1);
        session.leave(1);
        registry.release(session.clone()).await;

        let (b, _rx_b) = participant(id, 2);
        let (fresh, joined) = registry.join(&b).await.expect("");
        assert!(!Arc::ptr_eq(&fresh, &session));
        assert_eq!(joined.snapshot.revision(), 0);
        assert_eq!(joined.snapshot.buffer().as_bytes()[0], 255);
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn it_skips_saving_published_documents() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let id = document(&store);
        let (a, _rx_a) = participant(id, 1);

        let (session, _) = registry.join(&a).await.expect("");
        paint(&session, 1);
        store.set_status(id, DocumentStatus::Published);
        session.leave(1);

        assert_eq!(
            registry.release(session).await,
            SaveOutcome::Skipped(DocumentStatus::Published)
        );
        assert_eq!(store.save_count(), 0);
        assert!(registry.get(id).is_none());
    }

    #[tokio::test]
    async fn it_evicts_after_exhausting_save_attempts() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let id = document(&store);
        store.fail_next_saves(5);
        let (a, _rx_a) = participant(id, 1);

        let (session, _) = registry.join(&a).await.expect("");
        paint(&session, 1);
        session.leave(1);

        assert_eq!(
            registry.release(session).await,
            SaveOutcome::Failed { attempts: 2 }
        );
        assert!(registry.get(id).is_none());
        assert_eq!(store.stored(id).expect("").as_bytes()[0], 0);
    }

    #[tokio::test]
    async fn it_leaves_no_slot_after_failed_load() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let missing = Uuid::new_v4();
        let broken = Uuid::new_v4();
        store.insert_unloadable(
            broken,
            "alice",
            LoadError::DimensionsInvalid(RasterError::DimensionsInvalid {
                width: 2,
                height: 2,
                len: 3,
            }),
        );

        assert_eq!(
            registry.get_or_create(missing).await.map(|_| ()),
            Err(LoadError::NotFound)
        );
        assert!(matches!(
            registry.get_or_create(broken).await,
            Err(LoadError::DimensionsInvalid(_))
        ));
        assert!(registry.slots.lock().is_empty());
    }

    #[tokio::test]
    async fn it_leaves_no_slot_when_load_is_cancelled() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.delay_loads(Duration::from_millis(200));
        let registry = registry(&store);
        let id = document(&store);

        let attempt = tokio::time::timeout(Duration::from_millis(20), registry.get_or_create(id));
        assert!(attempt.await.is_err());
        assert!(registry.slots.lock().is_empty());
        assert!(registry.get(id).is_none());
    }

    #[tokio::test]
    async fn it_keeps_slot_while_another_join_waits_on_it() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.delay_loads(Duration::from_millis(100));
        let registry = registry(&store);
        let id = document(&store);

        let waiting = tokio::spawn({
            let registry = registry.clone();
            async move { registry.get_or_create(id).await.map(|(s, _)| s) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let cancelled = tokio::time::timeout(Duration::from_millis(10), registry.get_or_create(id));
        assert!(cancelled.await.is_err());

        let session = waiting.await.expect("").expect("");
        assert!(Arc::ptr_eq(&registry.get(id).expect(""), &session));
    }

    #[tokio::test]
    async fn it_removes_session_and_reloads_on_next_join() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let id = document(&store);
        let (a, _rx_a) = participant(id, 1);
        let (b, _rx_b) = participant(id, 2);

        let (session, _) = registry.join(&a).await.expect("");
        let removed = registry.remove(id).expect("");
        assert!(Arc::ptr_eq(&removed, &session));
        assert!(registry.get(id).is_none());
        assert!(matches!(
            session.join(b.clone()),
            Err(SessionError::SessionRetired(_))
        ));

        let (fresh, _) = registry.join(&b).await.expect("");
        assert!(!Arc::ptr_eq(&fresh, &session));
        assert_eq!(store.load_count(), 2);
    }

    #[tokio::test]
    async fn it_saves_every_live_session_on_shutdown() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(&store);
        let mut receivers = Vec::new();
        for connection_id in 1..=3 {
            let id = document(&store);
            let (p, rx) = participant(id, connection_id);
            let (session, _) = registry.join(&p).await.expect("");
            paint(&session, connection_id);
            receivers.push(rx);
        }

        registry.persist_all().await;
        assert_eq!(store.save_count(), 3);
        assert_eq!(registry.live_sessions().len(), 3);
    }
}
