use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use system::{
    ConnectionId, Delta, DeltaError, DocumentId, ParticipantInfo, PixelBuffer, RasterSnapshot,
    RejectReason, Revision, ServerLeaderDocument, SessionEvent, SessionSnapshot, Username,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use crate::error::SessionError;

pub type ConnectionTx = Sender<SessionEvent>;

/// A connection joined to a session, with the queue its events go to.
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub username: Username,
    pub document_id: DocumentId,
    tx: ConnectionTx,
}

impl Participant {
    pub fn new(
        connection_id: ConnectionId,
        username: Username,
        document_id: DocumentId,
        tx: ConnectionTx,
    ) -> Self {
        Self {
            connection_id,
            username,
            document_id,
            tx,
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            connection_id: self.connection_id,
            username: self.username.clone(),
        }
    }
}

/// What a new participant starts from.
#[derive(Debug)]
pub struct Joined {
    pub snapshot: RasterSnapshot,
    pub session_snapshot: SessionSnapshot,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Applied {
    pub revision: Revision,
    /// Participants the relayed delta was enqueued for.
    pub recipients: Vec<ConnectionId>,
}

struct SessionState {
    document: ServerLeaderDocument,
    participants: Vec<Participant>,
    retired: bool,
}

impl SessionState {
    fn session_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            participants: self.participants.iter().map(Participant::info).collect(),
        }
    }

    fn position(&self, connection_id: ConnectionId) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.connection_id == connection_id)
    }

    fn send_to(&mut self, connection_id: ConnectionId, event: SessionEvent) {
        let Some(index) = self.position(connection_id) else {
            return;
        };
        if let Err(e) = self.participants[index].tx.try_send(event) {
            let lagging = self.participants.remove(index);
            log_lagging(&lagging, &e);
            self.announce_departures(vec![lagging.info()]);
        }
    }

    /// Enqueues `event` for every participant but `except`. Participants
    /// whose queue is full or gone are dropped from the session.
    fn broadcast(&mut self, event: &SessionEvent, except: Option<ConnectionId>) -> Vec<ConnectionId> {
        let mut delivered = Vec::with_capacity(self.participants.len());
        let mut departed = Vec::new();
        self.participants.retain(|p| {
            if Some(p.connection_id) == except {
                return true;
            }
            match p.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered.push(p.connection_id);
                    true
                }
                Err(e) => {
                    log_lagging(p, &e);
                    departed.push(p.info());
                    false
                }
            }
        });
        self.announce_departures(departed);
        delivered
    }

    fn announce_departures(&mut self, mut departed: Vec<ParticipantInfo>) {
        while let Some(info) = departed.pop() {
            let event = SessionEvent::SomeoneLeft(info);
            self.participants.retain(|p| match p.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(e) => {
                    log_lagging(p, &e);
                    departed.push(p.info());
                    false
                }
            });
        }
    }
}

fn log_lagging(participant: &Participant, e: &TrySendError<SessionEvent>) {
    match e {
        TrySendError::Full(_) => log::warn!(
            "Dropping connection {} from {}: outbound queue is full",
            participant.connection_id,
            participant.document_id
        ),
        TrySendError::Closed(_) => log::debug!(
            "Dropping connection {} from {}: outbound queue is closed",
            participant.connection_id,
            participant.document_id
        ),
    }
}

/// The live editing state of one document.
///
/// All mutation happens under one lock, and events are enqueued before the
/// lock is released, so every participant observes deltas in the order they
/// were applied.
pub struct Session {
    document_id: DocumentId,
    // Fixed for the lifetime of the buffer.
    dimensions: (u32, u32),
    state: Mutex<SessionState>,
    persisted_revision: AtomicU64,
    save_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(document_id: DocumentId, buffer: PixelBuffer) -> Self {
        Self {
            document_id,
            dimensions: (buffer.width(), buffer.height()),
            state: Mutex::new(SessionState {
                document: ServerLeaderDocument::new(buffer),
                participants: Vec::new(),
                retired: false,
            }),
            persisted_revision: AtomicU64::new(0),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Width and height of the raster.
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    pub fn join(&self, participant: Participant) -> Result<Joined, SessionError> {
        let mut state = self.state.lock();
        if state.retired {
            return Err(SessionError::SessionRetired(self.document_id));
        }
        assert!(
            state.position(participant.connection_id).is_none(),
            "connection {} joined {} twice",
            participant.connection_id,
            self.document_id
        );
        let connection_id = participant.connection_id;
        let info = participant.info();
        state.participants.push(participant);
        let joined = Joined {
            snapshot: state.document.snapshot(),
            session_snapshot: state.session_snapshot(),
        };
        state.broadcast(&SessionEvent::SomeoneJoined(info), Some(connection_id));
        Ok(joined)
    }

    /// Applies a delta sent by `from` and relays it to everyone else.
    ///
    /// The sender receives a `DeltaAck` on success, or a `DeltaRejected`
    /// notice when the delta does not fit the raster.
    pub fn apply_delta(&self, from: ConnectionId, delta: &Delta) -> Result<Applied, SessionError> {
        let mut state = self.state.lock();
        let sender = match state.position(from) {
            Some(index) => state.participants[index].info(),
            None => return Err(SessionError::NotParticipant(from)),
        };
        match state.document.process_delta(delta) {
            Ok(revision) => {
                let event = SessionEvent::Delta {
                    from: sender,
                    revision,
                    delta: delta.clone(),
                };
                let recipients = state.broadcast(&event, Some(from));
                state.send_to(from, SessionEvent::DeltaAck { revision });
                Ok(Applied {
                    revision,
                    recipients,
                })
            }
            Err(DeltaError::OutOfBounds { offset, len }) => {
                state.send_to(
                    from,
                    SessionEvent::DeltaRejected(RejectReason::OutOfBounds {
                        offset,
                        len: len as u64,
                    }),
                );
                Err(SessionError::DeltaOutOfBounds { offset, len })
            }
        }
    }

    /// Notifies `to` that one of its frames was refused.
    pub fn reject(&self, to: ConnectionId, reason: RejectReason) {
        self.state
            .lock()
            .send_to(to, SessionEvent::DeltaRejected(reason));
    }

    /// Removes a participant and returns how many remain.
    pub fn leave(&self, connection_id: ConnectionId) -> usize {
        let mut state = self.state.lock();
        if let Some(index) = state.position(connection_id) {
            let participant = state.participants.remove(index);
            state.announce_departures(vec![participant.info()]);
        }
        state.participants.len()
    }

    pub fn current_revision(&self) -> Revision {
        self.state.lock().document.revision()
    }

    pub fn snapshot(&self) -> RasterSnapshot {
        self.state.lock().document.snapshot()
    }

    pub fn participants(&self) -> SessionSnapshot {
        self.state.lock().session_snapshot()
    }

    pub fn participant_count(&self) -> usize {
        self.state.lock().participants.len()
    }

    pub fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    /// Marks the session retired if nobody is in it. A retired session
    /// refuses joins; the registry must then load a fresh one.
    pub(crate) fn retire_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if state.participants.is_empty() {
            state.retired = true;
        }
        state.retired
    }

    pub(crate) fn retire(&self) {
        self.state.lock().retired = true;
    }

    pub fn persisted_revision(&self) -> Revision {
        self.persisted_revision.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_persisted(&self, revision: Revision) {
        self.persisted_revision.fetch_max(revision, Ordering::SeqCst);
    }

    pub(crate) fn save_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.save_lock
    }
}
