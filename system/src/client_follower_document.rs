use std::collections::VecDeque;

use crate::delta::Delta;
use crate::error::{DeltaError, FollowerError};
use crate::message::{SessionEvent, SessionSnapshot};
use crate::raster::{PixelBuffer, Rgba};
use crate::types::{DocumentId, Revision};

/// Client replica of a document.
///
/// `confirmed` mirrors the server at `revision`. Local strokes are kept on
/// top of it until the server acknowledges them, so a relayed delta that the
/// server applied before ours never hides our own edits.
pub struct ClientFollowerDocument {
    document_id: DocumentId,
    revision: Revision,
    confirmed: PixelBuffer,
    in_flight: VecDeque<Delta>,
    pending: Delta,
    local: PixelBuffer,
    session_snapshot: SessionSnapshot,
}

impl ClientFollowerDocument {
    pub fn from_init(event: &SessionEvent) -> Result<Self, FollowerError> {
        match event {
            SessionEvent::Init {
                document_id,
                revision,
                raster,
                session_snapshot,
            } => {
                let confirmed = raster.decode()?;
                log::debug!("ClientFollowerDocument created: {}", document_id);
                Ok(Self {
                    document_id: *document_id,
                    revision: *revision,
                    local: confirmed.clone(),
                    confirmed,
                    in_flight: VecDeque::new(),
                    pending: Delta::new(),
                    session_snapshot: session_snapshot.clone(),
                })
            }
            _ => Err(FollowerError::NotAnInitEvent),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// What the user sees: server state plus our unacknowledged strokes.
    pub fn buffer(&self) -> &PixelBuffer {
        &self.local
    }

    pub fn session_snapshot(&self) -> &SessionSnapshot {
        &self.session_snapshot
    }

    pub fn has_unacknowledged(&self) -> bool {
        !self.in_flight.is_empty() || !self.pending.is_empty()
    }

    pub fn paint(&mut self, x: u32, y: u32, color: Rgba) -> Result<(), DeltaError> {
        let mut stroke = Delta::new();
        if !stroke.paint(self.local.width(), x, y, color) {
            return Err(DeltaError::OutOfBounds {
                offset: u32::MAX,
                len: self.local.len(),
            });
        }
        self.local.apply(&stroke)?;
        self.pending.merge(&stroke);
        Ok(())
    }

    /// Closes the current gesture and returns the delta to send, if any.
    pub fn end_gesture(&mut self) -> Option<Delta> {
        if self.pending.is_empty() {
            return None;
        }
        let delta = std::mem::take(&mut self.pending);
        self.in_flight.push_back(delta.clone());
        Some(delta)
    }

    pub fn handle_event(&mut self, event: &SessionEvent) -> Result<(), FollowerError> {
        match event {
            SessionEvent::Delta {
                revision, delta, ..
            } => {
                self.confirmed.apply(delta)?;
                self.revision = *revision;
                self.rebuild_local();
            }
            SessionEvent::DeltaAck { revision } => {
                let delta = self
                    .in_flight
                    .pop_front()
                    .ok_or(FollowerError::UnexpectedAck)?;
                self.confirmed.apply(&delta)?;
                self.revision = *revision;
            }
            SessionEvent::DeltaRejected(reason) => {
                log::warn!("Stroke rejected by server: {:?}", reason);
                self.in_flight.pop_front();
                self.rebuild_local();
            }
            SessionEvent::SomeoneJoined(participant) => {
                self.session_snapshot.participants.push(participant.clone());
            }
            SessionEvent::SomeoneLeft(participant) => {
                self.session_snapshot
                    .participants
                    .retain(|p| p.connection_id != participant.connection_id);
            }
            SessionEvent::Init { .. } | SessionEvent::Terminated(_) | SessionEvent::Pong => {}
        }
        Ok(())
    }

    fn rebuild_local(&mut self) {
        let mut local = self.confirmed.clone();
        for delta in self.in_flight.iter().chain(std::iter::once(&self.pending)) {
            if let Err(e) = local.apply(delta) {
                log::warn!("Dropping local stroke that no longer fits: {}", e);
            }
        }
        self.local = local;
    }
}
