use serde::Serialize;
use system::{DocumentId, ParticipantInfo, Revision};

use crate::session::Session;

/// Read-only view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDescription {
    pub document_id: DocumentId,
    pub width: u32,
    pub height: u32,
    pub revision: Revision,
    pub persisted_revision: Revision,
    pub participants: Vec<ParticipantInfo>,
}

impl SessionDescription {
    pub fn describe(session: &Session) -> Self {
        let (width, height) = session.dimensions();
        Self {
            document_id: session.document_id(),
            width,
            height,
            revision: session.current_revision(),
            persisted_revision: session.persisted_revision(),
            participants: session.participants().participants,
        }
    }
}
