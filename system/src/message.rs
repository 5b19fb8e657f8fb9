use serde::{Deserialize, Serialize};

use crate::delta::Delta;
use crate::raster::EncodedRaster;
use crate::types::{ConnectionId, DocumentId, Revision, Username};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub connection_id: ConnectionId,
    pub username: Username,
}

/// Participants of a session in join order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub participants: Vec<ParticipantInfo>,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCommand {
    Delta(Delta),
    Ping,
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Init {
        document_id: DocumentId,
        revision: Revision,
        raster: EncodedRaster,
        session_snapshot: SessionSnapshot,
    },
    Delta {
        from: ParticipantInfo,
        revision: Revision,
        delta: Delta,
    },
    /// Sent to the author of a delta, in application order with relays.
    DeltaAck {
        revision: Revision,
    },
    DeltaRejected(RejectReason),
    SomeoneJoined(ParticipantInfo),
    SomeoneLeft(ParticipantInfo),
    Terminated(TerminationReason),
    Pong,
}

/// Why an inbound delta was dropped. The connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    OutOfBounds { offset: u32, len: u64 },
    TooLarge { entries: u64, max: u64 },
    Malformed,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfBounds { .. } => "delta_out_of_bounds",
            Self::TooLarge { .. } => "delta_too_large",
            Self::Malformed => "malformed_message",
        }
    }
}

/// Sent once right before the server closes a connection mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    DocumentDeleted,
    AccessRevoked,
    DocumentPublished,
}

impl TerminationReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DocumentDeleted => "document_deleted",
            Self::AccessRevoked => "access_revoked",
            Self::DocumentPublished => "document_published",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_serializes_delta_command_as_tagged_offset_map() {
        let command = SessionCommand::Delta(vec![(0, 255), (3, 255)].into_iter().collect());
        let json = serde_json::to_string(&command).expect("");
        assert_eq!(json, r#"{"delta":{"0":255,"3":255}}"#);
    }

    #[test]
    fn it_serializes_termination_as_snake_case() {
        let event = SessionEvent::Terminated(TerminationReason::AccessRevoked);
        let json = serde_json::to_string(&event).expect("");
        assert_eq!(json, r#"{"terminated":"access_revoked"}"#);
        assert_eq!(TerminationReason::DocumentPublished.to_string(), "document_published");
    }
}
