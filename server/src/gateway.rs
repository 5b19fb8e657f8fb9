//! Contracts of the project store this engine depends on.
//!
//! The engine never touches project records directly: it asks an
//! [`AuthorizationOracle`] who may edit what, and loads / saves rasters
//! through a [`PersistenceGateway`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use system::{DocumentId, PixelBuffer, RasterError, RasterSnapshot, TerminationReason, Username};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Active,
    Deleted,
    Published,
}

impl DocumentStatus {
    /// Why an editor must be disconnected when a document reaches this status.
    pub fn termination_reason(self) -> Option<TerminationReason> {
        match self {
            Self::Active => None,
            Self::Deleted => Some(TerminationReason::DocumentDeleted),
            Self::Published => Some(TerminationReason::DocumentPublished),
        }
    }
}

/// Pushed by the oracle whenever access to a document may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessChange {
    StatusChanged {
        document_id: DocumentId,
        status: DocumentStatus,
    },
    AccessRevoked {
        document_id: DocumentId,
        username: Username,
    },
}

impl AccessChange {
    pub fn concerns(&self, target: DocumentId, user: &str) -> bool {
        match self {
            Self::StatusChanged { document_id, .. } => *document_id == target,
            Self::AccessRevoked {
                document_id,
                username,
            } => *document_id == target && username == user,
        }
    }
}

/// Status of a document together with one editor's right to edit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditorAccess {
    pub status: DocumentStatus,
    pub can_edit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("project store unavailable: {0}")]
    Unavailable(String),
    #[error("document is {0:?} and can no longer be written")]
    NotWritable(DocumentStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("document not found")]
    NotFound,
    #[error("stored raster is invalid: {0}")]
    DimensionsInvalid(#[from] RasterError),
    #[error("project store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AuthorizationOracle: Send + Sync {
    /// Owner or accepted collaborator.
    async fn can_edit(&self, username: &str, document_id: DocumentId) -> Result<bool, GatewayError>;

    async fn document_status(&self, document_id: DocumentId) -> Result<DocumentStatus, GatewayError>;

    /// Both answers at once. Stores that keep them in one record should
    /// override this to read it a single time.
    async fn editor_access(
        &self,
        username: &str,
        document_id: DocumentId,
    ) -> Result<EditorAccess, GatewayError> {
        Ok(EditorAccess {
            status: self.document_status(document_id).await?,
            can_edit: self.can_edit(username, document_id).await?,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<AccessChange>;
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn load_raster(&self, document_id: DocumentId) -> Result<PixelBuffer, LoadError>;

    /// Overwrites the stored raster. Implementations refuse with
    /// [`GatewayError::NotWritable`] once the document left `Active`.
    async fn save_raster(
        &self,
        document_id: DocumentId,
        snapshot: &RasterSnapshot,
    ) -> Result<(), GatewayError>;
}

/// Re-checks an editor's access. Returns the reason to disconnect, if any.
///
/// An unreachable oracle keeps the editor connected; the next check decides.
pub async fn revocation(
    oracle: &dyn AuthorizationOracle,
    username: &str,
    document_id: DocumentId,
) -> Option<TerminationReason> {
    match oracle.editor_access(username, document_id).await {
        Ok(EditorAccess { status, can_edit }) => match status.termination_reason() {
            Some(reason) => Some(reason),
            None if can_edit => None,
            None => Some(TerminationReason::AccessRevoked),
        },
        Err(e) => {
            log::warn!("Access check for {} on {} failed: {}", username, document_id, e);
            None
        }
    }
}
