use system::{ConnectionId, DocumentId, RasterError};
use thiserror::Error;

use crate::gateway::{GatewayError, LoadError};
use crate::identity::AuthError;

/// Why a connection attempt was turned away before joining a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),
    #[error("not allowed to edit this document")]
    Forbidden,
    #[error("document not found")]
    DocumentNotFound,
    #[error("document raster is invalid: {0}")]
    DocumentDimensionsInvalid(RasterError),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ConnectError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "malformed_request",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::DocumentNotFound => "document_not_found",
            Self::DocumentDimensionsInvalid(_) => "document_dimensions_invalid",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

impl From<LoadError> for ConnectError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::NotFound => Self::DocumentNotFound,
            LoadError::DimensionsInvalid(e) => Self::DocumentDimensionsInvalid(e),
            LoadError::Unavailable(reason) => Self::Unavailable(reason),
        }
    }
}

impl From<GatewayError> for ConnectError {
    fn from(e: GatewayError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session for {0} has been retired")]
    SessionRetired(DocumentId),
    #[error("delta offset {offset} is out of bounds for a {len} byte raster")]
    DeltaOutOfBounds { offset: u32, len: usize },
    #[error("connection {0} is not a participant")]
    NotParticipant(ConnectionId),
}
