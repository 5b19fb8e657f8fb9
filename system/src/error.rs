use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RasterError {
    #[error("raster of {len} bytes does not match dimensions {width}x{height}")]
    DimensionsInvalid { width: u32, height: u32, len: usize },
    #[error("raster data is not valid base64: {0}")]
    Base64(String),
    #[error("raster data is not a valid deflate stream: {0}")]
    Inflate(String),
}

impl RasterError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DimensionsInvalid { .. } => "document_dimensions_invalid",
            Self::Base64(_) | Self::Inflate(_) => "raster_corrupt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeltaError {
    #[error("offset {offset} is out of bounds for a {len} byte buffer")]
    OutOfBounds { offset: u32, len: usize },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frame: {0}")]
    Binary(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FollowerError {
    #[error("expected an init event")]
    NotAnInitEvent,
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error("acknowledgement without a delta in flight")]
    UnexpectedAck,
}
