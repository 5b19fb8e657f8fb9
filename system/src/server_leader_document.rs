use crate::delta::Delta;
use crate::error::DeltaError;
use crate::raster::{PixelBuffer, RasterSnapshot};
use crate::types::Revision;

/// Authoritative copy of a document held by the server.
pub struct ServerLeaderDocument {
    buffer: PixelBuffer,
    revision: Revision,
}

impl ServerLeaderDocument {
    pub fn new(buffer: PixelBuffer) -> Self {
        Self {
            buffer,
            revision: 0,
        }
    }

    /// Applies the whole delta and bumps the revision by one, or leaves
    /// both untouched.
    pub fn process_delta(&mut self, delta: &Delta) -> Result<Revision, DeltaError> {
        self.buffer.apply(delta)?;
        self.revision += 1;
        Ok(self.revision)
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn snapshot(&self) -> RasterSnapshot {
        RasterSnapshot::new(&self.buffer, self.revision)
    }
}

impl std::fmt::Debug for ServerLeaderDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLeaderDocument")
            .field("buffer", &self.buffer)
            .field("revision", &self.revision)
            .finish()
    }
}
