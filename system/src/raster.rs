use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::delta::Delta;
use crate::error::{DeltaError, RasterError};
use crate::types::Revision;

pub const CHANNELS: usize = 4;

/// Largest accepted width or height, in pixels.
pub const MAX_DIMENSION: u32 = 8192;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba::new(0, 0, 0, 0);
    pub const WHITE: Rgba = Rgba::new(255, 255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn channels(self) -> [u8; CHANNELS] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Byte length of a `width` x `height` RGBA raster, or `None` when either
/// side is zero or larger than [`MAX_DIMENSION`].
pub fn raster_len(width: u32, height: u32) -> Option<usize> {
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return None;
    }
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(CHANNELS)
}

/// Dense row-major RGBA raster with dimensions fixed at construction.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    bytes: Vec<u8>,
}

impl PixelBuffer {
    pub fn blank(width: u32, height: u32) -> Result<Self, RasterError> {
        let len = raster_len(width, height).ok_or(RasterError::DimensionsInvalid {
            width,
            height,
            len: 0,
        })?;
        Ok(Self {
            width,
            height,
            bytes: vec![0; len],
        })
    }

    pub fn from_bytes(width: u32, height: u32, bytes: Vec<u8>) -> Result<Self, RasterError> {
        match raster_len(width, height) {
            Some(len) if len == bytes.len() => Ok(Self {
                width,
                height,
                bytes,
            }),
            _ => Err(RasterError::DimensionsInvalid {
                width,
                height,
                len: bytes.len(),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y as usize * self.width as usize + x as usize) * CHANNELS;
        let p = &self.bytes[start..start + CHANNELS];
        Some(Rgba::new(p[0], p[1], p[2], p[3]))
    }

    /// Writes every byte of `delta`, or nothing at all if any offset falls
    /// outside the buffer.
    pub fn apply(&mut self, delta: &Delta) -> Result<(), DeltaError> {
        delta.check_bounds(self.len())?;
        for (offset, value) in delta.iter() {
            self.bytes[offset as usize] = value;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("size", &self.bytes.len())
            .finish()
    }
}

/// Immutable copy of a buffer taken at a given revision.
#[derive(Clone, PartialEq, Eq)]
pub struct RasterSnapshot {
    buffer: PixelBuffer,
    revision: Revision,
}

impl RasterSnapshot {
    pub fn new(buffer: &PixelBuffer, revision: Revision) -> Self {
        Self {
            buffer: buffer.clone(),
            revision,
        }
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> PixelBuffer {
        self.buffer
    }

    pub fn encode(&self) -> EncodedRaster {
        EncodedRaster::encode(&self.buffer)
    }
}

impl std::fmt::Debug for RasterSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterSnapshot")
            .field("width", &self.buffer.width)
            .field("height", &self.buffer.height)
            .field("size", &self.buffer.len())
            .field("revision", &self.revision)
            .finish()
    }
}

/// Zlib-compressed, base64-encoded raster with explicit dimensions. This is
/// both the storage form and the payload of the initial snapshot message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedRaster {
    pub width: u32,
    pub height: u32,
    pub data: String,
}

impl EncodedRaster {
    pub fn encode(buffer: &PixelBuffer) -> Self {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(buffer.as_bytes())
            .expect("writing into a Vec must succeed");
        let compressed = encoder.finish().expect("writing into a Vec must succeed");
        Self {
            width: buffer.width(),
            height: buffer.height(),
            data: STANDARD.encode(compressed),
        }
    }

    pub fn decode(&self) -> Result<PixelBuffer, RasterError> {
        let expected = raster_len(self.width, self.height).ok_or(RasterError::DimensionsInvalid {
            width: self.width,
            height: self.height,
            len: 0,
        })?;
        let compressed = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| RasterError::Base64(e.to_string()))?;

        // One byte past the expected length is enough to detect oversize input.
        let mut bytes = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .take(expected as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| RasterError::Inflate(e.to_string()))?;

        PixelBuffer::from_bytes(self.width, self.height, bytes)
    }
}

impl std::fmt::Debug for EncodedRaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedRaster")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("encoded_size", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_rejects_mismatched_dimensions() {
        let result = PixelBuffer::from_bytes(4, 1, vec![0; 15]);
        assert_eq!(
            result,
            Err(RasterError::DimensionsInvalid {
                width: 4,
                height: 1,
                len: 15
            })
        );
        assert!(PixelBuffer::blank(0, 10).is_err());
    }

    #[test]
    fn it_reads_pixels_row_major() {
        let mut bytes = vec![0; 2 * 2 * 4];
        bytes[12..16].copy_from_slice(&[1, 2, 3, 4]);
        let buffer = PixelBuffer::from_bytes(2, 2, bytes).expect("");
        assert_eq!(buffer.pixel(1, 1), Some(Rgba::new(1, 2, 3, 4)));
        assert_eq!(buffer.pixel(0, 1), Some(Rgba::TRANSPARENT));
        assert_eq!(buffer.pixel(2, 0), None);
    }

    #[test]
    fn it_leaves_buffer_untouched_on_out_of_bounds_delta() {
        let mut buffer = PixelBuffer::blank(4, 1).expect("");
        let delta: Delta = vec![(0, 255), (16, 255)].into_iter().collect();
        assert_eq!(
            buffer.apply(&delta),
            Err(DeltaError::OutOfBounds {
                offset: 16,
                len: 16
            })
        );
        assert!(buffer.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn it_restores_exact_bytes_from_encoded_raster() {
        let bytes = (0..64u32).map(|v| (v * 7 % 256) as u8).collect::<Vec<_>>();
        let buffer = PixelBuffer::from_bytes(4, 4, bytes).expect("");
        let encoded = RasterSnapshot::new(&buffer, 3).encode();
        assert_eq!(encoded.decode().expect(""), buffer);
    }

    #[test]
    fn it_rejects_encoded_raster_with_wrong_dimensions() {
        let buffer = PixelBuffer::blank(4, 4).expect("");
        let mut encoded = EncodedRaster::encode(&buffer);
        encoded.height = 3;
        assert!(matches!(
            encoded.decode(),
            Err(RasterError::DimensionsInvalid { len: 49, .. })
        ));

        encoded.data = "not base64!".into();
        assert!(matches!(encoded.decode(), Err(RasterError::Base64(_))));
    }

    #[test]
    fn it_refuses_oversized_dimensions_without_allocating() {
        let mut encoded = EncodedRaster::encode(&PixelBuffer::blank(1, 1).expect(""));
        encoded.width = 1 << 30;
        encoded.height = 1 << 30;
        assert!(matches!(
            encoded.decode(),
            Err(RasterError::DimensionsInvalid { len: 0, .. })
        ));

        assert!(PixelBuffer::blank(1 << 30, 1 << 30).is_err());
        assert!(PixelBuffer::blank(MAX_DIMENSION + 1, 1).is_err());
        assert_eq!(raster_len(MAX_DIMENSION, 1), Some(MAX_DIMENSION as usize * CHANNELS));
    }

    #[test]
    fn it_stops_inflating_past_declared_length() {
        let buffer = PixelBuffer::blank(MAX_DIMENSION, 4).expect("");
        let mut encoded = EncodedRaster::encode(&buffer);
        encoded.height = 1;
        assert!(matches!(
            encoded.decode(),
            Err(RasterError::DimensionsInvalid { len, .. }) if len == MAX_DIMENSION as usize * CHANNELS + 1
        ));
    }
}
