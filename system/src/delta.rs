use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DeltaError;
use crate::raster::{Rgba, CHANNELS};

/// Byte offset of channel 0 of pixel `(x, y)` in a raster `width` pixels wide.
pub fn pixel_offset(width: u32, x: u32, y: u32) -> Option<u32> {
    if x >= width {
        return None;
    }
    y.checked_mul(width)?
        .checked_add(x)?
        .checked_mul(CHANNELS as u32)
}

/// Inverse of [`pixel_offset`]: `(x, y, channel)` addressed by `offset`.
pub fn offset_to_pixel(width: u32, offset: u32) -> (u32, u32, u8) {
    let pixel = offset / CHANNELS as u32;
    let channel = (offset % CHANNELS as u32) as u8;
    (pixel % width, pixel / width, channel)
}

/// Sparse byte writes accumulated during one gesture. Each offset appears
/// at most once, so application order inside a delta does not matter.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta(BTreeMap<u32, u8>);

impl Delta {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, offset: u32, value: u8) -> Option<u8> {
        self.0.insert(offset, value)
    }

    pub fn get(&self, offset: u32) -> Option<u8> {
        self.0.get(&offset).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.0.iter().map(|(offset, value)| (*offset, *value))
    }

    pub fn max_offset(&self) -> Option<u32> {
        self.0.keys().next_back().copied()
    }

    /// Fails with the smallest offset that does not fit in `len` bytes.
    pub fn check_bounds(&self, len: usize) -> Result<(), DeltaError> {
        if len > u32::MAX as usize {
            return Ok(());
        }
        match self.0.range(len as u32..).next() {
            Some((offset, _)) => Err(DeltaError::OutOfBounds {
                offset: *offset,
                len,
            }),
            None => Ok(()),
        }
    }

    /// Records all four channels of one pixel. Returns `false` when the
    /// coordinates cannot be addressed.
    pub fn paint(&mut self, width: u32, x: u32, y: u32, color: Rgba) -> bool {
        match pixel_offset(width, x, y) {
            Some(base) if base.checked_add(CHANNELS as u32 - 1).is_some() => {
                for (i, value) in color.channels().iter().enumerate() {
                    self.0.insert(base + i as u32, *value);
                }
                true
            }
            _ => false,
        }
    }

    /// Folds `later` over `self`; on a shared offset the later value wins.
    pub fn merge(&mut self, later: &Delta) {
        for (offset, value) in later.iter() {
            self.0.insert(offset, value);
        }
    }
}

impl FromIterator<(u32, u8)> for Delta {
    fn from_iter<T: IntoIterator<Item = (u32, u8)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
