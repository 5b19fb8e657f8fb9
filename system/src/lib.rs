pub extern crate bincode;
pub extern crate serde;
pub extern crate serde_json;
pub extern crate uuid;

mod client_follower_document;
pub mod codec;
mod delta;
mod error;
mod message;
mod raster;
mod server_leader_document;
mod types;

pub use client_follower_document::ClientFollowerDocument;
pub use delta::{offset_to_pixel, pixel_offset, Delta};
pub use error::{CodecError, DeltaError, FollowerError, RasterError};
pub use message::*;
pub use raster::{
    raster_len, EncodedRaster, PixelBuffer, RasterSnapshot, Rgba, CHANNELS, MAX_DIMENSION,
};
pub use server_leader_document::ServerLeaderDocument;
pub use types::*;
