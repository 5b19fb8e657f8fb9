//! Frame encoding shared by the server and client replicas.
//!
//! Text frames carry JSON, binary frames carry bincode. Both encode the same
//! `SessionCommand` / `SessionEvent` values, so a client may pick whichever
//! suits it and tooling can translate between the two.

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::message::{SessionCommand, SessionEvent};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Binary,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "binary" | "bincode" => Ok(Self::Binary),
            other => Err(format!("unknown wire format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

pub fn encode<T: Serialize>(format: WireFormat, value: &T) -> Result<Frame, CodecError> {
    match format {
        WireFormat::Json => Ok(Frame::Text(serde_json::to_string(value)?)),
        WireFormat::Binary => Ok(Frame::Binary(bincode::serialize(value)?)),
    }
}

pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(text)?)
}

pub fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T, CodecError> {
    match frame {
        Frame::Text(text) => decode_text(text),
        Frame::Binary(bytes) => decode_binary(bytes),
    }
}

pub fn translate_command_to_json(bytes: &[u8]) -> Result<String, CodecError> {
    let command = decode_binary::<SessionCommand>(bytes)?;
    Ok(serde_json::to_string(&command)?)
}

pub fn translate_command_from_json(json: &str) -> Result<Vec<u8>, CodecError> {
    let command = decode_text::<SessionCommand>(json)?;
    Ok(bincode::serialize(&command)?)
}

pub fn translate_event_to_json(bytes: &[u8]) -> Result<String, CodecError> {
    let event = decode_binary::<SessionEvent>(bytes)?;
    Ok(serde_json::to_string(&event)?)
}

pub fn translate_event_from_json(json: &str) -> Result<Vec<u8>, CodecError> {
    let event = decode_text::<SessionEvent>(json)?;
    Ok(bincode::serialize(&event)?)
}
