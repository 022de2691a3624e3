//! Message identifiers and the INPUT message
//!
//! INPUT (client -> server):
//! - buttons: u32
//! - yaw: f32
//! - pitch: f32
//! - tags: VLE count, then (hash, tagged value) pairs; must contain `"id"`
//!
//! STATE (server -> client) is laid out by [`crate::prediction::snapshot`].

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::net::wire::{write_variant_map, StringHash, Value, VariantMap, WireError, WireReader};
use crate::prediction::SequenceId;

/// Tag key carrying the input sequence id
pub const INPUT_ID_TAG: StringHash = StringHash::new("id");

/// Message kinds on the prediction channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Client input tagged with its sequence id
    Input,
    /// Full scene snapshot plus the recipient's last applied input id
    State,
}

impl MessageKind {
    pub const fn id(self) -> u32 {
        match self {
            Self::Input => 32,
            Self::State => 33,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            32 => Some(Self::Input),
            33 => Some(Self::State),
            _ => None,
        }
    }
}

/// Protocol errors for INPUT decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Wire(#[from] WireError),

    #[error("Input is missing its \"id\" tag")]
    MissingInputId,

    #[error("Input \"id\" tag is not an unsigned integer")]
    InvalidInputId,

    #[error("{0} trailing bytes after input")]
    TrailingBytes(usize),
}

/// One locally generated input
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputCommand {
    pub sequence_id: SequenceId,
    pub buttons: u32,
    pub yaw: f32,
    pub pitch: f32,
    pub tags: VariantMap,
}

impl InputCommand {
    pub fn new(buttons: u32, yaw: f32, pitch: f32) -> Self {
        Self {
            buttons,
            yaw,
            pitch,
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: &str, value: Value) -> Self {
        self.tags.insert(StringHash::new(key), value);
        self
    }

    /// True if every bit of `mask` is held
    pub fn is_down(&self, mask: u32) -> bool {
        self.buttons & mask == mask
    }

    pub fn tag(&self, key: &str) -> Option<&Value> {
        self.tags.get(&StringHash::new(key))
    }

    /// Assigns the sequence id and mirrors it into the `"id"` tag
    pub(crate) fn stamp(&mut self, id: SequenceId) {
        self.sequence_id = id;
        self.tags.insert(INPUT_ID_TAG, Value::Int(id.0 as i32));
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.buttons);
        buf.put_f32_le(self.yaw);
        buf.put_f32_le(self.pitch);
        write_variant_map(buf, &self.tags);
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(payload);
        let buttons = reader.read_u32()?;
        let yaw = reader.read_f32()?;
        let pitch = reader.read_f32()?;
        let tags = reader.read_variant_map()?;
        if !reader.is_empty() {
            return Err(ProtocolError::TrailingBytes(reader.remaining()));
        }

        let id = tags
            .get(&INPUT_ID_TAG)
            .ok_or(ProtocolError::MissingInputId)?
            .as_u32()
            .ok_or(ProtocolError::InvalidInputId)?;

        Ok(Self {
            sequence_id: SequenceId(id),
            buttons,
            yaw,
            pitch,
            tags,
        })
    }
}
