//! Packet envelope and wire decoding.
//!
//! The capture process sends one JSON object per WebSocket message:
//!
//! ```text
//! {
//!   "opcode": 142, "type": "EventPlay8", "subType": "", "superType": "",
//!   "direction": "inbound", "serverId": 2, "region": "Global",
//!   "timestamp": 1700000000000, "sourceActorId": 1, "targetActorId": 1,
//!   "data": [0, 0, 0, 0, 5, ...]
//! }
//! ```
//!
//! [`PacketEnvelope::decode`] turns that into a typed envelope. The numeric
//! `data` array becomes a byte payload at decode time and `packetSize` is
//! derived from it, so consumers never see the wire form. Any keys beyond the
//! documented ones are kept in [`PacketEnvelope::fields`], which is also where
//! postprocessors put their derived values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Region;
use crate::constants::PACKET_HEADER_SIZE;

/// Whether the packet was sent by the server or by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Server to client.
    #[default]
    Inbound,
    /// Client to server.
    Outbound,
}

/// Reason an inbound message produced no envelope.
#[derive(Debug)]
pub enum DecodeError {
    /// A binary frame did not hold UTF-8 text.
    Utf8(std::str::Utf8Error),
    /// The text was not a packet object.
    Json(serde_json::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utf8(e) => write!(f, "message is not UTF-8: {e}"),
            Self::Json(e) => write!(f, "message is not a packet: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Utf8(e) => Some(e),
            Self::Json(e) => Some(e),
        }
    }
}

/// Packet as it appears on the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePacket {
    opcode: u32,
    #[serde(rename = "type")]
    packet_type: String,
    #[serde(default)]
    sub_type: String,
    #[serde(default)]
    super_type: String,
    #[serde(default)]
    direction: Direction,
    #[serde(default)]
    server_id: u32,
    #[serde(default)]
    region: Region,
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    source_actor_id: u32,
    #[serde(default)]
    target_actor_id: u32,
    data: Option<Vec<u8>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// One decoded packet.
///
/// Serializes back to the camelCase shape consumers of the JavaScript API
/// expect, with `data` as a number array and derived fields inlined.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketEnvelope {
    /// IPC opcode.
    pub opcode: u32,
    /// Packet type name, e.g. `EventPlay8`.
    #[serde(rename = "type")]
    pub packet_type: String,
    /// Finer classification below `type`; empty when absent.
    pub sub_type: String,
    /// Coarser classification above `type`; empty when absent.
    pub super_type: String,
    /// Direction of travel.
    pub direction: Direction,
    /// World server the packet came from.
    pub server_id: u32,
    /// Region whose opcode table decoded the packet.
    pub region: Region,
    /// Capture timestamp in milliseconds.
    pub timestamp: u64,
    /// Actor that sent the segment.
    pub source_actor_id: u32,
    /// Actor the segment is addressed to.
    pub target_actor_id: u32,
    /// IPC payload bytes.
    #[serde(rename = "data", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Payload length plus the stripped header; set whenever `payload` is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_size: Option<usize>,
    /// Undocumented wire keys and postprocessor-derived fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PacketEnvelope {
    /// Decode one text message.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let wire: WirePacket = serde_json::from_str(text).map_err(DecodeError::Json)?;
        Ok(Self::from(wire))
    }

    /// Decode one binary message holding UTF-8 JSON.
    pub fn decode_bytes(raw: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(raw).map_err(DecodeError::Utf8)?;
        Self::decode(text)
    }

    /// Payload bytes, empty when the packet carried none.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Look up a derived or undocumented field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Derived field as an unsigned integer.
    #[must_use]
    pub fn field_u64(&self, name: &str) -> Option<u64> {
        self.field(name).and_then(Value::as_u64)
    }

    /// Little-endian `u8` at `offset` of the payload.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.payload().get(offset).copied()
    }

    /// Little-endian `u16` at `offset` of the payload.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        read_array(self.payload(), offset).map(u16::from_le_bytes)
    }

    /// Little-endian `u32` at `offset` of the payload.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        read_array(self.payload(), offset).map(u32::from_le_bytes)
    }

    /// Little-endian `u64` at `offset` of the payload.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        read_array(self.payload(), offset).map(u64::from_le_bytes)
    }

    /// Little-endian `f32` at `offset` of the payload.
    #[must_use]
    pub fn read_f32(&self, offset: usize) -> Option<f32> {
        read_array(self.payload(), offset).map(f32::from_le_bytes)
    }
}

impl From<WirePacket> for PacketEnvelope {
    fn from(wire: WirePacket) -> Self {
        let packet_size = wire.data.as_ref().map(|d| d.len() + PACKET_HEADER_SIZE);
        Self {
            opcode: wire.opcode,
            packet_type: wire.packet_type,
            sub_type: wire.sub_type,
            super_type: wire.super_type,
            direction: wire.direction,
            server_id: wire.server_id,
            region: wire.region,
            timestamp: wire.timestamp,
            source_actor_id: wire.source_actor_id,
            target_actor_id: wire.target_actor_id,
            payload: wire.data,
            packet_size,
            fields: wire.extra,
        }
    }
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    data.get(offset..end)?.try_into().ok()
}
