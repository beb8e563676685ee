//! Gossip protocol message types
//!
//! Message type tags, their length definitions and the fixed-size payloads
//! exchanged after a successful handshake. All integers are big-endian.

use bytes::{BufMut, BytesMut};

use super::error::{ProtocolError, ProtocolResult};
use super::handshake::{HANDSHAKE_MAX_LENGTH, MESSAGE_TYPE_HANDSHAKE};
use super::message::{Message, MessageDefinition, MessageRegistry};
use crate::storage::{MilestoneIndex, TransactionHash, TRANSACTION_HASH_LENGTH};

/// Request for the transactions of a milestone
pub const MESSAGE_TYPE_MILESTONE_REQUEST: u8 = 3;
/// A raw transaction
pub const MESSAGE_TYPE_TRANSACTION: u8 = 4;
/// Request for a transaction by hash
pub const MESSAGE_TYPE_TRANSACTION_REQUEST: u8 = 5;
/// Liveness snapshot of the sending node
pub const MESSAGE_TYPE_HEARTBEAT: u8 = 6;

/// Maximum size of a transaction payload
pub const MAX_TRANSACTION_BYTES: u16 = 1604;
/// Size of a heartbeat payload
pub const HEARTBEAT_LENGTH: u16 = 14;
/// Size of a milestone request payload
pub const MILESTONE_REQUEST_LENGTH: u16 = 4;

/// Build the registry of all gossip message types
pub fn gossip_registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();
    let definitions = [
        MessageDefinition::variable(MESSAGE_TYPE_HANDSHAKE, HANDSHAKE_MAX_LENGTH),
        MessageDefinition::fixed(MESSAGE_TYPE_MILESTONE_REQUEST, MILESTONE_REQUEST_LENGTH),
        MessageDefinition::variable(MESSAGE_TYPE_TRANSACTION, MAX_TRANSACTION_BYTES),
        MessageDefinition::fixed(
            MESSAGE_TYPE_TRANSACTION_REQUEST,
            TRANSACTION_HASH_LENGTH as u16,
        ),
        MessageDefinition::fixed(MESSAGE_TYPE_HEARTBEAT, HEARTBEAT_LENGTH),
    ];

    for definition in definitions {
        // Tags above are distinct constants
        if let Err(e) = registry.register(definition) {
            tracing::error!("Failed to register gossip message type: {}", e);
        }
    }

    registry
}

/// Human readable name of a message type, for logging
pub fn message_type_name(message_type: u8) -> &'static str {
    match message_type {
        MESSAGE_TYPE_HANDSHAKE => "handshake",
        MESSAGE_TYPE_MILESTONE_REQUEST => "milestone_request",
        MESSAGE_TYPE_TRANSACTION => "transaction",
        MESSAGE_TYPE_TRANSACTION_REQUEST => "transaction_request",
        MESSAGE_TYPE_HEARTBEAT => "heartbeat",
        _ => "unknown",
    }
}

/// Liveness information a node periodically sends to its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub solid_milestone_index: MilestoneIndex,
    pub pruned_milestone_index: MilestoneIndex,
    pub latest_milestone_index: MilestoneIndex,
    pub connected_peers: u8,
    pub synced_peers: u8,
}

impl Heartbeat {
    pub fn encode(&self) -> Message {
        let mut buf = BytesMut::with_capacity(HEARTBEAT_LENGTH as usize);
        buf.put_u32(self.solid_milestone_index);
        buf.put_u32(self.pruned_milestone_index);
        buf.put_u32(self.latest_milestone_index);
        buf.put_u8(self.connected_peers);
        buf.put_u8(self.synced_peers);
        Message::new(MESSAGE_TYPE_HEARTBEAT, buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        if payload.len() != HEARTBEAT_LENGTH as usize {
            return Err(ProtocolError::MalformedPayload {
                kind: "heartbeat",
                reason: format!("expected {} bytes, got {}", HEARTBEAT_LENGTH, payload.len()),
            });
        }

        Ok(Self {
            solid_milestone_index: read_u32(&payload[0..4]),
            pruned_milestone_index: read_u32(&payload[4..8]),
            latest_milestone_index: read_u32(&payload[8..12]),
            connected_peers: payload[12],
            synced_peers: payload[13],
        })
    }

    /// Whether the sender reports itself as synced
    pub fn is_synced(&self) -> bool {
        self.solid_milestone_index >= self.latest_milestone_index
    }

    /// Whether the sender should still hold the data of `index`
    pub fn has_milestone(&self, index: MilestoneIndex) -> bool {
        index > self.pruned_milestone_index && index <= self.solid_milestone_index
    }
}

/// Request for a milestone's transactions; index 0 means "latest"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MilestoneRequest {
    pub index: MilestoneIndex,
}

impl MilestoneRequest {
    pub const LATEST: MilestoneIndex = 0;

    pub fn encode(&self) -> Message {
        Message::new(
            MESSAGE_TYPE_MILESTONE_REQUEST,
            self.index.to_be_bytes().to_vec(),
        )
    }

    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        if payload.len() != MILESTONE_REQUEST_LENGTH as usize {
            return Err(ProtocolError::MalformedPayload {
                kind: "milestone request",
                reason: format!("expected 4 bytes, got {}", payload.len()),
            });
        }
        Ok(Self {
            index: read_u32(payload),
        })
    }
}

/// Request for a single transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRequest {
    pub hash: TransactionHash,
}

impl TransactionRequest {
    pub fn encode(&self) -> Message {
        Message::new(
            MESSAGE_TYPE_TRANSACTION_REQUEST,
            self.hash.as_bytes().to_vec(),
        )
    }

    pub fn decode(payload: &[u8]) -> ProtocolResult<Self> {
        let hash = TransactionHash::from_slice(payload).ok_or_else(|| {
            ProtocolError::MalformedPayload {
                kind: "transaction request",
                reason: format!(
                    "expected {} bytes, got {}",
                    TRANSACTION_HASH_LENGTH,
                    payload.len()
                ),
            }
        })?;
        Ok(Self { hash })
    }
}

/// Wrap raw transaction bytes into a frame
pub fn transaction_message(data: impl Into<bytes::Bytes>) -> Message {
    Message::new(MESSAGE_TYPE_TRANSACTION, data)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
