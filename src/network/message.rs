//! Type-length-value message framing
//!
//! Every frame starts with a 3 byte header: a one byte message type followed by
//! the payload length as a big-endian `u16`. The registry maps each type to its
//! length definition; framing never looks at payload bytes.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::{ProtocolError, ProtocolResult};

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 3;

/// Length definition of a registered message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDefinition {
    /// Message type tag
    pub id: u8,
    /// Maximum payload length (exact length for fixed-size messages)
    pub max_bytes_length: u16,
    /// Whether the payload may be shorter than `max_bytes_length`
    pub variable_length: bool,
}

impl MessageDefinition {
    pub const fn fixed(id: u8, length: u16) -> Self {
        Self {
            id,
            max_bytes_length: length,
            variable_length: false,
        }
    }

    pub const fn variable(id: u8, max_length: u16) -> Self {
        Self {
            id,
            max_bytes_length: max_length,
            variable_length: true,
        }
    }

    /// Check an advertised payload length against this definition
    pub fn check_length(&self, length: usize) -> ProtocolResult<()> {
        let max = self.max_bytes_length as usize;
        let valid = if self.variable_length {
            length <= max
        } else {
            length == max
        };

        if valid {
            Ok(())
        } else {
            Err(ProtocolError::InvalidLength {
                message_type: self.id,
                length,
                max: self.max_bytes_length,
                variable: self.variable_length,
            })
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: u8,
    pub message_length: u16,
}

impl Header {
    /// Write the header bytes into `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.message_type);
        dst.put_u16(self.message_length);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let len = self.message_length.to_be_bytes();
        [self.message_type, len[0], len[1]]
    }
}

/// A typed frame: message type plus raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: u8,
    pub payload: Bytes,
}

impl Message {
    pub fn new(message_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    /// Full frame length on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Registry of known message types
///
/// Constructed explicitly and shared by reference; there is no process-wide table.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    definitions: Vec<Option<MessageDefinition>>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under `definition.id`
    pub fn register(&mut self, definition: MessageDefinition) -> ProtocolResult<()> {
        let index = definition.id as usize;
        if index >= self.definitions.len() {
            self.definitions.resize(index + 1, None);
        }

        if self.definitions[index].is_some() {
            return Err(ProtocolError::DuplicateType(definition.id));
        }

        self.definitions[index] = Some(definition);
        Ok(())
    }

    pub fn definition(&self, message_type: u8) -> Option<&MessageDefinition> {
        self.definitions
            .get(message_type as usize)
            .and_then(|d| d.as_ref())
    }

    pub fn is_registered(&self, message_type: u8) -> bool {
        self.definition(message_type).is_some()
    }

    /// Parse and validate a frame header from the first three bytes of `data`
    pub fn parse_header(&self, data: &[u8]) -> ProtocolResult<Header> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort(data.len()));
        }

        let message_type = data[0];
        let message_length = u16::from_be_bytes([data[1], data[2]]);

        let definition = self
            .definition(message_type)
            .ok_or(ProtocolError::UnknownType(message_type))?;
        definition.check_length(message_length as usize)?;

        Ok(Header {
            message_type,
            message_length,
        })
    }

    /// Build a header for `payload_len` bytes of `message_type`, validating the length
    pub fn header_for(&self, message_type: u8, payload_len: usize) -> ProtocolResult<Header> {
        let definition = self
            .definition(message_type)
            .ok_or(ProtocolError::UnknownType(message_type))?;
        definition.check_length(payload_len)?;

        Ok(Header {
            message_type,
            message_length: payload_len as u16,
        })
    }

    /// Serialize a full frame (header followed by payload)
    pub fn encode_frame(&self, message: &Message, dst: &mut BytesMut) -> ProtocolResult<()> {
        let header = self.header_for(message.message_type, message.payload.len())?;
        dst.reserve(message.wire_len());
        header.encode(dst);
        dst.extend_from_slice(&message.payload);
        Ok(())
    }
}
