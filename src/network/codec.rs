//! Frame codec for peer streams
//!
//! Adapts the message registry to `tokio_util::codec` so a peer connection can be
//! driven as a `Framed` stream of [`Message`]s.

use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

use super::error::ProtocolError;
use super::message::{Message, MessageRegistry, HEADER_SIZE};

/// Length-prefixed message codec backed by a [`MessageRegistry`]
#[derive(Debug, Clone)]
pub struct MessageCodec {
    registry: Arc<MessageRegistry>,
}

impl MessageCodec {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Rejects unknown types and bad lengths before the payload arrives
        let header = self.registry.parse_header(&src[..HEADER_SIZE])?;
        let frame_len = HEADER_SIZE + header.message_length as usize;

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(header.message_length as usize).freeze();

        Ok(Some(Message {
            message_type: header.message_type,
            payload,
        }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.registry.encode_frame(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{gossip_registry, MESSAGE_TYPE_HEARTBEAT, MESSAGE_TYPE_TRANSACTION};

    fn codec() -> MessageCodec {
        MessageCodec::new(Arc::new(gossip_registry()))
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&[MESSAGE_TYPE_TRANSACTION, 0, 4, 1, 2][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[3, 4, MESSAGE_TYPE_TRANSACTION]);
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.message_type, MESSAGE_TYPE_TRANSACTION);
        assert_eq!(&message.payload[..], &[1, 2, 3, 4]);
        // Start of the next frame stays buffered
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_decode_rejects_bad_fixed_length() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&[MESSAGE_TYPE_HEARTBEAT, 0, 3, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_encode_then_decode() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        let message = Message::new(MESSAGE_TYPE_TRANSACTION, vec![7u8; 300]);
        codec.encode(message.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), message.wire_len());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }
}
