//! Connection handshake
//!
//! The handshake is the first frame exchanged on every connection. Payload layout:
//! `[server_port:2][timestamp_ms:8][fingerprint:49][mwm:1][features:1..=8]`.
//! Feature bytes are ordered lowest versions first: bit `j` of byte `i` announces
//! protocol version `8 * i + j + 1`.

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};

use super::error::{HandshakeError, ProtocolError, ProtocolResult};
use super::message::Message;
use crate::utils::current_timestamp_millis;

/// Handshake message type tag
pub const MESSAGE_TYPE_HANDSHAKE: u8 = 1;

/// Size of the network fingerprint field
pub const FINGERPRINT_LENGTH: usize = 49;

const FIXED_PART_LENGTH: usize = 2 + 8 + FINGERPRINT_LENGTH + 1;
const MAX_FEATURE_BYTES: usize = 8;

/// Largest handshake payload
pub const HANDSHAKE_MAX_LENGTH: u16 = (FIXED_PART_LENGTH + MAX_FEATURE_BYTES) as u16;
/// Smallest handshake payload (one feature byte)
pub const HANDSHAKE_MIN_LENGTH: u16 = (FIXED_PART_LENGTH + 1) as u16;

/// Network fingerprint (identifies the network a node belongs to)
pub type Fingerprint = [u8; FINGERPRINT_LENGTH];

bitflags! {
    /// Protocol versions a node can speak
    ///
    /// One bit per version; the highest common bit is the negotiated version.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtocolFeatures: u64 {
        /// Version 1: plain transaction gossip
        const V1 = 1 << 0;
        /// Version 2: heartbeats plus explicit transaction and milestone requests
        const STING = 1 << 1;
    }
}

impl Default for ProtocolFeatures {
    fn default() -> Self {
        Self::STING
    }
}

impl ProtocolFeatures {
    /// Protocol version number of the STING feature set
    pub const STING_VERSION: u8 = 2;

    /// Highest version in this set, 0 when empty
    pub fn highest_version(&self) -> u8 {
        highest_version(self.bits())
    }

    fn to_wire(self) -> Vec<u8> {
        let bits = self.bits();
        let len = (((64 - bits.leading_zeros()) as usize + 7) / 8).max(1);
        bits.to_le_bytes()[..len].to_vec()
    }

    fn from_wire(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self::from_bits_retain(u64::from_le_bytes(buf))
    }
}

fn highest_version(bits: u64) -> u8 {
    (64 - bits.leading_zeros()) as u8
}

/// Negotiate the protocol version for two feature sets
///
/// Returns the highest version both sides support. When there is none the error
/// carries the remote's highest advertised version so the caller can log it.
pub fn supported_version(
    remote: ProtocolFeatures,
    own: ProtocolFeatures,
) -> Result<u8, HandshakeError> {
    let common = remote & own;
    if common.is_empty() {
        return Err(HandshakeError::VersionNotSupported {
            remote_highest: remote.highest_version(),
        });
    }
    Ok(common.highest_version())
}

/// Decoded handshake payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub server_port: u16,
    pub sent_timestamp_ms: u64,
    pub fingerprint: Fingerprint,
    pub mwm: u8,
    pub features: ProtocolFeatures,
}

impl Handshake {
    /// Handshake stamped with the current time
    pub fn new(server_port: u16, fingerprint: Fingerprint, mwm: u8, features: ProtocolFeatures) -> Self {
        Self {
            server_port,
            sent_timestamp_ms: current_timestamp_millis(),
            fingerprint,
            mwm,
            features,
        }
    }

    /// Serialize into a framed handshake message
    pub fn to_message(&self) -> Message {
        let features = self.features.to_wire();
        let mut buf = BytesMut::with_capacity(FIXED_PART_LENGTH + features.len());
        buf.put_u16(self.server_port);
        buf.put_u64(self.sent_timestamp_ms);
        buf.put_slice(&self.fingerprint);
        buf.put_u8(self.mwm);
        buf.put_slice(&features);
        Message::new(MESSAGE_TYPE_HANDSHAKE, buf.freeze())
    }

    /// Parse a handshake payload (the frame header has already been stripped)
    pub fn parse(payload: &[u8]) -> ProtocolResult<Self> {
        if payload.len() < HANDSHAKE_MIN_LENGTH as usize
            || payload.len() > HANDSHAKE_MAX_LENGTH as usize
        {
            return Err(ProtocolError::MalformedPayload {
                kind: "handshake",
                reason: format!("invalid length {}", payload.len()),
            });
        }

        let server_port = u16::from_be_bytes([payload[0], payload[1]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&payload[2..10]);
        let mut fingerprint = [0u8; FINGERPRINT_LENGTH];
        fingerprint.copy_from_slice(&payload[10..10 + FINGERPRINT_LENGTH]);
        let mwm = payload[FIXED_PART_LENGTH - 1];
        let features = ProtocolFeatures::from_wire(&payload[FIXED_PART_LENGTH..]);

        Ok(Self {
            server_port,
            sent_timestamp_ms: u64::from_be_bytes(ts),
            fingerprint,
            mwm,
            features,
        })
    }
}

/// Parameters a remote handshake must agree with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidHandshake {
    pub server_port: u16,
    pub fingerprint: Fingerprint,
    pub mwm: u8,
    pub features: ProtocolFeatures,
}

impl ValidHandshake {
    /// The handshake this node sends
    pub fn local_handshake(&self) -> Handshake {
        Handshake::new(self.server_port, self.fingerprint, self.mwm, self.features)
    }

    /// Check the protocol-level fields of a remote handshake
    ///
    /// Returns the negotiated protocol version.
    pub fn check(&self, remote: &Handshake) -> Result<u8, HandshakeError> {
        if remote.mwm != self.mwm {
            return Err(HandshakeError::NonMatchingMwm {
                ours: self.mwm,
                theirs: remote.mwm,
            });
        }
        if remote.fingerprint != self.fingerprint {
            return Err(HandshakeError::NonMatchingFingerprint);
        }
        supported_version(remote.features, self.features)
    }
}
