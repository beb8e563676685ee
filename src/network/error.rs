//! Network error types
//!
//! Framing, handshake and connection-manager failures. Handshake rejections and
//! transport errors close the affected connection; none of them is fatal to the node.

use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Wire framing and payload errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A definition was registered twice for the same tag
    #[error("message type {0} is already registered")]
    DuplicateType(u8),

    /// The header referenced a tag without a definition
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// The advertised length violates the definition of the message type
    #[error("invalid length {length} for message type {message_type} (max {max}, variable: {variable})")]
    InvalidLength {
        message_type: u8,
        length: usize,
        max: u16,
        variable: bool,
    },

    /// Fewer than three header bytes were supplied
    #[error("message header too short: {0} bytes")]
    HeaderTooShort(usize),

    /// The payload of a known message type could not be decoded
    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },

    /// Stream I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a handshake is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("non matching minimum weight magnitude: ours {ours}, theirs {theirs}")]
    NonMatchingMwm { ours: u8, theirs: u8 },

    #[error("non matching network fingerprint")]
    NonMatchingFingerprint,

    /// No common protocol version; carries the highest version the remote advertised
    #[error("protocol version not supported, remote advertised up to version {remote_highest}")]
    VersionNotSupported { remote_highest: u8 },

    #[error("advertised server port {advertised} does not match dialed port {dialed}")]
    PortMismatch { advertised: u16, dialed: u16 },

    #[error("all static peer slots are filled")]
    SlotsFilled,

    #[error("peer {0} is already connected")]
    AlreadyConnected(SocketAddr),

    #[error("peer {0} is not whitelisted")]
    UnknownPeer(SocketAddr),

    #[error("address {0} is blacklisted")]
    Blacklisted(IpAddr),

    #[error("handshake not received: {0}")]
    Missing(String),
}

/// Connection manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("invalid bind address {address}: {reason}")]
    InvalidBindAddress { address: String, reason: String },

    #[error("invalid peer address {address}: {reason}")]
    InvalidPeerAddress { address: String, reason: String },

    #[error("peer {0} is already connected")]
    AlreadyConnected(String),

    #[error("peer {0} is already in the reconnect pool")]
    AlreadyInReconnect(String),

    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for framing operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
