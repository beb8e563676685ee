//! Network layer for the gossip node
//!
//! This module provides message framing, the connection handshake, the peer
//! entity and the connection manager that owns the peer population.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod message;
pub mod peer;
pub mod protocol;

pub use codec::MessageCodec;
pub use error::{HandshakeError, ManagerError, ProtocolError, ProtocolResult};
pub use handshake::{supported_version, Fingerprint, Handshake, ProtocolFeatures, ValidHandshake};
pub use manager::{
    AddressResolver, ConnectionInfo, DnsResolver, ManagerConfig, NetworkEvent, OriginAddress,
    PeerEntry, PeerManager, ReconnectRecord,
};
pub use message::{Header, Message, MessageDefinition, MessageRegistry, HEADER_SIZE};
pub use peer::{AutopeerInfo, Peer, PeerInfo, PeerMetrics, PeerMetricsSnapshot, PeerOrigin};
pub use protocol::{gossip_registry, Heartbeat, MilestoneRequest, TransactionRequest};
