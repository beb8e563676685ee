//! Peer entity
//!
//! A `Peer` exists only for connections whose handshake was verified. It owns the
//! bounded outbound queue feeding the connection's writer task, per-peer traffic
//! counters and the latest heartbeat the remote sent. The byte stream itself is
//! owned by the connection task in the manager; the peer only holds the close
//! signal for it.

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use super::handshake::ProtocolFeatures;
use super::manager::OriginAddress;
use super::message::Message;
use super::protocol::{message_type_name, Heartbeat};
use crate::utils::lock;
use crate::utils::{current_timestamp, Shutdown, ShutdownSignal};

/// Direction in which the connection was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PeerOrigin {
    Inbound,
    Outbound,
}

impl fmt::Display for PeerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerOrigin::Inbound => write!(f, "inbound"),
            PeerOrigin::Outbound => write!(f, "outbound"),
        }
    }
}

/// Identity of a peer proposed by the discovery subsystem
///
/// The discovery subsystem owns the identity; the manager only keeps this as a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AutopeerInfo {
    /// Discovery identity (public key, hex)
    pub identity: String,
    /// Gossip service address announced by discovery
    pub address: String,
}

/// Per-peer traffic counters
#[derive(Debug, Default)]
pub struct PeerMetrics {
    pub received_messages: AtomicU64,
    pub sent_messages: AtomicU64,
    /// Outbound messages dropped because the send queue was full
    pub dropped_messages: AtomicU64,
    pub received_transactions: AtomicU64,
    pub new_transactions: AtomicU64,
    pub known_transactions: AtomicU64,
    pub invalid_transactions: AtomicU64,
    pub invalid_messages: AtomicU64,
    pub received_transaction_requests: AtomicU64,
    pub received_milestone_requests: AtomicU64,
    pub received_heartbeats: AtomicU64,
    pub sent_transactions: AtomicU64,
    pub sent_transaction_requests: AtomicU64,
    pub sent_heartbeats: AtomicU64,
}

/// Point-in-time copy of [`PeerMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerMetricsSnapshot {
    pub received_messages: u64,
    pub sent_messages: u64,
    pub dropped_messages: u64,
    pub received_transactions: u64,
    pub new_transactions: u64,
    pub known_transactions: u64,
    pub invalid_transactions: u64,
    pub invalid_messages: u64,
    pub received_transaction_requests: u64,
    pub received_milestone_requests: u64,
    pub received_heartbeats: u64,
    pub sent_transactions: u64,
    pub sent_transaction_requests: u64,
    pub sent_heartbeats: u64,
}

impl PeerMetrics {
    pub fn snapshot(&self) -> PeerMetricsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PeerMetricsSnapshot {
            received_messages: get(&self.received_messages),
            sent_messages: get(&self.sent_messages),
            dropped_messages: get(&self.dropped_messages),
            received_transactions: get(&self.received_transactions),
            new_transactions: get(&self.new_transactions),
            known_transactions: get(&self.known_transactions),
            invalid_transactions: get(&self.invalid_transactions),
            invalid_messages: get(&self.invalid_messages),
            received_transaction_requests: get(&self.received_transaction_requests),
            received_milestone_requests: get(&self.received_milestone_requests),
            received_heartbeats: get(&self.received_heartbeats),
            sent_transactions: get(&self.sent_transactions),
            sent_transaction_requests: get(&self.sent_transaction_requests),
            sent_heartbeats: get(&self.sent_heartbeats),
        }
    }
}

/// Serializable summary of a peer, for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: SocketAddr,
    pub address: SocketAddr,
    pub alias: Option<String>,
    pub origin: PeerOrigin,
    pub protocol_version: u8,
    pub autopeered: bool,
    pub connected_since: u64,
    pub heartbeat: Option<HeartbeatInfo>,
    pub metrics: PeerMetricsSnapshot,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HeartbeatInfo {
    pub solid_milestone_index: u32,
    pub pruned_milestone_index: u32,
    pub latest_milestone_index: u32,
    pub connected_peers: u8,
    pub synced_peers: u8,
}

impl From<Heartbeat> for HeartbeatInfo {
    fn from(h: Heartbeat) -> Self {
        Self {
            solid_milestone_index: h.solid_milestone_index,
            pruned_milestone_index: h.pruned_milestone_index,
            latest_milestone_index: h.latest_milestone_index,
            connected_peers: h.connected_peers,
            synced_peers: h.synced_peers,
        }
    }
}

/// A handshaked peer
pub struct Peer {
    id: SocketAddr,
    address: SocketAddr,
    origin: PeerOrigin,
    origin_address: RwLock<Option<OriginAddress>>,
    protocol_version: u8,
    features: ProtocolFeatures,
    send_tx: mpsc::Sender<Message>,
    metrics: PeerMetrics,
    heartbeat: RwLock<Option<Heartbeat>>,
    autopeer: RwLock<Option<AutopeerInfo>>,
    connected_since: u64,
    disconnected: AtomicBool,
    removed: AtomicBool,
    close: Shutdown,
}

impl Peer {
    /// Create a peer and the receiving end of its send queue
    ///
    /// `features` is the intersection of both sides' feature sets.
    pub fn new(
        id: SocketAddr,
        address: SocketAddr,
        origin: PeerOrigin,
        protocol_version: u8,
        features: ProtocolFeatures,
        send_queue_size: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (send_tx, send_rx) = mpsc::channel(send_queue_size.max(1));
        let peer = Self {
            id,
            address,
            origin,
            origin_address: RwLock::new(None),
            protocol_version,
            features,
            send_tx,
            metrics: PeerMetrics::default(),
            heartbeat: RwLock::new(None),
            autopeer: RwLock::new(None),
            connected_since: current_timestamp(),
            disconnected: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            close: Shutdown::new(),
        };
        (peer, send_rx)
    }

    /// Address this peer was dialed from (outbound) or resolved to (whitelisted inbound)
    pub fn with_origin_address(self, origin_address: Option<OriginAddress>) -> Self {
        *lock::write(&self.origin_address) = origin_address;
        self
    }

    pub fn with_autopeer(self, autopeer: Option<AutopeerInfo>) -> Self {
        *lock::write(&self.autopeer) = autopeer;
        self
    }

    /// `ip:advertised_server_port`
    pub fn id(&self) -> SocketAddr {
        self.id
    }

    /// Remote socket address of the connection
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn origin(&self) -> PeerOrigin {
        self.origin
    }

    pub fn origin_address(&self) -> Option<OriginAddress> {
        lock::read(&self.origin_address).clone()
    }

    pub(crate) fn set_origin_address(&self, origin_address: OriginAddress) {
        *lock::write(&self.origin_address) = Some(origin_address);
    }

    pub fn alias(&self) -> Option<String> {
        lock::read(&self.origin_address)
            .as_ref()
            .and_then(|o| o.alias.clone())
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// Whether the negotiated feature set includes all of `features`
    pub fn supports(&self, features: ProtocolFeatures) -> bool {
        self.features.contains(features)
    }

    pub fn metrics(&self) -> &PeerMetrics {
        &self.metrics
    }

    pub fn connected_since(&self) -> u64 {
        self.connected_since
    }

    pub fn autopeer(&self) -> Option<AutopeerInfo> {
        lock::read(&self.autopeer).clone()
    }

    pub fn is_autopeered(&self) -> bool {
        lock::read(&self.autopeer).is_some()
    }

    /// Turn an autopeered peer into a static one without reconnecting
    pub(crate) fn promote_to_static(&self) -> bool {
        lock::write(&self.autopeer).take().is_some()
    }

    /// Latest heartbeat received from this peer
    pub fn latest_heartbeat(&self) -> Option<Heartbeat> {
        *lock::read(&self.heartbeat)
    }

    pub fn set_latest_heartbeat(&self, heartbeat: Heartbeat) {
        *lock::write(&self.heartbeat) = Some(heartbeat);
    }

    /// Whether the peer reports itself synced
    pub fn is_synced(&self) -> bool {
        self.latest_heartbeat().is_some_and(|h| h.is_synced())
    }

    /// Whether the peer's heartbeat says it holds the data of milestone `index`
    pub fn has_milestone(&self, index: u32) -> bool {
        self.latest_heartbeat().is_some_and(|h| h.has_milestone(index))
    }

    /// Queue a message for sending without blocking
    ///
    /// Returns false when the message was dropped: the queue is full (counted in
    /// `dropped_messages`) or the connection is gone.
    pub fn enqueue(&self, message: Message) -> bool {
        if self.is_disconnected() {
            return false;
        }

        match self.send_tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                self.metrics.dropped_messages.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Send queue of peer {} full, dropped {} message",
                    self.id,
                    message_type_name(message.message_type)
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Free capacity of the send queue
    pub fn send_queue_capacity(&self) -> usize {
        self.send_tx.capacity()
    }

    /// Ask the connection task to close the stream
    pub fn close(&self) {
        self.close.trigger();
    }

    pub(crate) fn close_signal(&self) -> ShutdownSignal {
        self.close.to_signal()
    }

    /// Mark the connection as gone; returns false if it already was
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    /// Whether the connection is closed or closing
    ///
    /// Errors observed after this is set are expected consequences of the close.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Whether the peer was explicitly removed (and must not be reconnected)
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            address: self.address,
            alias: self.alias(),
            origin: self.origin,
            protocol_version: self.protocol_version,
            autopeered: self.is_autopeered(),
            connected_since: self.connected_since,
            heartbeat: self.latest_heartbeat().map(HeartbeatInfo::from),
            metrics: self.metrics.snapshot(),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("origin", &self.origin)
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.alias() {
            Some(alias) => write!(f, "{} ({})", self.id, alias),
            None => write!(f, "{}", self.id),
        }
    }
}
