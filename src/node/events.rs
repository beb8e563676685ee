//! Gossip notifications
//!
//! The node publishes [`GossipEvent`]s on a `tokio::sync::broadcast` channel.
//! Subscribers (ledger ingestion, telemetry) obtain receivers from
//! [`crate::node::GossipNode::subscribe`]; a lagging subscriber loses events
//! rather than slowing the node down.

use std::sync::Arc;

use crate::network::Peer;
use crate::storage::Transaction;

/// Notifications emitted by the gossip layer
#[derive(Debug, Clone)]
pub enum GossipEvent {
    /// A peer completed its handshake
    PeerConnected(Arc<Peer>),
    /// A handshaked peer's connection closed
    PeerDisconnected(Arc<Peer>),
    /// A transaction passed validation
    TransactionProcessed {
        transaction: Arc<Transaction>,
        /// Whether this node had requested it
        requested: bool,
    },
    /// A new transaction was handed to the broadcast queue
    TransactionBroadcast {
        transaction: Arc<Transaction>,
        /// Number of peers excluded because they already have it
        excluded: usize,
    },
}

/// Input from the peer discovery subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Discovery selected a peer to gossip with
    PeerProposed {
        /// Gossip service address, `host:port`
        address: String,
        /// Discovery identity
        identity: String,
    },
    /// Discovery dropped a previously proposed peer
    PeerDropped { address: String },
}
