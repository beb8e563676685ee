//! Server-wide gossip metrics
//!
//! Counters are plain atomics updated on the hot path; [`ServerMetrics::snapshot`]
//! produces a serializable copy for reporting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Gossip counters summed over all peers
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub all_transactions: AtomicU64,
    pub new_transactions: AtomicU64,
    pub known_transactions: AtomicU64,
    pub invalid_transactions: AtomicU64,
    pub invalid_messages: AtomicU64,
    pub received_transaction_requests: AtomicU64,
    pub received_milestone_requests: AtomicU64,
    pub received_heartbeats: AtomicU64,
    pub sent_transactions: AtomicU64,
    pub sent_transaction_requests: AtomicU64,
    pub sent_milestone_requests: AtomicU64,
    pub sent_heartbeats: AtomicU64,
    /// Requests for data this node does not have
    pub unknown_requests: AtomicU64,
    /// Broadcast frames dropped because a peer's send queue was full
    pub dropped_broadcasts: AtomicU64,
    /// Peers removed for sending invalid data
    pub punished_peers: AtomicU64,
}

/// Point-in-time copy of [`ServerMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetricsSnapshot {
    pub all_transactions: u64,
    pub new_transactions: u64,
    pub known_transactions: u64,
    pub invalid_transactions: u64,
    pub invalid_messages: u64,
    pub received_transaction_requests: u64,
    pub received_milestone_requests: u64,
    pub received_heartbeats: u64,
    pub sent_transactions: u64,
    pub sent_transaction_requests: u64,
    pub sent_milestone_requests: u64,
    pub sent_heartbeats: u64,
    pub unknown_requests: u64,
    pub dropped_broadcasts: u64,
    pub punished_peers: u64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServerMetricsSnapshot {
            all_transactions: get(&self.all_transactions),
            new_transactions: get(&self.new_transactions),
            known_transactions: get(&self.known_transactions),
            invalid_transactions: get(&self.invalid_transactions),
            invalid_messages: get(&self.invalid_messages),
            received_transaction_requests: get(&self.received_transaction_requests),
            received_milestone_requests: get(&self.received_milestone_requests),
            received_heartbeats: get(&self.received_heartbeats),
            sent_transactions: get(&self.sent_transactions),
            sent_transaction_requests: get(&self.sent_transaction_requests),
            sent_milestone_requests: get(&self.sent_milestone_requests),
            sent_heartbeats: get(&self.sent_heartbeats),
            unknown_requests: get(&self.unknown_requests),
            dropped_broadcasts: get(&self.dropped_broadcasts),
            punished_peers: get(&self.punished_peers),
        }
    }
}

/// Request queue figures, for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestQueueSnapshot {
    pub queued: usize,
    pub pending: usize,
    pub processing: usize,
    /// Rolling average request latency in milliseconds
    pub avg_latency_ms: u64,
}
