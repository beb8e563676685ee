//! Broadcast queue
//!
//! Fan-out of newly learned transactions. Producers hand a frame and an
//! exclusion set to [`BroadcastQueue::enqueue`]; a single [`Broadcaster`] loop
//! drains the queue and copies the frame onto the send queue of every connected,
//! feature-compatible peer that is not excluded.
//!
//! `enqueue` is the one place in the pipeline that may block its caller (when
//! the queue is full). Delivery to a peer never blocks: a full peer send queue
//! drops the frame for that peer and counts it.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::metrics::ServerMetrics;
use crate::network::{Message, PeerManager, ProtocolFeatures};
use crate::utils::ShutdownSignal;

/// One frame to send to all peers but the excluded ones
#[derive(Debug, Clone)]
pub struct BroadcastItem {
    pub message: Message,
    /// Peer ids that already have the data
    pub excluded: HashSet<SocketAddr>,
    /// Features a peer must have negotiated to receive the frame
    pub required_features: ProtocolFeatures,
}

impl BroadcastItem {
    pub fn new(message: Message, excluded: HashSet<SocketAddr>) -> Self {
        Self {
            message,
            excluded,
            required_features: ProtocolFeatures::STING,
        }
    }
}

/// Producer side of the broadcast queue
#[derive(Debug, Clone)]
pub struct BroadcastQueue {
    tx: mpsc::Sender<BroadcastItem>,
}

/// Consumer side of the broadcast queue
pub struct Broadcaster {
    rx: mpsc::Receiver<BroadcastItem>,
    manager: Arc<PeerManager>,
    metrics: Arc<ServerMetrics>,
}

/// Create a broadcast queue holding up to `size` items
pub fn broadcast_queue(
    size: usize,
    manager: Arc<PeerManager>,
    metrics: Arc<ServerMetrics>,
) -> (BroadcastQueue, Broadcaster) {
    let (tx, rx) = mpsc::channel(size.max(1));
    (
        BroadcastQueue { tx },
        Broadcaster {
            rx,
            manager,
            metrics,
        },
    )
}

impl BroadcastQueue {
    /// Queue an item, waiting while the queue is full
    ///
    /// Returns false once the broadcaster is gone.
    pub async fn enqueue(&self, item: BroadcastItem) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Free capacity of the queue
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

impl Broadcaster {
    /// Deliver one item; returns the number of peers it was queued for
    pub async fn dispatch(&self, item: &BroadcastItem) -> usize {
        let mut sent = 0;
        for peer in self.manager.connected_peers().await {
            if item.excluded.contains(&peer.id())
                || !peer.supports(item.required_features)
                || peer.is_disconnected()
            {
                continue;
            }

            if peer.enqueue(item.message.clone()) {
                sent += 1;
            } else {
                ServerMetrics::inc(&self.metrics.dropped_broadcasts);
            }
        }
        trace!(
            "Broadcast message type {} to {} peers",
            item.message.message_type,
            sent
        );
        sent
    }

    /// Drain the queue until shutdown or until every producer is gone
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        loop {
            let item = tokio::select! {
                _ = shutdown.wait() => break,
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.dispatch(&item).await;
        }
        debug!("Broadcaster stopped");
    }
}
