//! Request dispatch
//!
//! Two loops keep the request queue moving: the dispatcher pops requests and
//! sends them to a peer that should have the data, and the sweeper moves
//! requests that stayed pending too long back into the queue.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::metrics::ServerMetrics;
use super::request_queue::{Request, SharedRequestQueue};
use crate::config::GossipConfig;
use crate::network::protocol::{MilestoneRequest, TransactionRequest};
use crate::network::{Peer, PeerManager, ProtocolFeatures};
use crate::storage::MilestoneIndex;
use crate::utils::lock;
use crate::utils::ShutdownSignal;

/// Requester settings
#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// Idle wait when the queue is empty
    pub dispatch_interval: Duration,
    pub pending_sweep_interval: Duration,
    /// Pending requests older than this are dropped on re-enqueue (zero keeps all)
    pub discard_older_than: Duration,
}

impl RequesterConfig {
    pub fn from_gossip_config(config: &GossipConfig) -> Self {
        Self {
            dispatch_interval: Duration::from_millis(config.requests.dispatch_interval_ms),
            pending_sweep_interval: Duration::from_secs(
                config.requests.pending_sweep_interval_secs,
            ),
            discard_older_than: Duration::from_secs(config.requests.discard_older_than_secs),
        }
    }
}

/// Sends queued requests to peers
pub struct Requester {
    config: RequesterConfig,
    manager: Arc<PeerManager>,
    requests: SharedRequestQueue,
    metrics: Arc<ServerMetrics>,
    notify: Notify,
}

impl Requester {
    pub fn new(
        config: RequesterConfig,
        manager: Arc<PeerManager>,
        requests: SharedRequestQueue,
        metrics: Arc<ServerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            requests,
            metrics,
            notify: Notify::new(),
        })
    }

    /// Queue a transaction request and wake the dispatcher
    pub fn request(&self, request: Request) -> bool {
        let queued = lock::lock(&self.requests).enqueue(request);
        if queued {
            self.notify.notify_one();
        }
        queued
    }

    /// Pick the peer to ask for data of milestone `index`
    ///
    /// Peers whose heartbeat covers the milestone are preferred; otherwise any
    /// peer that speaks the request protocol is chosen at random.
    pub fn select_peer(peers: &[Arc<Peer>], index: MilestoneIndex) -> Option<Arc<Peer>> {
        let capable: Vec<&Arc<Peer>> = peers
            .iter()
            .filter(|p| p.supports(ProtocolFeatures::STING) && !p.is_disconnected())
            .collect();
        let holding: Vec<&Arc<Peer>> = capable
            .iter()
            .copied()
            .filter(|p| p.has_milestone(index))
            .collect();

        let pool = if holding.is_empty() { &capable } else { &holding };
        pool.choose(&mut rand::thread_rng()).map(|p| Arc::clone(*p))
    }

    /// Send the next queued request
    ///
    /// The request is only popped once a peer to ask is found, so with no
    /// suitable peer it stays queued. Returns false when nothing was sent.
    pub async fn dispatch_next(&self) -> bool {
        if lock::lock(&self.requests).peek().is_none() {
            return false;
        }
        let peers = self.manager.connected_peers().await;

        let (request, peer) = {
            let mut requests = lock::lock(&self.requests);
            let Some(index) = requests.peek().map(|r| r.milestone_index) else {
                return false;
            };
            let Some(peer) = Self::select_peer(&peers, index) else {
                trace!("No peer to request milestone {} data from", index);
                return false;
            };
            match requests.next() {
                Some(request) => (request, peer),
                None => return false,
            }
        };

        let message = TransactionRequest { hash: request.hash }.encode();
        if peer.enqueue(message) {
            ServerMetrics::inc(&self.metrics.sent_transaction_requests);
            trace!("Requested {} from {}", request.hash, peer);
        }
        true
    }

    /// Ask a peer that holds milestone `index` for its transactions
    pub async fn request_milestone(&self, index: MilestoneIndex) -> bool {
        let peers = self.manager.connected_peers().await;
        let Some(peer) = Self::select_peer(&peers, index) else {
            return false;
        };
        let sent = peer.enqueue(MilestoneRequest { index }.encode());
        if sent {
            ServerMetrics::inc(&self.metrics.sent_milestone_requests);
        }
        sent
    }

    /// Re-enqueue stale pending requests
    pub fn sweep_pending(&self) -> usize {
        let requeued = lock::lock(&self.requests).enqueue_pending(self.config.discard_older_than);
        if requeued > 0 {
            debug!("Re-enqueued {} pending requests", requeued);
            self.notify.notify_one();
        }
        requeued
    }

    /// Spawn the dispatcher and the pending sweeper
    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> Vec<JoinHandle<()>> {
        let dispatcher = {
            let requester = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if shutdown.is_triggered() {
                        break;
                    }
                    if requester.dispatch_next().await {
                        continue;
                    }
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = requester.notify.notified() => {}
                        _ = tokio::time::sleep(requester.config.dispatch_interval) => {}
                    }
                }
                debug!("Request dispatcher stopped");
            })
        };

        let sweeper = {
            let requester = Arc::clone(self);
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let period = requester
                    .config
                    .pending_sweep_interval
                    .max(Duration::from_millis(10));
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = interval.tick() => {
                            requester.sweep_pending();
                        }
                    }
                }
                debug!("Pending request sweeper stopped");
            })
        };

        vec![dispatcher, sweeper]
    }
}
