//! Work-unit processor
//!
//! Handles every message a handshaked peer sends. Incoming frames are queued and
//! picked up by a fixed pool of workers. Transactions go through the work-unit
//! state machine so that the same bytes arriving from many peers at once are
//! validated exactly once and produce at most one broadcast. Requests are
//! answered from the transaction store; heartbeats update the sending peer.

use bytes::Bytes;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::broadcast::{BroadcastItem, BroadcastQueue};
use super::metrics::ServerMetrics;
use super::request_queue::SharedRequestQueue;
use super::work_unit::{WorkAction, WorkUnit, WorkUnitCache};
use crate::config::GossipConfig;
use crate::network::protocol::{
    message_type_name, transaction_message, Heartbeat, MilestoneRequest, TransactionRequest,
    MESSAGE_TYPE_HEARTBEAT, MESSAGE_TYPE_MILESTONE_REQUEST, MESSAGE_TYPE_TRANSACTION,
    MESSAGE_TYPE_TRANSACTION_REQUEST,
};
use crate::network::{Peer, PeerManager};
use crate::node::events::GossipEvent;
use crate::storage::{
    MilestoneIndex, SyncStatus, Transaction, TransactionHash, TransactionStore,
    TransactionValidator,
};
use crate::utils::lock;
use crate::utils::ShutdownSignal;

/// Processor settings
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub workers: usize,
    pub work_queue_size: usize,
    pub work_unit_ttl: Duration,
    pub work_unit_capacity: usize,
}

impl ProcessorConfig {
    pub fn from_gossip_config(config: &GossipConfig) -> Self {
        Self {
            workers: config.workers,
            work_queue_size: config.work_queue_size,
            work_unit_ttl: Duration::from_millis(config.work_unit_cache.ttl_ms),
            work_unit_capacity: config.work_unit_cache.capacity,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_gossip_config(&GossipConfig::default())
    }
}

/// A received frame waiting for a worker
#[derive(Debug)]
pub struct WorkItem {
    pub peer: Arc<Peer>,
    pub message_type: u8,
    pub data: Bytes,
}

/// Ledger collaborators the processor needs
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn TransactionStore>,
    pub validator: Arc<dyn TransactionValidator>,
    pub sync: Arc<dyn SyncStatus>,
}

/// Gossip message processor
pub struct Processor {
    config: ProcessorConfig,
    manager: Arc<PeerManager>,
    collaborators: Collaborators,
    requests: SharedRequestQueue,
    broadcast: BroadcastQueue,
    work_units: WorkUnitCache,
    metrics: Arc<ServerMetrics>,
    events: broadcast::Sender<GossipEvent>,
    work_tx: mpsc::Sender<WorkItem>,
    work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        manager: Arc<PeerManager>,
        collaborators: Collaborators,
        requests: SharedRequestQueue,
        broadcast: BroadcastQueue,
        metrics: Arc<ServerMetrics>,
        events: broadcast::Sender<GossipEvent>,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::channel(config.work_queue_size.max(1));
        Arc::new(Self {
            work_units: WorkUnitCache::new(config.work_unit_ttl, config.work_unit_capacity),
            config,
            manager,
            collaborators,
            requests,
            broadcast,
            metrics,
            events,
            work_tx,
            work_rx: Arc::new(Mutex::new(work_rx)),
        })
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn work_units(&self) -> &WorkUnitCache {
        &self.work_units
    }

    /// Submit a received frame to the worker pool
    ///
    /// Waits while the work queue is full, which slows down the reading
    /// connection. Returns false once the workers are gone.
    pub async fn process(&self, peer: Arc<Peer>, message_type: u8, data: Bytes) -> bool {
        self.work_tx
            .send(WorkItem {
                peer,
                message_type,
                data,
            })
            .await
            .is_ok()
    }

    /// Spawn the workers and the work-unit cache sweeper
    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers + 1);
        for worker in 0..self.config.workers.max(1) {
            let processor = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                processor.run_worker(worker, shutdown).await;
            }));
        }

        let processor = Arc::clone(self);
        let mut sweeper_shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            let period = processor.config.work_unit_ttl.max(Duration::from_millis(100));
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = sweeper_shutdown.wait() => break,
                    _ = interval.tick() => {
                        let evicted = processor.work_units.evict_expired();
                        if evicted > 0 {
                            trace!("Evicted {} expired work units", evicted);
                        }
                    }
                }
            }
        }));

        handles
    }

    async fn run_worker(&self, worker: usize, mut shutdown: ShutdownSignal) {
        loop {
            let item = {
                let mut rx = self.work_rx.lock().await;
                tokio::select! {
                    _ = shutdown.wait() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(item) = item else {
                break;
            };
            self.handle_message(&item.peer, item.message_type, item.data)
                .await;
        }
        debug!("Processor worker {} stopped", worker);
    }

    /// Handle one frame from `peer`
    pub async fn handle_message(&self, peer: &Arc<Peer>, message_type: u8, data: Bytes) {
        trace!(
            "Processing {} from {}",
            message_type_name(message_type),
            peer
        );
        match message_type {
            MESSAGE_TYPE_TRANSACTION => {
                peer.metrics()
                    .received_transactions
                    .fetch_add(1, Ordering::Relaxed);
                ServerMetrics::inc(&self.metrics.all_transactions);
                self.process_transaction(Some(peer), data).await;
            }
            MESSAGE_TYPE_TRANSACTION_REQUEST => match TransactionRequest::decode(&data) {
                Ok(request) => self.answer_transaction_request(peer, request.hash),
                Err(e) => self.invalid_message(peer, &e),
            },
            MESSAGE_TYPE_MILESTONE_REQUEST => match MilestoneRequest::decode(&data) {
                Ok(request) => self.answer_milestone_request(peer, request.index),
                Err(e) => self.invalid_message(peer, &e),
            },
            MESSAGE_TYPE_HEARTBEAT => match Heartbeat::decode(&data) {
                Ok(heartbeat) => {
                    peer.metrics()
                        .received_heartbeats
                        .fetch_add(1, Ordering::Relaxed);
                    ServerMetrics::inc(&self.metrics.received_heartbeats);
                    peer.set_latest_heartbeat(heartbeat);
                }
                Err(e) => self.invalid_message(peer, &e),
            },
            other => {
                self.invalid_message(peer, &format!("unexpected message type {}", other));
            }
        }
    }

    fn invalid_message(&self, peer: &Peer, reason: &dyn std::fmt::Display) {
        debug!("Invalid message from {}: {}", peer, reason);
        peer.metrics().invalid_messages.fetch_add(1, Ordering::Relaxed);
        ServerMetrics::inc(&self.metrics.invalid_messages);
    }

    /// Run raw transaction bytes through the work-unit state machine
    ///
    /// `peer` is None for transactions submitted by this node itself.
    pub async fn process_transaction(&self, peer: Option<&Arc<Peer>>, data: Bytes) {
        let (unit, _) = self.work_units.get_or_create(&data);
        self.process_work_unit(&unit, peer).await;
    }

    /// Drive a work unit for one delivery of its payload
    pub async fn process_work_unit(&self, unit: &Arc<WorkUnit>, peer: Option<&Arc<Peer>>) {
        match unit.begin(peer) {
            WorkAction::InProgress => return,
            WorkAction::Invalid => {
                if let Some(peer) = peer {
                    self.punish(peer).await;
                }
                return;
            }
            WorkAction::Hashed(transaction) => {
                if self.mark_received(transaction.hash()) {
                    self.emit(GossipEvent::TransactionProcessed {
                        transaction,
                        requested: true,
                    });
                } else if self.collaborators.store.contains(transaction.hash()) {
                    if let Some(peer) = peer {
                        peer.metrics()
                            .known_transactions
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    ServerMetrics::inc(&self.metrics.known_transactions);
                }
                return;
            }
            WorkAction::Validate => {}
        }

        let transaction = match self.collaborators.validator.parse_and_validate(unit.data()) {
            Ok(transaction) => Arc::new(transaction),
            Err(e) => {
                let peers = unit.finish_invalid();
                debug!("Invalid transaction payload: {}", e);
                for peer in &peers {
                    self.punish(peer).await;
                }
                return;
            }
        };

        let peers = unit.finish_valid(Arc::clone(&transaction));
        let requested = self.mark_received(transaction.hash());
        let known = self.collaborators.store.contains(transaction.hash());

        if known {
            ServerMetrics::inc(&self.metrics.known_transactions);
        } else {
            ServerMetrics::inc(&self.metrics.new_transactions);
            if let Some(peer) = peer {
                peer.metrics()
                    .new_transactions
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        // everyone else who delivered the bytes while we validated already has them
        let delivering = peer.map(|p| p.id());
        for other in peers.iter().filter(|p| Some(p.id()) != delivering) {
            other
                .metrics()
                .known_transactions
                .fetch_add(1, Ordering::Relaxed);
        }

        self.emit(GossipEvent::TransactionProcessed {
            transaction: Arc::clone(&transaction),
            requested,
        });

        if requested || known {
            return;
        }

        let excluded: HashSet<SocketAddr> = peers.iter().map(|p| p.id()).collect();
        let excluded_count = excluded.len();
        let item = BroadcastItem::new(transaction_message(unit.data().clone()), excluded);
        if self.broadcast.enqueue(item).await {
            self.emit(GossipEvent::TransactionBroadcast {
                transaction,
                excluded: excluded_count,
            });
        }
    }

    fn mark_received(&self, hash: &TransactionHash) -> bool {
        lock::lock(&self.requests).received(hash).is_some()
    }

    /// Remove a peer that sent invalid data
    async fn punish(&self, peer: &Arc<Peer>) {
        peer.metrics()
            .invalid_transactions
            .fetch_add(1, Ordering::Relaxed);
        ServerMetrics::inc(&self.metrics.invalid_transactions);
        if peer.is_removed() {
            return;
        }

        warn!("Removing peer {} for sending an invalid transaction", peer);
        if self.manager.remove(&peer.id().to_string()).await {
            ServerMetrics::inc(&self.metrics.punished_peers);
        }
    }

    fn answer_transaction_request(&self, peer: &Arc<Peer>, hash: TransactionHash) {
        peer.metrics()
            .received_transaction_requests
            .fetch_add(1, Ordering::Relaxed);
        ServerMetrics::inc(&self.metrics.received_transaction_requests);

        match self.collaborators.store.get(&hash) {
            Some(transaction) => self.send_transaction(peer, &transaction),
            None => {
                trace!("Peer {} requested unknown transaction {}", peer, hash);
                ServerMetrics::inc(&self.metrics.unknown_requests);
            }
        }
    }

    fn answer_milestone_request(&self, peer: &Arc<Peer>, index: MilestoneIndex) {
        peer.metrics()
            .received_milestone_requests
            .fetch_add(1, Ordering::Relaxed);
        ServerMetrics::inc(&self.metrics.received_milestone_requests);

        let index = if index == MilestoneRequest::LATEST {
            self.collaborators.sync.latest_milestone_index()
        } else {
            index
        };

        let transactions = self.collaborators.store.milestone_transactions(index);
        if transactions.is_empty() {
            trace!("Peer {} requested unknown milestone {}", peer, index);
            ServerMetrics::inc(&self.metrics.unknown_requests);
            return;
        }
        for transaction in &transactions {
            self.send_transaction(peer, transaction);
        }
    }

    fn send_transaction(&self, peer: &Peer, transaction: &Transaction) {
        if peer.enqueue(transaction_message(transaction.data().clone())) {
            ServerMetrics::inc(&self.metrics.sent_transactions);
        }
    }

    fn emit(&self, event: GossipEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
