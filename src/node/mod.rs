//! Gossip node orchestration
//!
//! `GossipNode` wires the connection manager, the processor, the broadcast
//! queue and the request loops together. Everything is built in [`GossipNode::new`]
//! from explicit collaborators; [`GossipNode::start`] spawns the background
//! loops and [`GossipNode::shutdown`] stops them.

pub mod events;

use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use events::{DiscoveryEvent, GossipEvent};

use crate::config::GossipConfig;
use crate::gossip::{
    broadcast_queue, Broadcaster, Collaborators, Processor, ProcessorConfig, Request,
    RequestQueue, RequestQueueSnapshot, Requester, RequesterConfig, ServerMetrics,
    ServerMetricsSnapshot, SharedRequestQueue,
};
use crate::network::{
    AddressResolver, AutopeerInfo, DnsResolver, Heartbeat, ManagerConfig, ManagerError,
    NetworkEvent, PeerInfo, PeerManager, ProtocolFeatures,
};
use crate::storage::{MilestoneIndex, SyncStatus, TransactionHash};
use crate::utils::lock;
use crate::utils::Shutdown;

/// Capacity of the notification channel; slower subscribers lag
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A gossip node
pub struct GossipNode {
    config: GossipConfig,
    manager: Arc<PeerManager>,
    processor: Arc<Processor>,
    requester: Arc<Requester>,
    requests: SharedRequestQueue,
    sync: Arc<dyn SyncStatus>,
    metrics: Arc<ServerMetrics>,
    events: broadcast::Sender<GossipEvent>,
    network_events: Option<mpsc::Receiver<NetworkEvent>>,
    broadcaster: Option<Broadcaster>,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

impl GossipNode {
    /// Create a node resolving peer addresses through DNS
    pub fn new(config: GossipConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_resolver(config, collaborators, Arc::new(DnsResolver))
    }

    pub fn with_resolver(
        config: GossipConfig,
        collaborators: Collaborators,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing gossip node");

        let manager_config = ManagerConfig::from_gossip_config(&config)?;
        let (manager, network_events) = PeerManager::new(manager_config, resolver);

        let metrics = Arc::new(ServerMetrics::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let requests = Arc::new(std::sync::Mutex::new(RequestQueue::new(
            config.requests.latency_window,
        )));

        let (broadcast, broadcaster) = broadcast_queue(
            config.broadcast_queue_size,
            Arc::clone(&manager),
            Arc::clone(&metrics),
        );

        let sync = Arc::clone(&collaborators.sync);
        let processor = Processor::new(
            ProcessorConfig::from_gossip_config(&config),
            Arc::clone(&manager),
            collaborators,
            Arc::clone(&requests),
            broadcast,
            Arc::clone(&metrics),
            events.clone(),
        );

        let requester = Requester::new(
            RequesterConfig::from_gossip_config(&config),
            Arc::clone(&manager),
            Arc::clone(&requests),
            Arc::clone(&metrics),
        );

        Ok(Self {
            config,
            manager,
            processor,
            requester,
            requests,
            sync,
            metrics,
            events,
            network_events: Some(network_events),
            broadcaster: Some(broadcaster),
            shutdown: Shutdown::new(),
            tasks: Vec::new(),
        })
    }

    /// Bind the listener, add the configured peers and spawn all loops
    ///
    /// Returns the bound listener address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let (Some(network_events), Some(broadcaster)) =
            (self.network_events.take(), self.broadcaster.take())
        else {
            anyhow::bail!("gossip node already started");
        };
        info!("Starting gossip node");

        let bound = self
            .manager
            .listen(&self.config.bind_address)
            .await
            .context("failed to start gossip listener")?;

        for peer in &self.config.peers {
            if let Err(e) = self
                .manager
                .add(&peer.address, peer.prefer_ipv6, peer.alias.clone(), None)
                .await
            {
                warn!("Failed to add configured peer {}: {}", peer.address, e);
            }
        }

        let shutdown = self.shutdown.to_signal();
        let mut tasks = vec![
            self.manager.start_reconnect_loop(),
            tokio::spawn(broadcaster.run(shutdown.clone())),
            self.spawn_event_loop(network_events),
            self.spawn_heartbeat_loop(),
        ];
        tasks.extend(self.processor.start(shutdown.clone()));
        tasks.extend(self.requester.start(shutdown));
        self.tasks.extend(tasks);

        info!("Gossip node running on {}", bound);
        Ok(bound)
    }

    fn spawn_event_loop(&self, mut network_events: mpsc::Receiver<NetworkEvent>) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let processor = Arc::clone(&self.processor);
        let sync = Arc::clone(&self.sync);
        let metrics = Arc::clone(&self.metrics);
        let events = self.events.clone();
        let mut shutdown = self.shutdown.to_signal();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.wait() => break,
                    event = network_events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    NetworkEvent::PeerConnected(peer) => {
                        if peer.supports(ProtocolFeatures::STING) {
                            let heartbeat = build_heartbeat(&manager, sync.as_ref()).await;
                            if peer.enqueue(heartbeat.encode()) {
                                ServerMetrics::inc(&metrics.sent_heartbeats);
                            }
                        }
                        let _ = events.send(GossipEvent::PeerConnected(peer));
                    }
                    NetworkEvent::PeerDisconnected(peer) => {
                        let _ = events.send(GossipEvent::PeerDisconnected(peer));
                    }
                    NetworkEvent::MessageReceived(peer, message) => {
                        if !processor
                            .process(peer, message.message_type, message.payload)
                            .await
                        {
                            break;
                        }
                    }
                }
            }
            debug!("Network event loop stopped");
        })
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let sync = Arc::clone(&self.sync);
        let metrics = Arc::clone(&self.metrics);
        let period = self.config.heartbeat_interval();
        let mut shutdown = self.shutdown.to_signal();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = interval.tick() => {}
                }

                let message = build_heartbeat(&manager, sync.as_ref()).await.encode();
                manager
                    .for_all_connected(|peer| {
                        if peer.supports(ProtocolFeatures::STING)
                            && peer.enqueue(message.clone())
                        {
                            ServerMetrics::inc(&metrics.sent_heartbeats);
                        }
                        true
                    })
                    .await;
            }
            debug!("Heartbeat loop stopped");
        })
    }

    /// Stop all loops and close every connection
    pub async fn shutdown(&mut self) {
        info!("Stopping gossip node");
        self.shutdown.trigger();
        self.manager.shutdown().await;
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Gossip task failed: {}", e);
                }
            }
        }
        info!("Gossip node stopped");
    }

    /// Receive gossip notifications
    pub fn subscribe(&self) -> broadcast::Receiver<GossipEvent> {
        self.events.subscribe()
    }

    /// Apply a decision of the peer discovery subsystem
    pub async fn handle_discovery_event(&self, event: DiscoveryEvent) -> Result<(), ManagerError> {
        match event {
            DiscoveryEvent::PeerProposed { address, identity } => {
                let autopeer = AutopeerInfo {
                    identity,
                    address: address.clone(),
                };
                self.manager.add(&address, false, None, Some(autopeer)).await
            }
            DiscoveryEvent::PeerDropped { address } => {
                self.manager.remove(&address).await;
                Ok(())
            }
        }
    }

    /// Add a static peer
    pub async fn add_peer(
        &self,
        address: &str,
        prefer_ipv6: bool,
        alias: Option<String>,
    ) -> Result<(), ManagerError> {
        self.manager.add(address, prefer_ipv6, alias, None).await
    }

    /// Remove a peer by id or configured address and blacklist it
    pub async fn remove_peer(&self, id: &str) -> bool {
        self.manager.remove(id).await
    }

    /// Ask peers for a transaction the ledger is missing
    pub fn request_transaction(&self, hash: TransactionHash, milestone_index: MilestoneIndex) -> bool {
        self.requester.request(Request::new(hash, milestone_index))
    }

    /// Ask a peer holding the milestone for its transactions (0 = latest)
    pub async fn request_milestone(&self, index: MilestoneIndex) -> bool {
        self.requester.request_milestone(index).await
    }

    /// Tell the request queue that a requested transaction was stored
    pub fn transaction_stored(&self, hash: &TransactionHash) -> bool {
        lock::lock(&self.requests).processed(hash).is_some()
    }

    /// Process a transaction created by this node and broadcast it if valid
    pub async fn submit_transaction(&self, data: Bytes) {
        self.processor.process_transaction(None, data).await;
    }

    pub fn manager(&self) -> &Arc<PeerManager> {
        &self.manager
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn request_queue(&self) -> &SharedRequestQueue {
        &self.requests
    }

    pub fn metrics(&self) -> ServerMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn request_queue_status(&self) -> RequestQueueSnapshot {
        lock::lock(&self.requests).snapshot()
    }

    /// Summaries of all connected peers
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.manager
            .connected_peers()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }
}

/// Snapshot of this node's state for heartbeats
async fn build_heartbeat(manager: &PeerManager, sync: &dyn SyncStatus) -> Heartbeat {
    let clamp = |n: usize| n.min(u8::MAX as usize) as u8;
    Heartbeat {
        solid_milestone_index: sync.solid_milestone_index(),
        pruned_milestone_index: sync.pruned_milestone_index(),
        latest_milestone_index: sync.latest_milestone_index(),
        connected_peers: clamp(manager.connected_peer_count().await),
        synced_peers: clamp(manager.connected_and_synced_peer_count().await),
    }
}
