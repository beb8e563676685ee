//! Connection manager
//!
//! Owns the peer population: the listener, outbound dialing, handshake
//! verification, the reconnect pool and the white/blacklists. All membership
//! state lives in one [`ManagerState`] behind a single lock, and handshake
//! verification is serialized so slot and whitelist decisions never race.
//!
//! Peers are keyed by `ip:advertised_server_port`. Inbound connections arrive
//! from ephemeral ports, so the remote socket address alone cannot identify
//! a node.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::MessageCodec;
use super::error::{HandshakeError, ManagerError};
use super::handshake::{Handshake, ValidHandshake, MESSAGE_TYPE_HANDSHAKE};
use super::message::{Message, MessageRegistry};
use super::peer::{AutopeerInfo, Peer, PeerOrigin};
use super::protocol::{
    gossip_registry, MESSAGE_TYPE_HEARTBEAT, MESSAGE_TYPE_TRANSACTION,
    MESSAGE_TYPE_TRANSACTION_REQUEST,
};
use crate::config::GossipConfig;
use crate::utils::lock;
use crate::utils::{Shutdown, ShutdownSignal};

/// Statically configured address of a peer, as given by the operator or discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginAddress {
    /// `host:port` as configured
    pub addr: String,
    pub port: u16,
    pub prefer_ipv6: bool,
    pub alias: Option<String>,
}

impl OriginAddress {
    pub fn parse(
        addr: &str,
        prefer_ipv6: bool,
        alias: Option<String>,
    ) -> Result<Self, ManagerError> {
        let invalid = |reason: &str| ManagerError::InvalidPeerAddress {
            address: addr.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

        Ok(Self {
            addr: addr.to_string(),
            port,
            prefer_ipv6,
            alias,
        })
    }
}

impl fmt::Display for OriginAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} ({})", self.addr, alias),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// Entry of the reconnect pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRecord {
    pub origin: OriginAddress,
    /// IPs the origin resolved to on the last attempt
    pub cached_ips: Vec<IpAddr>,
    pub autopeer: Option<AutopeerInfo>,
}

impl ReconnectRecord {
    /// Peer ids the record resolved to
    pub fn endpoints(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.cached_ips
            .iter()
            .map(move |ip| SocketAddr::new(*ip, self.origin.port))
    }

    fn matches(&self, id: &SocketAddr) -> bool {
        self.endpoints().any(|e| &e == id)
    }
}

/// What is known about a connection before its handshake is verified
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote socket address of the stream
    pub address: SocketAddr,
    pub origin: PeerOrigin,
    /// Address that was dialed (outbound only)
    pub origin_address: Option<OriginAddress>,
    pub autopeer: Option<AutopeerInfo>,
}

impl ConnectionInfo {
    pub fn inbound(address: SocketAddr) -> Self {
        Self {
            address,
            origin: PeerOrigin::Inbound,
            origin_address: None,
            autopeer: None,
        }
    }

    pub fn outbound(address: SocketAddr, record: &ReconnectRecord) -> Self {
        Self {
            address,
            origin: PeerOrigin::Outbound,
            origin_address: Some(record.origin.clone()),
            autopeer: record.autopeer.clone(),
        }
    }
}

/// Notifications emitted by the manager
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    PeerConnected(Arc<Peer>),
    PeerDisconnected(Arc<Peer>),
    MessageReceived(Arc<Peer>, Message),
}

/// A peer known to the manager
#[derive(Debug, Clone)]
pub enum PeerEntry {
    Connected(Arc<Peer>),
    Reconnecting(ReconnectRecord),
}

/// Resolves configured peer addresses to socket addresses
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, address: &str) -> std::io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve(&self, address: &str) -> std::io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host(address).await?.collect())
    }
}

/// Pick the address to dial, honoring the IP family preference
fn select_address(resolved: &[SocketAddr], prefer_ipv6: bool) -> Option<SocketAddr> {
    resolved
        .iter()
        .find(|a| a.is_ipv6() == prefer_ipv6)
        .or_else(|| resolved.first())
        .copied()
}

/// Connection manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of non-autopeered connected peers
    pub max_peers: usize,
    pub accept_any_peer: bool,
    pub valid_handshake: ValidHandshake,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub send_queue_size: usize,
    pub event_queue_size: usize,
    pub synced_count_cooldown: Duration,
}

impl ManagerConfig {
    pub fn from_gossip_config(config: &GossipConfig) -> anyhow::Result<Self> {
        Ok(Self {
            max_peers: config.max_peers,
            accept_any_peer: config.accept_any_peer,
            valid_handshake: config.valid_handshake()?,
            reconnect_interval: config.reconnect_interval(),
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            write_timeout: config.write_timeout(),
            send_queue_size: config.send_queue_size,
            event_queue_size: config.event_queue_size,
            synced_count_cooldown: config.synced_count_cooldown(),
        })
    }
}

#[derive(Default)]
struct ManagerState {
    connected: HashMap<SocketAddr, Arc<Peer>>,
    reconnect: HashMap<String, ReconnectRecord>,
    whitelist: HashMap<SocketAddr, Option<AutopeerInfo>>,
    blacklist: HashSet<IpAddr>,
}

impl ManagerState {
    fn static_peer_count(&self) -> usize {
        self.connected
            .values()
            .filter(|p| !p.is_autopeered())
            .count()
    }

    fn connected_by_any(&self, ids: &[SocketAddr]) -> Option<Arc<Peer>> {
        ids.iter().find_map(|id| self.connected.get(id)).cloned()
    }

    /// Take the reconnect record a freshly connected peer resolves to
    fn take_record_for(&mut self, id: &SocketAddr) -> Option<ReconnectRecord> {
        let key = self
            .reconnect
            .iter()
            .find(|(_, record)| record.matches(id))
            .map(|(key, _)| key.clone())?;
        self.reconnect.remove(&key)
    }
}

/// Connection manager
pub struct PeerManager {
    config: ManagerConfig,
    registry: Arc<MessageRegistry>,
    resolver: Arc<dyn AddressResolver>,
    state: RwLock<ManagerState>,
    handshake_lock: Mutex<()>,
    local_port: AtomicU16,
    events: mpsc::Sender<NetworkEvent>,
    reconnect_notify: Notify,
    synced_count_cache: std::sync::Mutex<Option<(Instant, usize)>>,
    shutdown: Shutdown,
}

impl PeerManager {
    /// Create a manager and the receiver of its events
    pub fn new(
        config: ManagerConfig,
        resolver: Arc<dyn AddressResolver>,
    ) -> (Arc<Self>, mpsc::Receiver<NetworkEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_queue_size.max(1));
        let manager = Self {
            local_port: AtomicU16::new(config.valid_handshake.server_port),
            config,
            registry: Arc::new(gossip_registry()),
            resolver,
            state: RwLock::new(ManagerState::default()),
            handshake_lock: Mutex::new(()),
            events,
            reconnect_notify: Notify::new(),
            synced_count_cache: std::sync::Mutex::new(None),
            shutdown: Shutdown::new(),
        };
        (Arc::new(manager), events_rx)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Port announced in our handshakes
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Relaxed)
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.to_signal()
    }

    /// The handshake this node sends on every new connection
    pub fn local_handshake(&self) -> Handshake {
        let mut handshake = self.config.valid_handshake.local_handshake();
        handshake.server_port = self.local_port();
        handshake
    }

    /// Bind the listener and accept inbound connections until shutdown
    ///
    /// Returns the bound address. The announced server port follows the bound
    /// port, so binding to port 0 works.
    pub async fn listen(self: &Arc<Self>, bind_address: &str) -> Result<SocketAddr, ManagerError> {
        let address: SocketAddr =
            bind_address
                .parse()
                .map_err(|e: std::net::AddrParseError| ManagerError::InvalidBindAddress {
                    address: bind_address.to_string(),
                    reason: e.to_string(),
                })?;

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ManagerError::Bind { address, source })?;
        let local = listener.local_addr()?;
        self.local_port.store(local.port(), Ordering::Relaxed);
        info!("Gossip listener bound to {}", local);

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.to_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            if manager.is_blacklisted(remote.ip()).await {
                                debug!("Rejected connection from blacklisted address {}", remote);
                                continue;
                            }
                            debug!("Accepted connection from {}", remote);
                            let manager = Arc::clone(&manager);
                            tokio::spawn(async move {
                                manager
                                    .handle_connection(stream, ConnectionInfo::inbound(remote), None)
                                    .await;
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            debug!("Gossip listener on {} stopped", local);
        });

        Ok(local)
    }

    /// Try to connect every entry of the reconnect pool
    pub async fn reconnect(self: &Arc<Self>) {
        let origins: Vec<(String, OriginAddress)> = {
            let state = self.state.read().await;
            state
                .reconnect
                .iter()
                .map(|(key, record)| (key.clone(), record.origin.clone()))
                .collect()
        };

        for (key, origin) in origins {
            if self.shutdown.is_triggered() {
                return;
            }

            let resolved = match self.resolver.resolve(&origin.addr).await {
                Ok(resolved) if !resolved.is_empty() => resolved,
                Ok(_) => {
                    debug!("Peer address {} resolved to nothing", origin);
                    continue;
                }
                Err(e) => {
                    debug!("Failed to resolve peer address {}: {}", origin, e);
                    continue;
                }
            };
            let Some(target) = select_address(&resolved, origin.prefer_ipv6) else {
                continue;
            };

            let record = {
                let mut state = self.state.write().await;
                let Some(mut record) = state.reconnect.remove(&key) else {
                    // removed while resolving
                    continue;
                };
                record.cached_ips = resolved.iter().map(|a| a.ip()).collect();
                let ids: Vec<SocketAddr> = record.endpoints().collect();
                for id in &ids {
                    state.whitelist.insert(*id, record.autopeer.clone());
                }

                if let Some(peer) = state.connected_by_any(&ids) {
                    debug!("Peer {} is already connected as {}", origin, peer);
                    if peer.origin_address().is_none() {
                        peer.set_origin_address(record.origin);
                    }
                    continue;
                }
                record
            };

            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.dial(record, target).await });
        }
    }

    /// Run [`Self::reconnect`] every reconnect interval (or when woken) until shutdown
    pub fn start_reconnect_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.to_signal();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.reconnect_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = interval.tick() => {}
                    _ = manager.reconnect_notify.notified() => {}
                }
                manager.reconnect().await;
            }
            debug!("Reconnect loop stopped");
        })
    }

    async fn dial(self: Arc<Self>, record: ReconnectRecord, target: SocketAddr) {
        debug!("Connecting to {} at {}", record.origin, target);
        match timeout(self.config.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                let info = ConnectionInfo::outbound(target, &record);
                self.handle_connection(stream, info, Some(record)).await;
            }
            Ok(Err(e)) => {
                debug!("Failed to connect to {}: {}", record.origin, e);
                self.return_to_pool(record).await;
            }
            Err(_) => {
                debug!("Connecting to {} timed out", record.origin);
                self.return_to_pool(record).await;
            }
        }
    }

    async fn return_to_pool(&self, record: ReconnectRecord) {
        if self.shutdown.is_triggered() {
            return;
        }
        let mut state = self.state.write().await;
        if record.cached_ips.iter().any(|ip| state.blacklist.contains(ip)) {
            return;
        }
        if state.connected_by_any(&record.endpoints().collect::<Vec<_>>()).is_some() {
            return;
        }
        state
            .reconnect
            .entry(record.origin.addr.clone())
            .or_insert(record);
    }

    /// Verify a remote handshake and register the connection as a peer
    ///
    /// Checks run in a fixed order: difficulty, fingerprint, protocol version,
    /// advertised port (outbound only), static slots, duplicate connection and
    /// finally whitelist/blacklist. A handshake from an unknown peer blacklists
    /// its IP. On success the returned peer is already in the connected set.
    pub async fn verify_handshake(
        &self,
        info: &ConnectionInfo,
        handshake: &Handshake,
    ) -> Result<(Arc<Peer>, mpsc::Receiver<Message>), HandshakeError> {
        let _guard = self.handshake_lock.lock().await;

        let version = self.config.valid_handshake.check(handshake)?;

        if info.origin == PeerOrigin::Outbound && handshake.server_port != info.address.port() {
            return Err(HandshakeError::PortMismatch {
                advertised: handshake.server_port,
                dialed: info.address.port(),
            });
        }

        let id = SocketAddr::new(info.address.ip(), handshake.server_port);
        let mut state = self.state.write().await;

        let whitelisted = state.whitelist.get(&id).cloned();
        let autopeer = info.autopeer.clone().or_else(|| whitelisted.clone().flatten());

        if autopeer.is_none() && state.static_peer_count() >= self.config.max_peers {
            return Err(HandshakeError::SlotsFilled);
        }

        if state.connected.contains_key(&id) {
            return Err(HandshakeError::AlreadyConnected(id));
        }

        // dialed endpoints are whitelisted before the dial, so a peer removed
        // while its dial was in flight is no longer known here
        if whitelisted.is_none() {
            if state.blacklist.contains(&id.ip()) {
                return Err(HandshakeError::Blacklisted(id.ip()));
            }
            if !self.config.accept_any_peer {
                state.blacklist.insert(id.ip());
                return Err(HandshakeError::UnknownPeer(id));
            }
        }

        let origin_address = match info.origin {
            PeerOrigin::Outbound => info.origin_address.clone(),
            PeerOrigin::Inbound => state.take_record_for(&id).map(|record| record.origin),
        };
        if let Some(origin) = &origin_address {
            // the dialed record was taken out of the pool before connecting
            state.reconnect.remove(&origin.addr);
        }

        let features = handshake.features & self.config.valid_handshake.features;
        let (peer, send_rx) = Peer::new(
            id,
            info.address,
            info.origin,
            version,
            features,
            self.config.send_queue_size,
        );
        let peer = Arc::new(
            peer.with_origin_address(origin_address)
                .with_autopeer(autopeer),
        );
        state.connected.insert(id, Arc::clone(&peer));

        Ok((peer, send_rx))
    }

    /// Drive one connection: handshake, then message exchange until it closes
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        info: ConnectionInfo,
        record: Option<ReconnectRecord>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", info.address, e);
        }
        let mut framed = Framed::new(stream, MessageCodec::new(Arc::clone(&self.registry)));

        let handshake = match self.exchange_handshakes(&mut framed, &info).await {
            Ok(handshake) => handshake,
            Err(reason) => {
                warn!("Handshake with {} failed: {}", info.address, reason);
                if let Some(record) = record {
                    self.return_to_pool(record).await;
                }
                return;
            }
        };

        let (peer, send_rx) = match self.verify_handshake(&info, &handshake).await {
            Ok(verified) => verified,
            Err(e) => {
                warn!("Rejected {} handshake from {}: {}", info.origin, info.address, e);
                if let Some(record) = record {
                    if !matches!(e, HandshakeError::AlreadyConnected(_)) {
                        self.return_to_pool(record).await;
                    }
                }
                return;
            }
        };

        info!(
            "Connected {} peer {} (protocol version {})",
            peer.origin(),
            peer,
            peer.protocol_version()
        );
        let _ = self
            .events
            .send(NetworkEvent::PeerConnected(Arc::clone(&peer)))
            .await;

        self.run_peer(&peer, framed, send_rx).await;
        self.on_disconnect(&peer).await;
    }

    async fn exchange_handshakes(
        &self,
        framed: &mut Framed<TcpStream, MessageCodec>,
        info: &ConnectionInfo,
    ) -> Result<Handshake, HandshakeError> {
        let missing = |reason: String| HandshakeError::Missing(reason);

        match timeout(
            self.config.write_timeout,
            framed.send(self.local_handshake().to_message()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(missing(format!("failed to send handshake: {}", e))),
            Err(_) => return Err(missing("sending handshake timed out".to_string())),
        }

        let message = match timeout(self.config.handshake_timeout, framed.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => return Err(missing(e.to_string())),
            Ok(None) => return Err(missing("connection closed".to_string())),
            Err(_) => return Err(missing("timed out".to_string())),
        };

        if message.message_type != MESSAGE_TYPE_HANDSHAKE {
            return Err(missing(format!(
                "{} sent message type {} first",
                info.address, message.message_type
            )));
        }

        Handshake::parse(&message.payload).map_err(|e| missing(e.to_string()))
    }

    async fn run_peer(
        &self,
        peer: &Arc<Peer>,
        framed: Framed<TcpStream, MessageCodec>,
        mut send_rx: mpsc::Receiver<Message>,
    ) {
        let (mut sink, mut stream) = framed.split();
        let write_timeout = self.config.write_timeout;

        let writer_peer = Arc::clone(peer);
        let mut writer_close = peer.close_signal();
        let writer = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = writer_close.wait() => break,
                    message = send_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let message_type = message.message_type;
                match timeout(write_timeout, sink.send(message)).await {
                    Ok(Ok(())) => count_sent(&writer_peer, message_type),
                    Ok(Err(e)) => {
                        if !writer_peer.is_disconnected() {
                            warn!("Write to peer {} failed: {}", writer_peer, e);
                        }
                        break;
                    }
                    Err(_) => {
                        warn!("Write to peer {} timed out", writer_peer);
                        break;
                    }
                }
            }
            writer_peer.close();
            let _ = sink.close().await;
        });

        let mut close = peer.close_signal();
        let mut shutdown = self.shutdown.to_signal();
        loop {
            tokio::select! {
                _ = close.wait() => break,
                _ = shutdown.wait() => break,
                frame = stream.next() => match frame {
                    Some(Ok(message)) => {
                        peer.metrics().received_messages.fetch_add(1, Ordering::Relaxed);
                        if self
                            .events
                            .send(NetworkEvent::MessageReceived(Arc::clone(peer), message))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        if !peer.is_disconnected() {
                            warn!("Read from peer {} failed: {}", peer, e);
                        }
                        break;
                    }
                    None => {
                        debug!("Peer {} closed the connection", peer);
                        break;
                    }
                }
            }
        }

        peer.mark_disconnected();
        peer.close();
        let _ = writer.await;
    }

    async fn on_disconnect(&self, peer: &Arc<Peer>) {
        peer.mark_disconnected();
        {
            let mut state = self.state.write().await;
            if state
                .connected
                .get(&peer.id())
                .is_some_and(|p| Arc::ptr_eq(p, peer))
            {
                state.connected.remove(&peer.id());
            }

            let reconnect = !peer.is_removed()
                && !peer.is_autopeered()
                && !self.shutdown.is_triggered();
            if reconnect {
                if let Some(origin) = peer.origin_address() {
                    state
                        .reconnect
                        .entry(origin.addr.clone())
                        .or_insert_with(|| ReconnectRecord {
                            origin,
                            cached_ips: vec![peer.id().ip()],
                            autopeer: None,
                        });
                }
            }
        }

        info!("Disconnected peer {}", peer);
        let _ = self
            .events
            .send(NetworkEvent::PeerDisconnected(Arc::clone(peer)))
            .await;
    }

    /// Add a peer to the reconnect pool and whitelist it
    ///
    /// Adding a static peer that is currently known only as autopeered promotes it
    /// to static in place, without disconnecting.
    pub async fn add(
        &self,
        address: &str,
        prefer_ipv6: bool,
        alias: Option<String>,
        autopeer: Option<AutopeerInfo>,
    ) -> Result<(), ManagerError> {
        let origin = OriginAddress::parse(address, prefer_ipv6, alias)?;

        let cached_ips: Vec<IpAddr> = match self.resolver.resolve(&origin.addr).await {
            Ok(resolved) => resolved.iter().map(|a| a.ip()).collect(),
            Err(e) => {
                // retried by the reconnect loop
                debug!("Failed to resolve {} while adding: {}", origin, e);
                Vec::new()
            }
        };
        let record = ReconnectRecord {
            origin,
            cached_ips,
            autopeer,
        };
        let ids: Vec<SocketAddr> = record.endpoints().collect();

        {
            let mut state = self.state.write().await;

            if let Some(peer) = state.connected_by_any(&ids) {
                if record.autopeer.is_none() && peer.promote_to_static() {
                    info!("Promoted autopeered peer {} to static", peer);
                    peer.set_origin_address(record.origin.clone());
                    for id in &ids {
                        state.whitelist.insert(*id, None);
                    }
                    return Ok(());
                }
                return Err(ManagerError::AlreadyConnected(record.origin.addr));
            }

            if let Some(existing) = state.reconnect.get_mut(&record.origin.addr) {
                if record.autopeer.is_none() && existing.autopeer.is_some() {
                    existing.autopeer = None;
                    for id in &ids {
                        state.whitelist.insert(*id, None);
                    }
                    return Ok(());
                }
                return Err(ManagerError::AlreadyInReconnect(record.origin.addr));
            }

            for id in &ids {
                state.whitelist.insert(*id, record.autopeer.clone());
                state.blacklist.remove(&id.ip());
            }
            info!("Added peer {}", record.origin);
            state.reconnect.insert(record.origin.addr.clone(), record);
        }

        self.reconnect_notify.notify_one();
        Ok(())
    }

    /// Remove a peer and blacklist its address
    ///
    /// `id` is either a peer id (`ip:port`) or the configured origin address.
    /// Closes the live connection, purges the peer from the reconnect pool and
    /// whitelist. Also used to punish misbehaving peers.
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.write().await;

        let mut ids: Vec<SocketAddr> = Vec::new();
        let mut found = false;
        if let Ok(addr) = id.parse::<SocketAddr>() {
            found |= state.whitelist.contains_key(&addr);
            ids.push(addr);
        }
        if let Some(record) = state.reconnect.remove(id) {
            found = true;
            ids.extend(record.endpoints());
        }

        let peers: Vec<Arc<Peer>> = state
            .connected
            .values()
            .filter(|p| {
                ids.contains(&p.id()) || p.origin_address().is_some_and(|o| o.addr == id)
            })
            .cloned()
            .collect();

        for peer in &peers {
            state.connected.remove(&peer.id());
            peer.mark_removed();
            peer.mark_disconnected();
            peer.close();
            ids.push(peer.id());
            if let Some(origin) = peer.origin_address() {
                state.reconnect.remove(&origin.addr);
            }
        }

        found |= !peers.is_empty();
        let pool_size = state.reconnect.len();
        state.reconnect.retain(|_, record| !ids.iter().any(|i| record.matches(i)));
        found |= state.reconnect.len() != pool_size;
        for id in &ids {
            state.whitelist.remove(id);
            state.blacklist.insert(id.ip());
        }

        if found {
            info!("Removed peer {}", id);
        }
        found
    }

    /// Whether all static slots are in use
    pub async fn slots_filled(&self) -> bool {
        self.state.read().await.static_peer_count() >= self.config.max_peers
    }

    /// Connected peers plus reconnect pool entries
    pub async fn peer_count(&self) -> usize {
        let state = self.state.read().await;
        state.connected.len() + state.reconnect.len()
    }

    pub async fn connected_peer_count(&self) -> usize {
        self.state.read().await.connected.len()
    }

    /// Number of connected peers whose last heartbeat reports them synced
    ///
    /// The result is cached for the configured cooldown.
    pub async fn connected_and_synced_peer_count(&self) -> usize {
        if let Some((at, count)) = *lock::lock(&self.synced_count_cache) {
            if at.elapsed() < self.config.synced_count_cooldown {
                return count;
            }
        }

        let count = self
            .state
            .read()
            .await
            .connected
            .values()
            .filter(|p| p.is_synced())
            .count();
        *lock::lock(&self.synced_count_cache) = Some((Instant::now(), count));
        count
    }

    /// Snapshot of the connected peers
    pub async fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.state.read().await.connected.values().cloned().collect()
    }

    pub async fn peer(&self, id: &SocketAddr) -> Option<Arc<Peer>> {
        self.state.read().await.connected.get(id).cloned()
    }

    /// Call `f` for each handshaked peer until it returns false
    pub async fn for_all_connected<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Peer>) -> bool,
    {
        for peer in self.connected_peers().await {
            if !f(&peer) {
                break;
            }
        }
    }

    /// Call `f` for every known peer, connected or waiting for reconnect, until it returns false
    pub async fn for_all<F>(&self, mut f: F)
    where
        F: FnMut(&PeerEntry) -> bool,
    {
        let entries: Vec<PeerEntry> = {
            let state = self.state.read().await;
            state
                .connected
                .values()
                .cloned()
                .map(PeerEntry::Connected)
                .chain(state.reconnect.values().cloned().map(PeerEntry::Reconnecting))
                .collect()
        };
        for entry in &entries {
            if !f(entry) {
                break;
            }
        }
    }

    pub async fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.state.read().await.blacklist.contains(&ip)
    }

    pub async fn is_whitelisted(&self, id: &SocketAddr) -> bool {
        self.state.read().await.whitelist.contains_key(id)
    }

    pub async fn in_reconnect_pool(&self, origin: &str) -> bool {
        self.state.read().await.reconnect.contains_key(origin)
    }

    /// Close all connections and clear the reconnect pool
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let peers: Vec<Arc<Peer>> = {
            let mut state = self.state.write().await;
            state.reconnect.clear();
            state.connected.drain().map(|(_, peer)| peer).collect()
        };
        for peer in &peers {
            peer.mark_disconnected();
            peer.close();
        }
        info!("Connection manager stopped, closed {} connections", peers.len());
    }
}

fn count_sent(peer: &Peer, message_type: u8) {
    let metrics = peer.metrics();
    metrics.sent_messages.fetch_add(1, Ordering::Relaxed);
    let counter = match message_type {
        MESSAGE_TYPE_TRANSACTION => &metrics.sent_transactions,
        MESSAGE_TYPE_TRANSACTION_REQUEST => &metrics.sent_transaction_requests,
        MESSAGE_TYPE_HEARTBEAT => &metrics.sent_heartbeats,
        _ => return,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}
