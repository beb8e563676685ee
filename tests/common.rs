#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use gossip_node::gossip::Collaborators;
use gossip_node::network::handshake::FINGERPRINT_LENGTH;
use gossip_node::network::{
    AddressResolver, ConnectionInfo, Handshake, ManagerConfig, Message, NetworkEvent, Peer,
    PeerManager, ProtocolFeatures, ValidHandshake,
};
use gossip_node::storage::{
    AtomicSyncStatus, MemoryStore, Transaction, TransactionHash, TransactionValidator,
    ValidationError, TRANSACTION_HASH_LENGTH,
};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const TEST_MWM: u8 = 14;
pub const TEST_FINGERPRINT: [u8; FINGERPRINT_LENGTH] = [7u8; FINGERPRINT_LENGTH];

/// Payloads starting with this byte fail validation
pub const INVALID_MARKER: u8 = 0xff;

/// Resolves literal socket addresses only
pub struct StaticResolver;

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self, address: &str) -> std::io::Result<Vec<SocketAddr>> {
        address
            .parse::<SocketAddr>()
            .map(|a| vec![a])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e))
    }
}

/// Resolves `node.test` to loopback, but only once switched online
pub struct ToggleResolver {
    pub online: AtomicBool,
}

impl ToggleResolver {
    pub fn offline() -> Self {
        Self {
            online: AtomicBool::new(false),
        }
    }

    pub fn set_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AddressResolver for ToggleResolver {
    async fn resolve(&self, address: &str) -> std::io::Result<Vec<SocketAddr>> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "resolver offline",
            ));
        }
        let port = address
            .strip_prefix("node.test:")
            .and_then(|port| port.parse::<u16>().ok())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, address.to_string()))?;
        Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))])
    }
}

pub fn valid_handshake(server_port: u16) -> ValidHandshake {
    ValidHandshake {
        server_port,
        fingerprint: TEST_FINGERPRINT,
        mwm: TEST_MWM,
        features: ProtocolFeatures::STING,
    }
}

pub fn manager_config(max_peers: usize, accept_any_peer: bool) -> ManagerConfig {
    ManagerConfig {
        max_peers,
        accept_any_peer,
        valid_handshake: valid_handshake(0),
        reconnect_interval: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(2),
        send_queue_size: 16,
        event_queue_size: 64,
        synced_count_cooldown: Duration::ZERO,
    }
}

pub fn new_manager(
    max_peers: usize,
    accept_any_peer: bool,
) -> (Arc<PeerManager>, mpsc::Receiver<NetworkEvent>) {
    PeerManager::new(manager_config(max_peers, accept_any_peer), Arc::new(StaticResolver))
}

/// Handshake a remote with matching parameters would send
pub fn remote_handshake(server_port: u16) -> Handshake {
    Handshake::new(server_port, TEST_FINGERPRINT, TEST_MWM, ProtocolFeatures::STING)
}

/// Register an inbound peer `ip:port` without a socket
pub async fn register_peer(
    manager: &PeerManager,
    ip: &str,
    port: u16,
) -> (Arc<Peer>, mpsc::Receiver<Message>) {
    let address: SocketAddr = format!("{}:{}", ip, 50000 + port % 10000).parse().unwrap();
    manager
        .verify_handshake(&ConnectionInfo::inbound(address), &remote_handshake(port))
        .await
        .expect("handshake should verify")
}

/// Hash used by [`CountingValidator`]
pub fn hash_of(data: &[u8]) -> TransactionHash {
    let digest = Sha256::digest(data);
    let mut bytes = [0u8; TRANSACTION_HASH_LENGTH];
    bytes[..digest.len()].copy_from_slice(&digest);
    TransactionHash::new(bytes)
}

/// Validator that counts its invocations and can be slowed down
pub struct CountingValidator {
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl CountingValidator {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TransactionValidator for CountingValidator {
    fn parse_and_validate(&self, data: &Bytes) -> Result<Transaction, ValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if data.is_empty() {
            return Err(ValidationError::Malformed("empty payload".to_string()));
        }
        if data[0] == INVALID_MARKER {
            return Err(ValidationError::InsufficientWork);
        }
        Ok(Transaction::new(hash_of(data), data.clone()))
    }
}

pub struct TestLedger {
    pub store: Arc<MemoryStore>,
    pub validator: Arc<CountingValidator>,
    pub sync: Arc<AtomicSyncStatus>,
}

impl TestLedger {
    pub fn new(validation_delay: Duration) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            validator: Arc::new(CountingValidator::new(validation_delay)),
            sync: Arc::new(AtomicSyncStatus::new(100, 0, 100)),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            validator: self.validator.clone(),
            sync: self.sync.clone(),
        }
    }
}

/// Wait for the next manager event
pub async fn next_event(events: &mut mpsc::Receiver<NetworkEvent>) -> NetworkEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for network event")
        .expect("event channel closed")
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
