//! Work units
//!
//! A work unit deduplicates one distinct raw transaction payload. All peers
//! delivering the same bytes share the unit, and its state machine makes sure
//! the payload is validated at most once:
//!
//! `New -> Hashing -> Hashed | Invalid`
//!
//! Terminal states never change again.

use bytes::Bytes;
use lru::LruCache;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::network::Peer;
use crate::storage::Transaction;
use crate::utils::lock;

/// Processing state of a work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnitState {
    New,
    Hashing,
    Invalid,
    Hashed,
}

/// What the caller of [`WorkUnit::begin`] has to do
#[derive(Debug)]
pub enum WorkAction {
    /// The caller owns validation and must call `finish_valid` or `finish_invalid`
    Validate,
    /// Another worker is validating; the peer was recorded and will be accounted for
    InProgress,
    /// The payload is known to be invalid
    Invalid,
    /// The payload was already validated
    Hashed(Arc<Transaction>),
}

#[derive(Debug)]
struct WorkUnitInner {
    state: WorkUnitState,
    transaction: Option<Arc<Transaction>>,
    peers: Vec<Arc<Peer>>,
}

/// Deduplication record for one raw payload
#[derive(Debug)]
pub struct WorkUnit {
    data: Bytes,
    inner: Mutex<WorkUnitInner>,
}

impl WorkUnit {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            inner: Mutex::new(WorkUnitInner {
                state: WorkUnitState::New,
                transaction: None,
                peers: Vec::new(),
            }),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn state(&self) -> WorkUnitState {
        lock::lock(&self.inner).state
    }

    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        lock::lock(&self.inner).transaction.clone()
    }

    /// Peers that delivered this payload
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        lock::lock(&self.inner).peers.clone()
    }

    /// Record `peer` as a sender and decide what the caller does next
    ///
    /// The first caller gets [`WorkAction::Validate`] and the unit enters
    /// `Hashing`; everyone else observes the current state.
    pub fn begin(&self, peer: Option<&Arc<Peer>>) -> WorkAction {
        let mut inner = lock::lock(&self.inner);
        if let Some(peer) = peer {
            if !inner.peers.iter().any(|p| p.id() == peer.id()) {
                inner.peers.push(Arc::clone(peer));
            }
        }

        match inner.state {
            WorkUnitState::New => {
                inner.state = WorkUnitState::Hashing;
                WorkAction::Validate
            }
            WorkUnitState::Hashing => WorkAction::InProgress,
            WorkUnitState::Invalid => WorkAction::Invalid,
            WorkUnitState::Hashed => match &inner.transaction {
                Some(transaction) => WorkAction::Hashed(Arc::clone(transaction)),
                None => WorkAction::InProgress,
            },
        }
    }

    /// Finish validation successfully; returns all peers that delivered the payload
    pub fn finish_valid(&self, transaction: Arc<Transaction>) -> Vec<Arc<Peer>> {
        let mut inner = lock::lock(&self.inner);
        if inner.state == WorkUnitState::Hashing {
            inner.transaction = Some(transaction);
            inner.state = WorkUnitState::Hashed;
        }
        inner.peers.clone()
    }

    /// Finish validation with a rejection; returns all peers that delivered the payload
    pub fn finish_invalid(&self) -> Vec<Arc<Peer>> {
        let mut inner = lock::lock(&self.inner);
        if inner.state == WorkUnitState::Hashing {
            inner.state = WorkUnitState::Invalid;
        }
        inner.peers.clone()
    }
}

struct CacheEntry {
    unit: Arc<WorkUnit>,
    inserted: Instant,
}

impl CacheEntry {
    /// Units still being validated never expire
    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.inserted) >= ttl && self.unit.state() != WorkUnitState::Hashing
    }
}

/// Short-lived cache of work units keyed by raw payload bytes
///
/// Least recently used units are evicted first once the capacity is reached.
/// A unit in the `Hashing` state is never evicted, so the cache may briefly
/// hold more units than its capacity while all of them are being validated.
pub struct WorkUnitCache {
    entries: Mutex<LruCache<Bytes, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl WorkUnitCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Return the live unit for `data`, creating it if needed
    ///
    /// The boolean is true when the unit was created by this call. Concurrent
    /// callers with the same bytes always get the same unit.
    pub fn get_or_create(&self, data: &Bytes) -> (Arc<WorkUnit>, bool) {
        let mut entries = lock::lock(&self.entries);
        let now = Instant::now();

        let cached = entries
            .get(data)
            .map(|entry| (Arc::clone(&entry.unit), entry.expired(now, self.ttl)));
        match cached {
            Some((unit, false)) => return (unit, false),
            // replaced in place below
            Some((_, true)) => {}
            None => self.make_room(&mut entries),
        }

        let unit = Arc::new(WorkUnit::new(data.clone()));
        entries.put(
            data.clone(),
            CacheEntry {
                unit: Arc::clone(&unit),
                inserted: now,
            },
        );
        (unit, true)
    }

    fn make_room(&self, entries: &mut LruCache<Bytes, CacheEntry>) {
        let mut in_flight = 0;
        while entries.len() >= self.capacity && in_flight < entries.len() {
            let (key, hashing) = match entries.peek_lru() {
                Some((key, entry)) => (key.clone(), entry.unit.state() == WorkUnitState::Hashing),
                None => break,
            };
            if hashing {
                entries.get(&key);
                in_flight += 1;
            } else {
                entries.pop(&key);
            }
        }
    }

    /// Drop expired units; returns how many were removed
    pub fn evict_expired(&self) -> usize {
        let mut entries = lock::lock(&self.entries);
        let now = Instant::now();
        let expired: Vec<Bytes> = entries
            .iter()
            .filter(|(_, entry)| entry.expired(now, self.ttl))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        lock::lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PeerOrigin, ProtocolFeatures};
    use crate::storage::{TransactionHash, TRANSACTION_HASH_LENGTH};

    fn transaction() -> Arc<Transaction> {
        Arc::new(Transaction::new(
            TransactionHash::new([1u8; TRANSACTION_HASH_LENGTH]),
            Bytes::from_static(b"tx"),
        ))
    }

    #[test]
    fn test_only_first_caller_validates() {
        let unit = WorkUnit::new(Bytes::from_static(b"tx"));
        assert!(matches!(unit.begin(None), WorkAction::Validate));
        assert!(matches!(unit.begin(None), WorkAction::InProgress));
        assert_eq!(unit.state(), WorkUnitState::Hashing);

        unit.finish_valid(transaction());
        assert!(matches!(unit.begin(None), WorkAction::Hashed(_)));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let unit = WorkUnit::new(Bytes::from_static(b"tx"));
        unit.begin(None);
        unit.finish_invalid();
        unit.finish_valid(transaction());
        assert_eq!(unit.state(), WorkUnitState::Invalid);
        assert!(unit.transaction().is_none());
        assert!(matches!(unit.begin(None), WorkAction::Invalid));
    }

    #[test]
    fn test_delivering_peers_are_recorded_once() {
        let peer = |port: u16| {
            let address = format!("127.0.0.1:{}", port).parse().unwrap();
            let (peer, _rx) = Peer::new(
                address,
                address,
                PeerOrigin::Inbound,
                2,
                ProtocolFeatures::STING,
                4,
            );
            Arc::new(peer)
        };
        let first = peer(1);
        let second = peer(2);

        let unit = WorkUnit::new(Bytes::from_static(b"tx"));
        unit.begin(Some(&first));
        unit.begin(Some(&first));
        unit.begin(Some(&second));
        unit.begin(None);

        let ids: Vec<_> = unit.peers().iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert_eq!(unit.finish_invalid().len(), 2);
    }

    #[test]
    fn test_cache_returns_same_unit() {
        let cache = WorkUnitCache::new(Duration::from_secs(5), 10);
        let data = Bytes::from_static(b"payload");
        let (a, created_a) = cache.get_or_create(&data);
        let (b, created_b) = cache.get_or_create(&data.clone());
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_cache_capacity_evicts_least_recently_used() {
        let cache = WorkUnitCache::new(Duration::from_secs(60), 2);
        let (first, _) = cache.get_or_create(&Bytes::from_static(b"1"));
        cache.get_or_create(&Bytes::from_static(b"2"));
        cache.get_or_create(&Bytes::from_static(b"3"));
        assert_eq!(cache.len(), 2);

        let (again, created) = cache.get_or_create(&Bytes::from_static(b"1"));
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_units_being_validated_are_never_evicted() {
        let cache = WorkUnitCache::new(Duration::from_secs(60), 1);
        let x = Bytes::from_static(b"x");
        let (unit, _) = cache.get_or_create(&x);
        assert!(matches!(unit.begin(None), WorkAction::Validate));

        let (_, created) = cache.get_or_create(&Bytes::from_static(b"y"));
        assert!(created);
        assert_eq!(cache.len(), 2);

        let (same, created) = cache.get_or_create(&x);
        assert!(!created);
        assert!(Arc::ptr_eq(&unit, &same));
        assert!(matches!(same.begin(None), WorkAction::InProgress));

        // once validated the unit is an ordinary eviction candidate again
        unit.finish_valid(transaction());
        cache.get_or_create(&Bytes::from_static(b"z"));
        let (_, created) = cache.get_or_create(&x);
        assert!(created);
    }

    #[test]
    fn test_expired_units_are_replaced() {
        let cache = WorkUnitCache::new(Duration::ZERO, 10);
        let data = Bytes::from_static(b"payload");
        let (a, _) = cache.get_or_create(&data);
        let (b, created) = cache.get_or_create(&data);
        assert!(created);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_units_being_validated_do_not_expire() {
        let cache = WorkUnitCache::new(Duration::ZERO, 10);
        let data = Bytes::from_static(b"payload");
        let (unit, _) = cache.get_or_create(&data);
        unit.begin(None);

        assert_eq!(cache.evict_expired(), 0);
        let (same, created) = cache.get_or_create(&data);
        assert!(!created);
        assert!(Arc::ptr_eq(&unit, &same));
    }
}
