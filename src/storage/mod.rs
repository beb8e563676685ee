//! Ledger collaborator interfaces
//!
//! The gossip engine does not own ledger storage or validation. It talks to them
//! through the traits in this module: a transaction store for "already known"
//! checks and answering requests, a validator turning raw bytes into a
//! [`Transaction`], and a sync status source for heartbeats.
//!
//! Stored values are immutable once created; stores only support insert and delete.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Milestone sequence number
pub type MilestoneIndex = u32;

/// Size of a transaction hash in bytes
pub const TRANSACTION_HASH_LENGTH: usize = 49;

/// Content identifier of a transaction
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionHash([u8; TRANSACTION_HASH_LENGTH]);

impl TransactionHash {
    pub const fn new(bytes: [u8; TRANSACTION_HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Build from a slice of exactly [`TRANSACTION_HASH_LENGTH`] bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; TRANSACTION_HASH_LENGTH] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; TRANSACTION_HASH_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for TransactionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionHash({})", self)
    }
}

impl fmt::Display for TransactionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell hashes apart in logs
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// A validated transaction
///
/// Fields are private and there are no setters: a transaction never changes
/// after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    hash: TransactionHash,
    data: Bytes,
    milestone_index: Option<MilestoneIndex>,
}

impl Transaction {
    pub fn new(hash: TransactionHash, data: Bytes) -> Self {
        Self {
            hash,
            data,
            milestone_index: None,
        }
    }

    /// Transaction that is part of the milestone with the given index
    pub fn milestone(hash: TransactionHash, data: Bytes, index: MilestoneIndex) -> Self {
        Self {
            hash,
            data,
            milestone_index: Some(index),
        }
    }

    pub fn hash(&self) -> &TransactionHash {
        &self.hash
    }

    /// Raw bytes as received on the wire
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn milestone_index(&self) -> Option<MilestoneIndex> {
        self.milestone_index
    }
}

/// Reason a payload was rejected by the validator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("insufficient proof of work")]
    InsufficientWork,

    #[error("invalid transaction: {0}")]
    Invalid(String),
}

/// Lookup side of the ledger store
pub trait TransactionStore: Send + Sync {
    /// Whether the transaction is already stored
    fn contains(&self, hash: &TransactionHash) -> bool;

    fn get(&self, hash: &TransactionHash) -> Option<Arc<Transaction>>;

    /// Transactions of the milestone with the given index
    fn milestone_transactions(&self, index: MilestoneIndex) -> Vec<Arc<Transaction>>;
}

/// Turns raw payload bytes into a validated transaction
pub trait TransactionValidator: Send + Sync {
    fn parse_and_validate(&self, data: &Bytes) -> Result<Transaction, ValidationError>;
}

/// Source of the node's own milestone progress
pub trait SyncStatus: Send + Sync {
    fn solid_milestone_index(&self) -> MilestoneIndex;

    fn pruned_milestone_index(&self) -> MilestoneIndex;

    fn latest_milestone_index(&self) -> MilestoneIndex;

    fn is_synced(&self) -> bool {
        self.solid_milestone_index() >= self.latest_milestone_index()
    }
}

#[derive(Default)]
struct MemoryStoreInner {
    transactions: HashMap<TransactionHash, Arc<Transaction>>,
    milestones: BTreeMap<MilestoneIndex, Vec<TransactionHash>>,
}

/// In-memory transaction store
///
/// Supports insert and delete only. Re-inserting an existing hash is a no-op.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a transaction; returns false if the hash was already present
    pub fn insert(&self, transaction: Transaction) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.transactions.contains_key(transaction.hash()) {
            return false;
        }

        let hash = *transaction.hash();
        if let Some(index) = transaction.milestone_index() {
            inner.milestones.entry(index).or_default().push(hash);
        }
        inner.transactions.insert(hash, Arc::new(transaction));
        true
    }

    pub fn delete(&self, hash: &TransactionHash) -> Option<Arc<Transaction>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.transactions.remove(hash)?;
        if let Some(index) = removed.milestone_index() {
            if let Some(hashes) = inner.milestones.get_mut(&index) {
                hashes.retain(|h| h != hash);
                if hashes.is_empty() {
                    inner.milestones.remove(&index);
                }
            }
        }
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .transactions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest milestone index with stored transactions
    pub fn latest_milestone(&self) -> Option<MilestoneIndex> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .milestones
            .keys()
            .next_back()
            .copied()
    }
}

impl TransactionStore for MemoryStore {
    fn contains(&self, hash: &TransactionHash) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .transactions
            .contains_key(hash)
    }

    fn get(&self, hash: &TransactionHash) -> Option<Arc<Transaction>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .transactions
            .get(hash)
            .cloned()
    }

    fn milestone_transactions(&self, index: MilestoneIndex) -> Vec<Arc<Transaction>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .milestones
            .get(&index)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|h| inner.transactions.get(h).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Sync status backed by atomics, updated by the ledger
#[derive(Debug, Default)]
pub struct AtomicSyncStatus {
    solid: AtomicU32,
    pruned: AtomicU32,
    latest: AtomicU32,
}

impl AtomicSyncStatus {
    pub fn new(solid: MilestoneIndex, pruned: MilestoneIndex, latest: MilestoneIndex) -> Self {
        Self {
            solid: AtomicU32::new(solid),
            pruned: AtomicU32::new(pruned),
            latest: AtomicU32::new(latest),
        }
    }

    pub fn set_solid(&self, index: MilestoneIndex) {
        self.solid.store(index, Ordering::Relaxed);
    }

    pub fn set_pruned(&self, index: MilestoneIndex) {
        self.pruned.store(index, Ordering::Relaxed);
    }

    /// Raise the latest index; lower values are ignored
    pub fn update_latest(&self, index: MilestoneIndex) {
        self.latest.fetch_max(index, Ordering::Relaxed);
    }
}

impl SyncStatus for AtomicSyncStatus {
    fn solid_milestone_index(&self) -> MilestoneIndex {
        self.solid.load(Ordering::Relaxed)
    }

    fn pruned_milestone_index(&self) -> MilestoneIndex {
        self.pruned.load(Ordering::Relaxed)
    }

    fn latest_milestone_index(&self) -> MilestoneIndex {
        self.latest.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> TransactionHash {
        TransactionHash::new([b; TRANSACTION_HASH_LENGTH])
    }

    #[test]
    fn test_insert_is_not_an_update() {
        let store = MemoryStore::new();
        assert!(store.insert(Transaction::new(hash(1), Bytes::from_static(b"a"))));
        assert!(!store.insert(Transaction::new(hash(1), Bytes::from_static(b"b"))));
        assert_eq!(&store.get(&hash(1)).unwrap().data()[..], b"a");
    }

    #[test]
    fn test_milestone_index_tracking() {
        let store = MemoryStore::new();
        store.insert(Transaction::milestone(hash(1), Bytes::from_static(b"m1"), 5));
        store.insert(Transaction::milestone(hash(2), Bytes::from_static(b"m2"), 7));
        store.insert(Transaction::new(hash(3), Bytes::from_static(b"t")));

        assert_eq!(store.latest_milestone(), Some(7));
        assert_eq!(store.milestone_transactions(5).len(), 1);

        store.delete(&hash(2));
        assert_eq!(store.latest_milestone(), Some(5));
        assert!(store.milestone_transactions(7).is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_hash_from_slice_length() {
        assert!(TransactionHash::from_slice(&[0u8; 48]).is_none());
        assert!(TransactionHash::from_slice(&[0u8; 49]).is_some());
    }

    #[test]
    fn test_sync_status_latest_only_rises() {
        let status = AtomicSyncStatus::new(10, 0, 12);
        assert!(!status.is_synced());
        status.update_latest(5);
        assert_eq!(status.latest_milestone_index(), 12);
        status.set_solid(12);
        assert!(status.is_synced());
    }
}
