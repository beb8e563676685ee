//! Request queue
//!
//! Tracks the transactions this node wants from its peers. A request lives in
//! exactly one of three populations:
//!
//! - queued: waiting to be sent, ordered by milestone index (lowest first)
//! - pending: sent to a peer, waiting for the answer
//! - processing: answer received, being validated
//!
//! The queue is a plain data structure; callers share it behind a mutex.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use super::metrics::RequestQueueSnapshot;
use crate::storage::{MilestoneIndex, TransactionHash};

/// Default number of latency samples in the rolling average
pub const DEFAULT_LATENCY_WINDOW: usize = 100;

/// A request for one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub hash: TransactionHash,
    pub milestone_index: MilestoneIndex,
    /// Set when the request enters the queue
    pub enqueue_time: Instant,
    /// Keep the request even when it is older than the discard age
    pub prevent_discard: bool,
}

impl Request {
    pub fn new(hash: TransactionHash, milestone_index: MilestoneIndex) -> Self {
        Self {
            hash,
            milestone_index,
            enqueue_time: Instant::now(),
            prevent_discard: false,
        }
    }

    pub fn with_prevent_discard(mut self) -> Self {
        self.prevent_discard = true;
        self
    }
}

/// Predicate deciding whether a request is still wanted
pub type RequestFilter = Box<dyn Fn(&Request) -> bool + Send + Sync>;

/// Request queue shared between the processor and the request loops
pub type SharedRequestQueue = Arc<Mutex<RequestQueue>>;

type HeapEntry = Reverse<(MilestoneIndex, u64, TransactionHash)>;

/// Priority queue of outstanding requests
pub struct RequestQueue {
    heap: BinaryHeap<HeapEntry>,
    queued: HashMap<TransactionHash, Request>,
    pending: HashMap<TransactionHash, Request>,
    processing: HashMap<TransactionHash, Request>,
    filter: Option<RequestFilter>,
    latencies: VecDeque<Duration>,
    latency_window: usize,
    sequence: u64,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_WINDOW)
    }
}

impl RequestQueue {
    pub fn new(latency_window: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            queued: HashMap::new(),
            pending: HashMap::new(),
            processing: HashMap::new(),
            filter: None,
            latencies: VecDeque::with_capacity(latency_window),
            latency_window: latency_window.max(1),
            sequence: 0,
        }
    }

    pub fn shared(latency_window: usize) -> SharedRequestQueue {
        Arc::new(Mutex::new(Self::new(latency_window)))
    }

    /// Whether the hash is queued, pending or processing
    pub fn contains(&self, hash: &TransactionHash) -> bool {
        self.queued.contains_key(hash)
            || self.pending.contains_key(hash)
            || self.processing.contains_key(hash)
    }

    fn accepted(&self, request: &Request) -> bool {
        self.filter.as_ref().map_or(true, |f| f(request))
    }

    fn push(&mut self, request: Request) {
        self.sequence += 1;
        self.heap
            .push(Reverse((request.milestone_index, self.sequence, request.hash)));
        self.queued.insert(request.hash, request);
    }

    /// Add a request
    ///
    /// Returns false if the hash is already tracked or the filter rejects it.
    pub fn enqueue(&mut self, mut request: Request) -> bool {
        if self.contains(&request.hash) || !self.accepted(&request) {
            return false;
        }
        request.enqueue_time = Instant::now();
        self.push(request);
        true
    }

    /// Pop the queued request with the lowest milestone index and mark it pending
    pub fn next(&mut self) -> Option<Request> {
        let Reverse((_, _, hash)) = self.heap.pop()?;
        let request = self.queued.remove(&hash)?;
        self.pending.insert(hash, request.clone());
        Some(request)
    }

    /// The request [`Self::next`] would return
    pub fn peek(&self) -> Option<&Request> {
        let Reverse((_, _, hash)) = self.heap.peek()?;
        self.queued.get(hash)
    }

    /// Record that the requested data arrived
    ///
    /// A pending request moves to processing and its latency is recorded. A
    /// request that is still queued is returned unchanged.
    pub fn received(&mut self, hash: &TransactionHash) -> Option<Request> {
        if let Some(request) = self.pending.remove(hash) {
            self.record_latency(request.enqueue_time.elapsed());
            self.processing.insert(*hash, request.clone());
            return Some(request);
        }
        self.queued.get(hash).cloned()
    }

    /// Drop a request once its data was handled
    pub fn processed(&mut self, hash: &TransactionHash) -> Option<Request> {
        self.processing.remove(hash)
    }

    /// Move all pending requests back into the queue
    ///
    /// Does nothing while requests are queued. Requests the filter no longer
    /// accepts are dropped, as are requests older than `max_age` unless they
    /// prevent discarding. A zero `max_age` never discards.
    pub fn enqueue_pending(&mut self, max_age: Duration) -> usize {
        self.enqueue_pending_at(Instant::now(), max_age)
    }

    fn enqueue_pending_at(&mut self, now: Instant, max_age: Duration) -> usize {
        if !self.queued.is_empty() {
            return 0;
        }

        let pending: Vec<Request> = self.pending.drain().map(|(_, r)| r).collect();
        let mut requeued = 0;
        for request in pending {
            if !self.accepted(&request) {
                continue;
            }
            let age = now.saturating_duration_since(request.enqueue_time);
            if !max_age.is_zero() && age > max_age && !request.prevent_discard {
                debug!(
                    "Discarding request {} for milestone {} after {:?}",
                    request.hash, request.milestone_index, age
                );
                continue;
            }
            self.push(request);
            requeued += 1;
        }
        requeued
    }

    /// Install or clear the filter
    ///
    /// Queued and pending requests the new filter rejects are evicted.
    pub fn set_filter(&mut self, filter: Option<RequestFilter>) {
        self.filter = filter;
        let Some(filter) = self.filter.as_ref() else {
            return;
        };

        self.queued.retain(|_, request| filter(request));
        self.pending.retain(|_, request| filter(request));
        let queued = &self.queued;
        self.heap.retain(|Reverse((_, _, hash))| queued.contains_key(hash));
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.latency_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    /// Rolling average of the recorded request latencies
    pub fn avg_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.latencies.iter().sum();
        total / self.latencies.len() as u32
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.processing.len()
    }

    /// `(queued, pending, processing)`
    pub fn sizes(&self) -> (usize, usize, usize) {
        (self.queued_len(), self.pending_len(), self.processing_len())
    }

    pub fn is_empty(&self) -> bool {
        self.sizes() == (0, 0, 0)
    }

    pub fn snapshot(&self) -> RequestQueueSnapshot {
        RequestQueueSnapshot {
            queued: self.queued_len(),
            pending: self.pending_len(),
            processing: self.processing_len(),
            avg_latency_ms: self.avg_latency().as_millis() as u64,
        }
    }
}
