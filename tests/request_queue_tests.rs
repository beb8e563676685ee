//! Request queue ordering and bookkeeping

mod common;

use common::*;
use gossip_node::gossip::{Request, RequestQueue, Requester, RequesterConfig, ServerMetrics};
use gossip_node::network::protocol::MESSAGE_TYPE_TRANSACTION_REQUEST;
use gossip_node::network::TransactionRequest;
use gossip_node::storage::TransactionHash;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn hash(n: u32) -> TransactionHash {
    hash_of(&n.to_be_bytes())
}

#[test]
fn test_lower_milestone_is_dispatched_first() {
    let mut queue = RequestQueue::default();
    let a = hash(1);
    let b = hash(2);
    assert!(queue.enqueue(Request::new(a, 10)));
    assert!(queue.enqueue(Request::new(b, 5)));

    assert_eq!(queue.next().map(|r| r.hash), Some(b));
    assert_eq!(queue.next().map(|r| r.hash), Some(a));
    assert_eq!(queue.next(), None);
    assert_eq!(queue.sizes(), (0, 2, 0));
}

#[test]
fn test_unknown_received_hash_changes_nothing() {
    let mut queue = RequestQueue::default();
    queue.enqueue(Request::new(hash(1), 3));
    queue.enqueue(Request::new(hash(2), 4));
    queue.next();

    let before = queue.sizes();
    assert!(queue.received(&hash(99)).is_none());
    assert_eq!(queue.sizes(), before);
}

#[test]
fn test_request_lifecycle() {
    let mut queue = RequestQueue::default();
    let h = hash(7);
    queue.enqueue(Request::new(h, 1));
    assert!(!queue.enqueue(Request::new(h, 1)));

    queue.next();
    assert_eq!(queue.sizes(), (0, 1, 0));
    assert!(queue.received(&h).is_some());
    assert_eq!(queue.sizes(), (0, 0, 1));
    assert!(!queue.enqueue(Request::new(h, 1)));
    assert!(queue.processed(&h).is_some());
    assert!(queue.is_empty());
    assert!(queue.enqueue(Request::new(h, 1)));
}

#[test]
fn test_stale_pending_requests_are_retried() {
    let mut queue = RequestQueue::default();
    queue.enqueue(Request::new(hash(1), 1));
    queue.enqueue(Request::new(hash(2), 2).with_prevent_discard());
    queue.next();
    queue.next();

    assert_eq!(queue.enqueue_pending(Duration::ZERO), 2);
    assert_eq!(queue.sizes(), (2, 0, 0));

    // nothing is moved while requests are still queued
    assert_eq!(queue.enqueue_pending(Duration::ZERO), 0);
}

#[test]
fn test_filter_evicts_unwanted_requests() {
    let mut queue = RequestQueue::default();
    queue.enqueue(Request::new(hash(1), 1));
    queue.enqueue(Request::new(hash(2), 20));
    queue.set_filter(Some(Box::new(|r: &Request| r.milestone_index >= 10)));

    assert_eq!(queue.sizes(), (1, 0, 0));
    assert!(!queue.enqueue(Request::new(hash(3), 2)));
    assert_eq!(queue.next().map(|r| r.milestone_index), Some(20));

    queue.set_filter(None);
    assert!(queue.enqueue(Request::new(hash(3), 2)));
}

#[tokio::test]
async fn test_request_waits_in_queue_until_a_peer_connects() {
    let (manager, _events) = new_manager(4, true);
    let requests = Arc::new(Mutex::new(RequestQueue::default()));
    let metrics = Arc::new(ServerMetrics::new());
    let requester = Requester::new(
        RequesterConfig {
            dispatch_interval: Duration::from_millis(10),
            pending_sweep_interval: Duration::from_secs(60),
            discard_older_than: Duration::ZERO,
        },
        Arc::clone(&manager),
        Arc::clone(&requests),
        Arc::clone(&metrics),
    );

    let h = hash(5);
    assert!(requester.request(Request::new(h, 12)));
    assert!(!requester.dispatch_next().await);
    assert_eq!(requests.lock().unwrap().sizes(), (1, 0, 0));
    assert_eq!(metrics.snapshot().sent_transaction_requests, 0);

    let (_peer, mut rx) = register_peer(&manager, "127.0.0.1", 15600).await;
    assert!(requester.dispatch_next().await);
    assert_eq!(requests.lock().unwrap().sizes(), (0, 1, 0));
    assert_eq!(metrics.snapshot().sent_transaction_requests, 1);

    let message = rx.try_recv().unwrap();
    assert_eq!(message.message_type, MESSAGE_TYPE_TRANSACTION_REQUEST);
    assert_eq!(TransactionRequest::decode(&message.payload).unwrap().hash, h);
    assert!(!requester.dispatch_next().await);
}

proptest! {
    #[test]
    fn prop_pops_are_ordered_by_milestone(indexes in prop::collection::vec(1u32..1000, 1..64)) {
        let mut queue = RequestQueue::default();
        for (n, index) in indexes.iter().enumerate() {
            prop_assert!(queue.enqueue(Request::new(hash(n as u32), *index)));
        }

        let mut last = 0;
        let mut popped = 0;
        while let Some(request) = queue.next() {
            prop_assert!(request.milestone_index >= last);
            last = request.milestone_index;
            popped += 1;
        }
        prop_assert_eq!(popped, indexes.len());
    }

    #[test]
    fn prop_each_hash_lives_in_one_population(ops in prop::collection::vec((0u32..16, 0u8..4), 1..128)) {
        let mut queue = RequestQueue::default();
        let mut tracked = HashSet::new();
        for (n, op) in ops {
            let h = hash(n);
            match op {
                0 => {
                    if queue.enqueue(Request::new(h, n)) {
                        tracked.insert(h);
                    }
                }
                1 => {
                    queue.next();
                }
                2 => {
                    queue.received(&h);
                }
                _ => {
                    if queue.processed(&h).is_some() {
                        tracked.remove(&h);
                    }
                }
            }
            let (queued, pending, processing) = queue.sizes();
            prop_assert_eq!(queued + pending + processing, tracked.len());
            for h in &tracked {
                prop_assert!(queue.contains(h));
            }
        }
    }
}
