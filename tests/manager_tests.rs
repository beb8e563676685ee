//! Connection manager: handshake verification, peer bookkeeping and live connections

mod common;

use common::*;
use futures::{SinkExt, StreamExt};
use gossip_node::network::protocol::MESSAGE_TYPE_HEARTBEAT;
use gossip_node::network::{
    gossip_registry, AutopeerInfo, ConnectionInfo, Handshake, HandshakeError, Heartbeat,
    ManagerError, MessageCodec, NetworkEvent, PeerManager, PeerOrigin, ProtocolFeatures,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

fn inbound(ip: &str, port: u16) -> ConnectionInfo {
    ConnectionInfo::inbound(format!("{}:{}", ip, port).parse().unwrap())
}

#[tokio::test]
async fn test_slots_filled_rejects_static_peer() {
    let (manager, _events) = new_manager(1, true);
    register_peer(&manager, "127.0.0.1", 15600).await;
    assert!(manager.slots_filled().await);

    let result = manager
        .verify_handshake(&inbound("127.0.0.2", 40000), &remote_handshake(15600))
        .await;
    assert_eq!(result.err(), Some(HandshakeError::SlotsFilled));
    assert_eq!(manager.connected_peer_count().await, 1);
}

#[tokio::test]
async fn test_mismatching_parameters_are_rejected() {
    let (manager, _events) = new_manager(4, true);

    let wrong_mwm = Handshake::new(15600, TEST_FINGERPRINT, TEST_MWM + 1, ProtocolFeatures::STING);
    let result = manager
        .verify_handshake(&inbound("127.0.0.1", 40000), &wrong_mwm)
        .await;
    assert_eq!(
        result.err(),
        Some(HandshakeError::NonMatchingMwm {
            ours: TEST_MWM,
            theirs: TEST_MWM + 1
        })
    );

    let wrong_fingerprint = Handshake::new(15600, [8u8; 49], TEST_MWM, ProtocolFeatures::STING);
    let result = manager
        .verify_handshake(&inbound("127.0.0.1", 40000), &wrong_fingerprint)
        .await;
    assert_eq!(result.err(), Some(HandshakeError::NonMatchingFingerprint));

    assert_eq!(manager.connected_peer_count().await, 0);
    assert!(!manager.is_blacklisted("127.0.0.1".parse().unwrap()).await);
}

#[tokio::test]
async fn test_unknown_peer_is_blacklisted() {
    let (manager, _events) = new_manager(4, false);
    let ip: IpAddr = "127.0.0.9".parse().unwrap();
    let id = SocketAddr::new(ip, 15600);

    let result = manager
        .verify_handshake(&inbound("127.0.0.9", 40000), &remote_handshake(15600))
        .await;
    assert_eq!(result.err(), Some(HandshakeError::UnknownPeer(id)));
    assert!(manager.is_blacklisted(ip).await);

    let result = manager
        .verify_handshake(&inbound("127.0.0.9", 40001), &remote_handshake(15600))
        .await;
    assert_eq!(result.err(), Some(HandshakeError::Blacklisted(ip)));
}

#[tokio::test]
async fn test_duplicate_connection_is_rejected() {
    let (manager, _events) = new_manager(4, true);
    let (peer, _rx) = register_peer(&manager, "127.0.0.1", 15600).await;
    assert_eq!(peer.id(), "127.0.0.1:15600".parse().unwrap());

    let result = manager
        .verify_handshake(&inbound("127.0.0.1", 41000), &remote_handshake(15600))
        .await;
    assert_eq!(result.err(), Some(HandshakeError::AlreadyConnected(peer.id())));
}

#[tokio::test]
async fn test_add_remove_and_re_add() {
    let (manager, _events) = new_manager(4, false);
    let address = "127.0.0.3:15600";

    manager.add(address, false, Some("three".into()), None).await.unwrap();
    assert!(manager.in_reconnect_pool(address).await);
    assert!(manager.is_whitelisted(&address.parse().unwrap()).await);
    assert_eq!(manager.peer_count().await, 1);

    let duplicate = manager.add(address, false, None, None).await;
    assert!(matches!(duplicate, Err(ManagerError::AlreadyInReconnect(a)) if a == address));

    assert!(manager.remove(address).await);
    assert!(!manager.in_reconnect_pool(address).await);
    assert!(manager.is_blacklisted("127.0.0.3".parse().unwrap()).await);
    assert!(!manager.remove(address).await);

    manager.add(address, false, None, None).await.unwrap();
    assert!(manager.in_reconnect_pool(address).await);
    assert!(!manager.is_blacklisted("127.0.0.3".parse().unwrap()).await);
}

#[tokio::test]
async fn test_invalid_peer_address() {
    let (manager, _events) = new_manager(4, false);
    for address in ["no-port", ":15600", "host:port"] {
        let result = manager.add(address, false, None, None).await;
        assert!(
            matches!(result, Err(ManagerError::InvalidPeerAddress { .. })),
            "{} should be rejected",
            address
        );
    }
}

#[tokio::test]
async fn test_autopeered_peer_is_promoted_to_static() {
    let (manager, _events) = new_manager(1, false);
    let address = "127.0.0.5:15600";
    let autopeer = AutopeerInfo {
        identity: "peer-identity".into(),
        address: address.into(),
    };
    manager.add("127.0.0.1:15600", false, None, None).await.unwrap();
    manager
        .verify_handshake(&inbound("127.0.0.1", 40000), &remote_handshake(15600))
        .await
        .unwrap();
    assert!(manager.slots_filled().await);

    // autopeered peers do not take static slots
    manager
        .add(address, false, None, Some(autopeer.clone()))
        .await
        .unwrap();
    let (peer, _rx) = manager
        .verify_handshake(&inbound("127.0.0.5", 40000), &remote_handshake(15600))
        .await
        .unwrap();
    assert_eq!(peer.autopeer(), Some(autopeer));

    manager.add(address, false, None, None).await.unwrap();
    assert!(!peer.is_autopeered());
    assert!(manager.peer(&peer.id()).await.is_some());
}

#[tokio::test]
async fn test_remove_connected_peer() {
    let (manager, _events) = new_manager(4, true);
    let (peer, _rx) = register_peer(&manager, "127.0.0.1", 15600).await;

    assert!(manager.remove(&peer.id().to_string()).await);
    assert!(peer.is_removed());
    assert!(peer.is_disconnected());
    assert_eq!(manager.connected_peer_count().await, 0);
    assert!(!manager.remove("10.0.0.1:1").await);
}

#[tokio::test]
async fn test_synced_peer_count() {
    let (manager, _events) = new_manager(4, true);
    let (synced, _a) = register_peer(&manager, "127.0.0.1", 15600).await;
    let (behind, _b) = register_peer(&manager, "127.0.0.2", 15600).await;

    synced.set_latest_heartbeat(Heartbeat {
        solid_milestone_index: 10,
        latest_milestone_index: 10,
        ..Default::default()
    });
    behind.set_latest_heartbeat(Heartbeat {
        solid_milestone_index: 5,
        latest_milestone_index: 10,
        ..Default::default()
    });

    assert_eq!(manager.connected_and_synced_peer_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_connection_and_reconnect_record() {
    let (a, mut a_events) = new_manager(4, false);
    let (b, mut b_events) = new_manager(4, true);
    a.listen("127.0.0.1:0").await.unwrap();
    let b_address = b.listen("127.0.0.1:0").await.unwrap();
    let origin = b_address.to_string();

    a.add(&origin, false, None, None).await.unwrap();
    a.reconnect().await;

    let a_peer = match next_event(&mut a_events).await {
        NetworkEvent::PeerConnected(peer) => peer,
        other => panic!("unexpected event {:?}", other),
    };
    let b_peer = match next_event(&mut b_events).await {
        NetworkEvent::PeerConnected(peer) => peer,
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(a_peer.id(), b_address);
    assert_eq!(a_peer.origin(), PeerOrigin::Outbound);
    assert_eq!(b_peer.origin(), PeerOrigin::Inbound);
    assert_eq!(b_peer.id().port(), a.local_port());
    assert_eq!(a_peer.protocol_version(), ProtocolFeatures::STING_VERSION);

    let heartbeat = Heartbeat {
        solid_milestone_index: 3,
        latest_milestone_index: 3,
        ..Default::default()
    };
    assert!(a_peer.enqueue(heartbeat.encode()));
    match next_event(&mut b_events).await {
        NetworkEvent::MessageReceived(from, message) => {
            assert_eq!(from.id(), b_peer.id());
            assert_eq!(message.message_type, MESSAGE_TYPE_HEARTBEAT);
            assert_eq!(Heartbeat::decode(&message.payload).unwrap(), heartbeat);
        }
        other => panic!("unexpected event {:?}", other),
    }

    b.shutdown().await;
    match next_event(&mut a_events).await {
        NetworkEvent::PeerDisconnected(peer) => assert_eq!(peer.id(), b_address),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(a.in_reconnect_pool(&origin).await);
    assert_eq!(a.connected_peer_count().await, 0);

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_dial_returns_record_to_pool() {
    let (manager, mut events) = new_manager(4, false);
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = closed.local_addr().unwrap().to_string();
    drop(closed);

    manager.add(&origin, false, None, None).await.unwrap();
    manager.reconnect().await;

    let manager_ref = &manager;
    let origin_ref = &origin;
    assert!(wait_until(|| async move { manager_ref.in_reconnect_pool(origin_ref).await }).await);
    assert_eq!(manager.connected_peer_count().await, 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_reconnect_skips_connected_endpoint() {
    let resolver = Arc::new(ToggleResolver::offline());
    let (manager, mut events) = PeerManager::new(manager_config(4, true), resolver.clone());
    let origin = "node.test:15600";

    // not resolvable yet, so the inbound connection cannot be matched to the record
    manager.add(origin, false, Some("node".into()), None).await.unwrap();
    let (peer, _rx) = register_peer(&manager, "127.0.0.1", 15600).await;
    assert!(manager.in_reconnect_pool(origin).await);
    assert!(peer.origin_address().is_none());

    resolver.set_online();
    manager.reconnect().await;

    assert!(!manager.in_reconnect_pool(origin).await);
    assert_eq!(
        peer.origin_address().map(|o| o.addr),
        Some(origin.to_string())
    );
    assert!(manager.is_whitelisted(&peer.id()).await);
    assert_eq!(manager.connected_peer_count().await, 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_autopeered_peer_is_not_pooled_after_disconnect() {
    let (a, mut a_events) = new_manager(4, false);
    let (b, _b_events) = new_manager(4, true);
    a.listen("127.0.0.1:0").await.unwrap();
    let b_address = b.listen("127.0.0.1:0").await.unwrap();
    let origin = b_address.to_string();
    let autopeer = AutopeerInfo {
        identity: "remote-identity".into(),
        address: origin.clone(),
    };

    a.add(&origin, false, None, Some(autopeer.clone()))
        .await
        .unwrap();
    a.reconnect().await;
    let peer = match next_event(&mut a_events).await {
        NetworkEvent::PeerConnected(peer) => peer,
        other => panic!("unexpected event {:?}", other),
    };
    assert!(peer.is_autopeered());
    assert_eq!(peer.autopeer(), Some(autopeer));

    b.shutdown().await;
    match next_event(&mut a_events).await {
        NetworkEvent::PeerDisconnected(gone) => assert_eq!(gone.id(), b_address),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!a.in_reconnect_pool(&origin).await);
    assert_eq!(a.peer_count().await, 0);

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_removed_while_dialing_is_rejected() {
    let (manager, mut events) = new_manager(4, true);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    let origin = remote.to_string();

    manager.add(&origin, false, None, None).await.unwrap();
    manager.reconnect().await;
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("dial should arrive")
        .unwrap();
    let mut framed: Framed<TcpStream, MessageCodec> =
        Framed::new(stream, MessageCodec::new(Arc::new(gossip_registry())));

    assert!(framed.next().await.is_some());
    assert!(manager.remove(&origin).await);
    framed
        .send(remote_handshake(remote.port()).to_message())
        .await
        .unwrap();

    // the manager hangs up once the handshake is rejected
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = framed.next().await {}
    })
    .await;
    assert!(closed.is_ok());

    assert_eq!(manager.connected_peer_count().await, 0);
    assert!(!manager.in_reconnect_pool(&origin).await);
    assert!(manager.is_blacklisted(remote.ip()).await);
    assert!(events.try_recv().is_err());

    manager.shutdown().await;
}
