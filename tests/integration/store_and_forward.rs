use std::time::Duration;

use libsummit::MeshEvent;

use crate::{link, secure_pair, spawn_node, test_config, wait_for};

/// When the transport can't reach a secured peer, `send_direct` must queue
/// the ciphertext in the store-and-forward cache instead of dropping it,
/// and flush it automatically once the peer is reachable again.
#[tokio::test]
async fn queued_message_is_delivered_once_the_peer_comes_back() {
    let mut a = spawn_node(test_config()).await.unwrap();
    let mut b = spawn_node(test_config()).await.unwrap();
    link(&a, &b).unwrap();
    secure_pair(&mut a, &mut b).await.unwrap();

    // Simulate `a` moving out of range: `b` can no longer reach it, but
    // the Noise session the two already negotiated is untouched.
    b.loopback.unregister_peer(a.id);

    b.engine.send_direct(a.id, b"delivered later".to_vec()).await.unwrap();

    // Nothing can arrive while the route is down.
    let nothing = wait_for(&mut a.events, Duration::from_millis(300), |e| matches!(e, MeshEvent::MessageReceived { .. })).await;
    assert!(nothing.is_none(), "message must not arrive while b has no route to a");

    // `a` comes back into range and re-handshakes; `b`, as the responder,
    // flushes its cached queue for `a` once that handshake completes.
    let a_addr = a.loopback.local_addr().unwrap();
    b.loopback.register_peer(a.id, a_addr);
    a.engine.initiate_handshake(b.id).await.unwrap();

    wait_for(&mut a.events, Duration::from_secs(2), |e| matches!(e, MeshEvent::PeerSecured { peer } if *peer == b.id))
        .await
        .expect("a should re-secure with b");

    let delivered = wait_for(&mut a.events, Duration::from_secs(2), |e| matches!(e, MeshEvent::MessageReceived { .. })).await;
    match delivered {
        Some(MeshEvent::MessageReceived { sender, content }) => {
            assert_eq!(sender, b.id);
            assert_eq!(content, b"delivered later");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
