use std::time::Duration;

use libsummit::MeshEvent;

use crate::{link, secure_pair, spawn_node, test_config, wait_for};

/// A direct message bigger than a single fragment's payload budget must
/// be split into multiple `Fragment` frames and reassembled transparently
/// on the other side before the application ever sees it.
#[tokio::test]
async fn large_direct_message_is_fragmented_and_reassembled() {
    let mut config = test_config();
    config.mesh.fragment_size = 80; // force several fragments for a small payload
    let mut a = spawn_node(config.clone()).await.unwrap();
    let mut b = spawn_node(config).await.unwrap();
    link(&a, &b).unwrap();
    secure_pair(&mut a, &mut b).await.unwrap();

    let payload: Vec<u8> = (0..500u16).map(|i| (i % 256) as u8).collect();
    a.engine.send_direct(b.id, payload.clone()).await.unwrap();

    let received = wait_for(&mut b.events, Duration::from_secs(2), |e| {
        matches!(e, MeshEvent::MessageReceived { sender, .. } if *sender == a.id)
    })
    .await;

    match received {
        Some(MeshEvent::MessageReceived { content, .. }) => assert_eq!(content, payload),
        other => panic!("unexpected event: {other:?}"),
    }
}

/// A message that fits in one fragment's budget is sent unfragmented;
/// the reassembly path isn't exercised at all for the common case.
#[tokio::test]
async fn small_direct_message_is_not_fragmented() {
    let mut config = test_config();
    config.mesh.fragment_size = 180;
    let mut a = spawn_node(config.clone()).await.unwrap();
    let mut b = spawn_node(config).await.unwrap();
    link(&a, &b).unwrap();
    secure_pair(&mut a, &mut b).await.unwrap();

    a.engine.send_direct(b.id, b"short".to_vec()).await.unwrap();

    let received = wait_for(&mut b.events, Duration::from_secs(2), |e| {
        matches!(e, MeshEvent::MessageReceived { sender, .. } if *sender == a.id)
    })
    .await;
    assert!(matches!(received, Some(MeshEvent::MessageReceived { .. })));
}
