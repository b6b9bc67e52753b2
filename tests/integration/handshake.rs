use std::time::Duration;

use libsummit::MeshEvent;

use crate::{link, secure_pair, spawn_node, test_config, wait_for};

#[tokio::test]
async fn noise_handshake_secures_a_session() {
    let mut a = spawn_node(test_config()).await.unwrap();
    let mut b = spawn_node(test_config()).await.unwrap();
    link(&a, &b).unwrap();

    secure_pair(&mut a, &mut b).await.unwrap();
}

#[tokio::test]
async fn secured_session_carries_an_encrypted_direct_message() {
    let mut a = spawn_node(test_config()).await.unwrap();
    let mut b = spawn_node(test_config()).await.unwrap();
    link(&a, &b).unwrap();
    secure_pair(&mut a, &mut b).await.unwrap();

    a.engine.send_direct(b.id, b"hello mesh".to_vec()).await.unwrap();

    let received = wait_for(&mut b.events, Duration::from_secs(2), |e| {
        matches!(e, MeshEvent::MessageReceived { sender, .. } if *sender == a.id)
    })
    .await;

    match received {
        Some(MeshEvent::MessageReceived { content, .. }) => assert_eq!(content, b"hello mesh"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn direct_message_without_a_session_is_rejected() {
    let mut a = spawn_node(test_config()).await.unwrap();
    let b = spawn_node(test_config()).await.unwrap();
    link(&a, &b).unwrap();

    // No handshake has happened, so send_direct has nothing to encrypt
    // with and must surface that rather than silently discarding.
    let err = a.engine.send_direct(b.id, b"too soon".to_vec()).await.unwrap_err();
    assert!(matches!(err, libsummit::EngineError::NoSecuredSession));
}
