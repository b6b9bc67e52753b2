use std::time::Duration;

use libsummit::MeshEvent;

use crate::{link, spawn_node, test_config, wait_for};

/// An unpasswordded channel still tags and floods content, but carries no
/// encryption — any node that joined with no password reads it directly.
#[tokio::test]
async fn unpassworded_channel_message_reaches_joined_peer() {
    let mut a = spawn_node(test_config()).await.unwrap();
    let mut b = spawn_node(test_config()).await.unwrap();
    link(&a, &b).unwrap();

    let channel = [7u8; 8];
    a.engine.join_channel(channel, None).await.unwrap();
    b.engine.join_channel(channel, None).await.unwrap();

    a.engine.send_to_channel(channel, b"general chatter".to_vec()).await.unwrap();

    let at_b = wait_for(&mut b.events, Duration::from_secs(2), |e| matches!(e, MeshEvent::ChannelMessageReceived { .. })).await;
    match at_b {
        Some(MeshEvent::ChannelMessageReceived { channel: c, sender, content }) => {
            assert_eq!(c, channel);
            assert_eq!(sender, a.id);
            assert_eq!(content, b"general chatter");
        }
        other => panic!("unexpected event at b: {other:?}"),
    }
}

/// A node that joined a channel with the wrong password can't read its
/// messages: the derived key differs, so the AEAD tag never verifies and
/// no `ChannelMessageReceived` is ever emitted.
#[tokio::test]
async fn wrong_password_cannot_decrypt_channel_message() {
    let mut a = spawn_node(test_config()).await.unwrap();
    let mut b = spawn_node(test_config()).await.unwrap();
    link(&a, &b).unwrap();

    let channel = [9u8; 8];
    a.engine.join_channel(channel, Some(b"correct horse".to_vec())).await.unwrap();
    b.engine.join_channel(channel, Some(b"wrong guess".to_vec())).await.unwrap();

    a.engine.send_to_channel(channel, b"secret plans".to_vec()).await.unwrap();

    let at_b = wait_for(&mut b.events, Duration::from_millis(500), |e| matches!(e, MeshEvent::ChannelMessageReceived { .. })).await;
    assert!(at_b.is_none(), "a mismatched channel password must not decrypt the flooded message");
}

/// With the right shared password on both ends, the channel message
/// round-trips through the AEAD layer intact.
#[tokio::test]
async fn matching_password_decrypts_channel_message() {
    let mut a = spawn_node(test_config()).await.unwrap();
    let mut b = spawn_node(test_config()).await.unwrap();
    link(&a, &b).unwrap();

    let channel = [11u8; 8];
    a.engine.join_channel(channel, Some(b"shared secret".to_vec())).await.unwrap();
    b.engine.join_channel(channel, Some(b"shared secret".to_vec())).await.unwrap();

    a.engine.send_to_channel(channel, b"only members can read this".to_vec()).await.unwrap();

    let at_b = wait_for(&mut b.events, Duration::from_secs(2), |e| matches!(e, MeshEvent::ChannelMessageReceived { .. })).await;
    match at_b {
        Some(MeshEvent::ChannelMessageReceived { content, .. }) => assert_eq!(content, b"only members can read this"),
        other => panic!("unexpected event at b: {other:?}"),
    }
}

/// Sending to a channel that was never joined has no key to reach for and
/// must fail rather than silently flooding in the clear.
#[tokio::test]
async fn send_to_unjoined_channel_fails() {
    let a = spawn_node(test_config()).await.unwrap();
    let result = a.engine.send_to_channel([3u8; 8], b"hello".to_vec()).await;
    assert!(result.is_err());
}
