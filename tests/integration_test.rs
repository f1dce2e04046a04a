//! End-to-end scenarios against a live broker (spec.md §8).
//!
//! Every test is `#[ignore]`d by default, the same gate
//! `other_examples/.../angzarr/src/bus/amqp/mod.rs` uses for its own
//! broker-dependent tests (`#[ignore = "Requires RabbitMQ"]`), and reads the
//! broker URL from `CHANNEL_CORE_TEST_AMQP_URL` with no compiled-in
//! fallback. Run with `cargo test -- --ignored` against a real broker.

use channel_core::message::{integer, text};
use channel_core::{ChannelLayer, ChannelLayerError, Config, Message};
use std::time::Duration;

fn test_amqp_url() -> String {
    std::env::var("CHANNEL_CORE_TEST_AMQP_URL")
        .expect("CHANNEL_CORE_TEST_AMQP_URL must be set to run ignored integration tests")
}

async fn layer(capacity: u64, expiry_ms: u64, group_expiry_ms: u64) -> ChannelLayer {
    let config = Config::new(test_amqp_url(), expiry_ms, group_expiry_ms, capacity);
    ChannelLayer::connect(config)
        .await
        .expect("failed to connect to test broker")
}

fn unique_name(prefix: &str) -> String {
    use rand::Rng;
    let suffix: String = (0..8)
        .map(|_| (b'a' + rand::rng().random_range(0..26)) as char)
        .collect();
    format!("{}-{}", prefix, suffix)
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn send_receive_round_trip() {
    let layer = layer(10, 60_000, 86_400_000).await;
    let channel = unique_name("c1");

    let mut message = Message::new();
    message.insert("text".to_string(), text("hi"));
    layer.send(&channel, message).await.expect("send");

    let (winner, received) = layer
        .receive(&[channel.clone()], false, None)
        .await
        .expect("receive");
    assert_eq!(winner, Some(channel));
    let received = received.expect("message");
    assert_eq!(received.get("text"), Some(&text("hi")));

    layer.stop().await;
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn empty_poll_returns_none() {
    let layer = layer(10, 60_000, 86_400_000).await;
    let channel = unique_name("c2");
    layer.declare_channel(&channel).await.expect("declare");

    let (winner, received) = layer
        .receive(&[channel], false, None)
        .await
        .expect("receive");
    assert_eq!(winner, None);
    assert!(received.is_none());

    layer.stop().await;
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn capacity_rejects_the_overflowing_send() {
    let layer = layer(2, 60_000, 86_400_000).await;
    let channel = unique_name("c3");

    let mut m1 = Message::new();
    m1.insert("n".to_string(), integer(1));
    layer.send(&channel, m1).await.expect("send 1");

    let mut m2 = Message::new();
    m2.insert("n".to_string(), integer(2));
    layer.send(&channel, m2).await.expect("send 2");

    let mut m3 = Message::new();
    m3.insert("n".to_string(), integer(3));
    let err = layer.send(&channel, m3).await.unwrap_err();
    assert!(matches!(err, ChannelLayerError::ChannelFull { .. }));

    layer.stop().await;
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn group_fan_out_delivers_to_every_member() {
    let layer = layer(10, 60_000, 86_400_000).await;
    let group = unique_name("g1");
    let a = unique_name("a");
    let b = unique_name("b");

    layer.group_add(&group, &a).await.expect("group_add a");
    layer.group_add(&group, &b).await.expect("group_add b");

    let mut message = Message::new();
    message.insert("x".to_string(), integer(1));
    layer.send_group(&group, message).await.expect("send_group");

    let (_, received_a) = layer.receive(&[a], false, None).await.expect("receive a");
    let (_, received_b) = layer.receive(&[b], false, None).await.expect("receive b");
    assert_eq!(received_a.unwrap().get("x"), Some(&integer(1)));
    assert_eq!(received_b.unwrap().get("x"), Some(&integer(1)));

    layer.stop().await;
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn group_discard_stops_delivery_to_the_discarded_member() {
    let layer = layer(10, 60_000, 86_400_000).await;
    let group = unique_name("g2");
    let a = unique_name("a");
    let b = unique_name("b");

    layer.group_add(&group, &a).await.expect("group_add a");
    layer.group_add(&group, &b).await.expect("group_add b");
    layer.group_discard(&group, &a).await.expect("group_discard");

    let mut message = Message::new();
    message.insert("x".to_string(), integer(2));
    layer.send_group(&group, message).await.expect("send_group");

    let (winner_b, received_b) = layer.receive(&[b.clone()], false, None).await.expect("receive b");
    assert_eq!(winner_b, Some(b));
    assert_eq!(received_b.unwrap().get("x"), Some(&integer(2)));

    let (winner_a, received_a) = layer.receive(&[a], false, None).await.expect("receive a");
    assert_eq!(winner_a, None);
    assert!(received_a.is_none());

    layer.stop().await;
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn group_membership_expires() {
    let layer = layer(10, 60_000, 1_000).await;
    let group = unique_name("g3");
    let a = unique_name("a");

    layer.group_add(&group, &a).await.expect("group_add");
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let mut message = Message::new();
    message.insert("x".to_string(), integer(3));
    layer.send_group(&group, message).await.expect("send_group");

    let (winner, received) = layer.receive(&[a], false, None).await.expect("receive");
    assert_eq!(winner, None);
    assert!(received.is_none());

    layer.stop().await;
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn new_channel_returns_distinct_names_concurrently() {
    let layer = layer(10, 60_000, 86_400_000).await;

    let (a, b) = tokio::join!(layer.new_channel("reply!"), layer.new_channel("reply!"));
    let a = a.expect("new_channel a");
    let b = b.expect("new_channel b");

    assert!(a.starts_with("reply!"));
    assert!(b.starts_with("reply!"));
    assert_ne!(a, b);

    layer.stop().await;
}
