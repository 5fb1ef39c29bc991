//! Kafka transport integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_kafka --features kafka -- --nocapture
//!
//! Uses Redpanda (Kafka-compatible) for a fast single-node broker.

#![cfg(feature = "kafka")]

use std::sync::Arc;
use std::time::Duration;

use dispatch_client::Envelope;
use dispatch_events::bus::kafka::{KafkaConfig, KafkaTransport};
use dispatch_events::bus::{BusError, EventHandler, Transport};
use serde_json::json;
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Generates a unique port in the ephemeral range for testing.
/// Uses a simple hash of the current thread ID and time to get variety.
fn generate_test_port() -> u16 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        .hash(&mut hasher);

    // Use ports in 29000-29999 range (less likely to conflict)
    29000 + (hasher.finish() % 1000) as u16
}

/// Start Redpanda with the advertised listener matching a fixed host port.
///
/// Clients learn broker addresses from metadata, so the advertised address
/// must be reachable from the host.
async fn start_kafka() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let host_port = generate_test_port();
    let advertised_addr = format!("localhost:{}", host_port);

    // Note: with_wait_for must be called before with_mapped_port due to type constraints
    let image = GenericImage::new("redpandadata/redpanda", "v24.1.1")
        .with_wait_for(WaitFor::message_on_stderr("Successfully started Redpanda"));

    let container = image
        .with_mapped_port(host_port, ContainerPort::Tcp(9092))
        .with_cmd([
            "redpanda",
            "start",
            "--mode",
            "dev-container",
            "--smp",
            "1",
            "--memory",
            "512M",
            "--overprovisioned",
            "--kafka-addr",
            "0.0.0.0:9092",
            "--advertise-kafka-addr",
            &advertised_addr,
        ])
        .with_startup_timeout(Duration::from_secs(120))
        .start()
        .await
        .expect("Failed to start Redpanda container");

    tokio::time::sleep(Duration::from_secs(3)).await;

    println!("Kafka available at: {}", advertised_addr);
    (container, advertised_addr)
}

fn make_envelope(id: &str) -> Envelope {
    Envelope::new("ticker", "tick", "ticker", "t-1", json!({"seq": 1})).with_event_id(id)
}

fn channel_handler(capacity: usize) -> (Arc<dyn EventHandler>, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handler = move |envelope: Envelope| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(envelope).await;
            Ok::<(), BusError>(())
        }
    };
    (Arc::new(handler), rx)
}

async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Timed out waiting for message")
        .expect("Channel closed")
}

/// Create the topic (auto-created on first produce) and subscribe.
///
/// Consumers start at the end of the partition, so the warm-up record is
/// never delivered.
async fn subscribe_ready(
    transport: &KafkaTransport,
    topic: &str,
    organization: &str,
) -> (dispatch_events::bus::Subscription, mpsc::Receiver<Envelope>) {
    transport
        .publish(&make_envelope("warm-up"), topic, "warm-up-org")
        .await
        .expect("Failed to create topic");

    let (handler, rx) = channel_handler(100);
    let subscription = transport
        .subscribe(topic, organization, handler)
        .await
        .expect("Failed to subscribe");
    // Let the consumer resolve its starting offset
    tokio::time::sleep(Duration::from_secs(2)).await;
    (subscription, rx)
}

#[tokio::test]
async fn test_publish_and_consume_in_order() {
    println!("=== Kafka Publish and Consume Test ===");

    let (_container, brokers) = start_kafka().await;
    let transport = KafkaTransport::new(KafkaConfig::new(&brokers)).expect("Failed to create transport");
    let topic = format!("ticker.tick.{}", uuid::Uuid::new_v4());

    let (_subscription, mut rx) = subscribe_ready(&transport, &topic, "acme").await;

    for i in 0..5 {
        transport
            .publish(&make_envelope(&format!("e-{}", i)), &topic, "acme")
            .await
            .expect("Failed to publish");
    }

    for i in 0..5 {
        let received = recv(&mut rx).await;
        assert_eq!(received.event_id, format!("e-{}", i));
        assert_eq!(received.data, json!({"seq": 1}));
    }

    transport.close().await.unwrap();
    println!("=== Kafka Publish and Consume Test PASSED ===");
}

#[tokio::test]
async fn test_organization_filtering() {
    println!("=== Kafka Organization Filter Test ===");

    let (_container, brokers) = start_kafka().await;
    let transport = KafkaTransport::new(KafkaConfig::new(&brokers)).unwrap();
    let topic = format!("vm.created.{}", uuid::Uuid::new_v4());

    let (_subscription, mut rx) = subscribe_ready(&transport, &topic, "acme").await;

    transport
        .publish(&make_envelope("globex-1"), &topic, "globex")
        .await
        .unwrap();
    transport
        .publish(&make_envelope("acme-1"), &topic, "acme")
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await.event_id, "acme-1");
    assert!(
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .is_err(),
        "records for other organizations must be skipped"
    );

    transport.close().await.unwrap();
    println!("=== Kafka Organization Filter Test PASSED ===");
}

#[tokio::test]
async fn test_other_topic_is_not_delivered() {
    println!("=== Kafka Topic Isolation Test ===");

    let (_container, brokers) = start_kafka().await;
    let transport = KafkaTransport::new(KafkaConfig::new(&brokers)).unwrap();
    let suffix = uuid::Uuid::new_v4();
    let subscribed = format!("vm.created.{}", suffix);
    let other = format!("vm.removed.{}", suffix);

    let (_subscription, mut rx) = subscribe_ready(&transport, &subscribed, "acme").await;
    // Same organization, different topic
    transport
        .publish(&make_envelope("warm-up"), &other, "warm-up-org")
        .await
        .expect("Failed to create topic");

    transport
        .publish(&make_envelope("other-topic"), &other, "acme")
        .await
        .unwrap();
    transport
        .publish(&make_envelope("match"), &subscribed, "acme")
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await.event_id, "match");
    assert!(
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .is_err(),
        "records on other topics must not be delivered"
    );

    transport.close().await.unwrap();
    println!("=== Kafka Topic Isolation Test PASSED ===");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    println!("=== Kafka Unsubscribe Test ===");

    let (_container, brokers) = start_kafka().await;
    let transport = KafkaTransport::new(KafkaConfig::new(&brokers)).unwrap();
    let topic = format!("ticker.tick.{}", uuid::Uuid::new_v4());

    let (subscription, mut rx) = subscribe_ready(&transport, &topic, "acme").await;

    subscription.unsubscribe();
    tokio::time::sleep(Duration::from_millis(200)).await;

    transport
        .publish(&make_envelope("after"), &topic, "acme")
        .await
        .unwrap();
    let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
    assert!(!matches!(next, Ok(Some(_))));

    transport.close().await.unwrap();
    println!("=== Kafka Unsubscribe Test PASSED ===");
}
