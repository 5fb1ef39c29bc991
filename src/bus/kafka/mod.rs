//! Kafka transport.
//!
//! Single-partition model: every record goes to partition 0 of the
//! caller's topic, and each subscription reads partition 0 from the newest
//! offset. The record value is the full JSON envelope.
//!
//! The topic is not prefixed with the organization. Records carry a
//! `dispatch-organization` header instead and subscriptions skip records
//! for other organizations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use dispatch_client::trace::{carrier_from_pairs, inject_context, link_remote, TraceCarrier};
use dispatch_client::Envelope;

use super::subscription::transport_signal;
use super::{require_route, BusError, EventHandler, Result, StopSignal, Subscription, Transport};

/// Header naming the organization a record belongs to.
pub const ORGANIZATION_HEADER: &str = "dispatch-organization";

/// The only partition produced to and consumed from.
pub const PARTITION: i32 = 0;

/// Configuration for the Kafka clients.
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub brokers: String,
    /// How long `publish` waits for the broker's ack.
    pub send_timeout: Duration,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            send_timeout: Duration::from_secs(5),
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config.set("message.timeout.ms", self.send_timeout.as_millis().to_string());
        config.set("acks", "all");

        self.apply_security(&mut config);
        config
    }

    fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        // Partitions are assigned manually; the group is never joined.
        config.set("group.id", format!("dispatch-{}", uuid::Uuid::new_v4()));
        config.set("enable.auto.commit", "false");
        config.set("enable.partition.eof", "false");

        self.apply_security(&mut config);
        config
    }

    fn apply_security(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }
    }
}

/// Kafka transport with one shared producer and a consumer per subscription.
pub struct KafkaTransport {
    producer: FutureProducer,
    config: KafkaConfig,
    closed: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl KafkaTransport {
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        let (closed, closed_rx) = transport_signal();
        info!(brokers = %config.brokers, "Connected to Kafka");

        Ok(Self {
            producer,
            config,
            closed,
            closed_rx,
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    async fn listen(
        consumer: StreamConsumer,
        topic: String,
        organization: String,
        handler: Arc<dyn EventHandler>,
        mut stop: StopSignal,
    ) {
        loop {
            let message = tokio::select! {
                _ = stop.stopped() => break,
                message = consumer.recv() => message,
            };

            match message {
                Ok(message) => {
                    Self::process_message(&message, &organization, &handler).await;
                }
                Err(e) => {
                    error!(error = %e, topic = %topic, "Kafka consumer error");
                }
            }
        }

        debug!(topic = %topic, organization = %organization, "Kafka listener stopped");
    }

    async fn process_message(
        message: &BorrowedMessage<'_>,
        organization: &str,
        handler: &Arc<dyn EventHandler>,
    ) {
        let (record_org, carrier) = match message.headers() {
            Some(headers) => read_headers(headers),
            None => (None, TraceCarrier::new()),
        };
        if record_org.as_deref() != Some(organization) {
            return;
        }

        let Some(payload) = message.payload() else {
            warn!(topic = %message.topic(), "Received message with no payload");
            return;
        };
        let envelope = match decode_envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, topic = %message.topic(), "Failed to decode envelope");
                return;
            }
        };

        let span = tracing::info_span!(
            "transport.consume",
            transport = "kafka",
            topic = %message.topic(),
            organization = %organization,
            offset = message.offset(),
            event_id = %envelope.event_id,
        );
        link_remote(&span, &carrier);

        if let Err(e) = handler.handle(envelope).instrument(span).await {
            error!(error = %e, topic = %message.topic(), "Handler failed");
        }
    }
}

/// Record headers: organization plus propagated trace context.
pub fn record_headers(organization: &str, trace: &TraceCarrier) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new().insert(Header {
        key: ORGANIZATION_HEADER,
        value: Some(organization),
    });
    for (key, value) in trace {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_str()),
        });
    }
    headers
}

/// Split record headers into the organization and the trace carrier.
pub fn read_headers<H: Headers>(headers: &H) -> (Option<String>, TraceCarrier) {
    let mut organization = None;
    let mut pairs = Vec::new();
    for header in headers.iter() {
        let Some(value) = header.value.and_then(|v| std::str::from_utf8(v).ok()) else {
            continue;
        };
        if header.key == ORGANIZATION_HEADER {
            organization = Some(value.to_string());
        } else {
            pairs.push((header.key, value));
        }
    }
    (organization, carrier_from_pairs(pairs))
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| BusError::Encode(e.to_string()))
}

pub fn decode_envelope(payload: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(payload).map_err(|e| BusError::Decode(e.to_string()))
}

fn send_error(e: KafkaError, timeout: Duration) -> BusError {
    match e {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => {
            BusError::Timeout(format!("no ack within {:?}", timeout))
        }
        other => BusError::Publish(format!("Failed to publish: {}", other)),
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    #[tracing::instrument(name = "transport.publish", skip_all, fields(transport = "kafka", topic = %topic, organization = %organization))]
    async fn publish(&self, envelope: &Envelope, topic: &str, organization: &str) -> Result<()> {
        require_route(topic, organization)?;
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let payload = encode_envelope(envelope)?;
        let mut carrier = TraceCarrier::new();
        inject_context(&mut carrier);

        let record = FutureRecord::to(topic)
            .partition(PARTITION)
            .key(&envelope.source_id)
            .payload(&payload)
            .headers(record_headers(organization, &carrier));

        let (partition, offset) = self
            .producer
            .send(record, self.config.send_timeout)
            .await
            .map_err(|(e, _)| send_error(e, self.config.send_timeout))?;

        debug!(topic = %topic, partition, offset, "Published envelope to Kafka");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        organization: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        require_route(topic, organization)?;
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let consumer: StreamConsumer = self
            .config
            .consumer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka consumer: {}", e)))?;

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, PARTITION, Offset::End)
            .map_err(|e| BusError::Subscribe(format!("Failed to build assignment: {}", e)))?;
        consumer
            .assign(&assignment)
            .map_err(|e| BusError::Subscribe(format!("Failed to assign partition: {}", e)))?;

        let (subscription, stop) = Subscription::new(topic, organization, self.closed_rx.clone());
        info!(topic = %topic, organization = %organization, "Subscribed to Kafka partition");

        tokio::spawn(Self::listen(
            consumer,
            topic.to_string(),
            organization.to_string(),
            handler,
            stop,
        ));
        Ok(subscription)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        let producer = self.producer.clone();
        let timeout = self.config.send_timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BusError::Connection(format!("Flush task failed: {}", e)))?;
        if let Err(e) = flushed {
            warn!(error = %e, "Failed to flush Kafka producer");
        }

        info!("Kafka transport closed");
        Ok(())
    }
}
