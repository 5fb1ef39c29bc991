//! AMQP (RabbitMQ) transport.
//!
//! Uses one topic exchange; the routing key is `{organization}.{topic}`.
//!
//! The message body is only the envelope's `data`. Every other envelope
//! field rides in message properties and `dispatch-*` headers so the
//! consumer can rebuild the envelope exactly. Trace context is written as
//! plain top-level headers.
//!
//! Two connections are held: one for publishing, one for consuming. A
//! connection error is logged and stops the transport; there is no
//! reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use dispatch_client::trace::{carrier_from_pairs, inject_context, link_remote, TraceCarrier};
use dispatch_client::Envelope;

use super::subscription::transport_signal;
use super::{
    require_route, routing_key, BusError, EventHandler, Result, StopSignal, Subscription,
    Transport,
};

/// Default exchange name.
pub const DEFAULT_EXCHANGE: &str = "dispatch";

/// Header names for envelope fields that have no AMQP property.
pub mod headers {
    pub const SCHEMA_URL: &str = "dispatch-schema-url";
    pub const EVENT_TYPE_VERSION: &str = "dispatch-event-type-version";
    pub const NAMESPACE: &str = "dispatch-namespace";
    pub const SOURCE_TYPE: &str = "dispatch-source-type";
    pub const ENVELOPE_VERSION: &str = "dispatch-envelope-version";
    pub const EVENT_TIME: &str = "dispatch-event-time";
    pub const DATA_ENCODING: &str = "dispatch-data-encoding";
    pub const EXTENSIONS: &str = "dispatch-extensions";

    pub const PREFIX: &str = "dispatch-";

    pub const ENCODING_STRING: &str = "string";
    pub const ENCODING_JSON: &str = "json";
}

/// Configuration for the AMQP connections.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Topic exchange every publish and binding goes through.
    pub exchange: String,
    /// How long `publish` waits for the broker's confirm.
    pub publish_timeout: Duration,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            publish_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// RabbitMQ transport over a durable topic exchange.
pub struct AmqpTransport {
    config: AmqpConfig,
    send_conn: Connection,
    recv_conn: Connection,
    closed: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

impl AmqpTransport {
    /// Open both connections and declare the exchange.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let send_conn = Self::open(&config.url).await?;
        let recv_conn = Self::open(&config.url).await?;

        let (closed, closed_rx) = transport_signal();
        let closed = Arc::new(closed);
        Self::watch_connection(&send_conn, "send", closed.clone());
        Self::watch_connection(&recv_conn, "receive", closed.clone());

        let channel = send_conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;
        if let Err(e) = channel.close(200, "OK").await {
            debug!(error = %e, "Failed to close setup channel");
        }

        info!(exchange = %config.exchange, url = %config.url, "Connected to AMQP");

        Ok(Self {
            config,
            send_conn,
            recv_conn,
            closed,
            closed_rx,
        })
    }

    async fn open(url: &str) -> Result<Connection> {
        Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))
    }

    /// Log connection errors and stop the transport.
    fn watch_connection(conn: &Connection, role: &'static str, closed: Arc<watch::Sender<bool>>) {
        conn.on_error(move |e| {
            error!(connection = role, error = %e, "AMQP connection lost, transport stopped");
            closed.send_replace(true);
        });
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    async fn listen(
        channel: lapin::Channel,
        mut consumer: lapin::Consumer,
        key: String,
        handler: Arc<dyn EventHandler>,
        mut stop: StopSignal,
    ) {
        loop {
            let next = tokio::select! {
                _ = stop.stopped() => None,
                delivery = consumer.next() => delivery,
            };

            match next {
                Some(Ok(delivery)) => Self::process_delivery(delivery, &key, &handler).await,
                Some(Err(e)) => {
                    error!(error = %e, routing_key = %key, "Consumer delivery error, stopping");
                    break;
                }
                None => break,
            }
        }

        // Closing the channel drops the exclusive queue.
        if let Err(e) = channel.close(200, "OK").await {
            debug!(error = %e, "Failed to close consumer channel");
        }
        debug!(routing_key = %key, "AMQP listener stopped");
    }

    async fn process_delivery(delivery: Delivery, key: &str, handler: &Arc<dyn EventHandler>) {
        let (envelope, carrier) = match decode_message(&delivery.properties, &delivery.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(error = %e, routing_key = %key, "Failed to decode message");
                // Don't requeue malformed messages
                if let Err(e) = delivery.reject(BasicRejectOptions::default()).await {
                    error!(error = %e, "Failed to reject message");
                }
                return;
            }
        };

        let span = tracing::info_span!(
            "transport.consume",
            transport = "amqp",
            routing_key = %key,
            event_id = %envelope.event_id,
        );
        link_remote(&span, &carrier);

        if let Err(e) = handler.handle(envelope).instrument(span).await {
            error!(error = %e, routing_key = %key, "Handler failed");
        }

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %e, "Failed to ack message");
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    #[tracing::instrument(name = "transport.publish", skip_all, fields(transport = "amqp", topic = %topic, organization = %organization))]
    async fn publish(&self, envelope: &Envelope, topic: &str, organization: &str) -> Result<()> {
        require_route(topic, organization)?;
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let key = routing_key(organization, topic);
        let mut carrier = TraceCarrier::new();
        inject_context(&mut carrier);
        let properties = encode_properties(envelope, &carrier)?;
        let body = envelope.data_bytes();

        let channel = self
            .send_conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Publish(format!("Failed to enable confirms: {}", e)))?;

        let publish = async {
            let confirm = channel
                .basic_publish(
                    &self.config.exchange,
                    &key,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await
                .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;
            let confirmation = confirm
                .await
                .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;
            if confirmation.is_nack() {
                return Err(BusError::Publish("Broker rejected message".to_string()));
            }
            Ok(())
        };

        let result = match tokio::time::timeout(self.config.publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(format!(
                "no confirm within {:?}",
                self.config.publish_timeout
            ))),
        };

        if let Err(e) = channel.close(200, "OK").await {
            debug!(error = %e, "Failed to close publish channel");
        }

        result?;
        debug!(exchange = %self.config.exchange, routing_key = %key, "Published envelope");
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

        let key = routing_key(organization, topic);
        let channel = self
            .recv_conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        let queue_name = queue.name().as_str().to_string();

        channel
            .queue_bind(
                &queue_name,
                &self.config.exchange,
                &key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        let consumer = channel
            .basic_consume(
                &queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let (subscription, stop) = Subscription::new(topic, organization, self.closed_rx.clone());
        info!(queue = %queue_name, routing_key = %key, "Bound queue to exchange");

        tokio::spawn(Self::listen(channel, consumer, key, handler, stop));
        Ok(subscription)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        for conn in [&self.send_conn, &self.recv_conn] {
            if let Err(e) = conn.close(200, "OK").await {
                warn!(error = %e, "Failed to close AMQP connection");
            }
        }
        info!("AMQP transport closed");
        Ok(())
    }
}

// ============================================================================
// Codec
// ============================================================================

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

fn header_str<'a>(table: &'a FieldTable, key: &str) -> Option<&'a str> {
    match table.inner().get(key)? {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok(),
        AMQPValue::ShortString(s) => Some(s.as_str()),
        _ => None,
    }
}

/// Longest AMQP short string (field names, message id, type, content type).
pub const MAX_SHORT_STRING: usize = 255;

/// Short string for `value`, or an encode error naming `what`.
fn short_string(what: &str, value: &str) -> Result<ShortString> {
    if value.len() > MAX_SHORT_STRING {
        return Err(BusError::Encode(format!(
            "{} is {} bytes, AMQP short strings hold at most {}",
            what,
            value.len(),
            MAX_SHORT_STRING
        )));
    }
    Ok(ShortString::from(value))
}

/// Build message properties for `envelope`, with `trace` as extra headers.
///
/// Fails with [`BusError::Encode`] when a value that must travel as an AMQP
/// short string is too long, so the broker never sees a bad frame.
pub fn encode_properties(envelope: &Envelope, trace: &TraceCarrier) -> Result<BasicProperties> {
    let mut table = FieldTable::default();
    for (key, value) in trace {
        table.insert(short_string("trace header name", key)?, long_string(value));
    }

    table.insert(headers::NAMESPACE.into(), long_string(&envelope.namespace));
    table.insert(headers::SOURCE_TYPE.into(), long_string(&envelope.source_type));
    table.insert(
        headers::ENVELOPE_VERSION.into(),
        long_string(&envelope.envelope_version),
    );
    if let Some(url) = &envelope.schema_url {
        table.insert(headers::SCHEMA_URL.into(), long_string(url));
    }
    if let Some(version) = &envelope.event_type_version {
        table.insert(headers::EVENT_TYPE_VERSION.into(), long_string(version));
    }
    if let Some(time) = &envelope.event_time {
        table.insert(headers::EVENT_TIME.into(), long_string(&time.to_rfc3339()));
    }
    let encoding = if envelope.data_is_string() {
        headers::ENCODING_STRING
    } else {
        headers::ENCODING_JSON
    };
    table.insert(headers::DATA_ENCODING.into(), long_string(encoding));

    if !envelope.extensions.is_empty() {
        let mut extensions = FieldTable::default();
        for (key, value) in &envelope.extensions {
            extensions.insert(short_string("extension name", key)?, long_string(value));
        }
        table.insert(headers::EXTENSIONS.into(), AMQPValue::FieldTable(extensions));
    }

    let mut properties = BasicProperties::default()
        .with_message_id(short_string("event id", &envelope.event_id)?)
        .with_kind(short_string("event type", &envelope.event_type)?)
        .with_correlation_id(short_string("source id", &envelope.source_id)?)
        .with_delivery_mode(2)
        .with_headers(table);

    if let Some(ts) = envelope
        .event_time
        .and_then(|t| u64::try_from(t.timestamp()).ok())
    {
        properties = properties.with_timestamp(ts);
    }
    if let Some(content_type) = &envelope.content_type {
        properties = properties.with_content_type(short_string("content type", content_type)?);
    }
    Ok(properties)
}

/// Rebuild the envelope and the publisher's trace carrier from a message.
pub fn decode_message(properties: &BasicProperties, body: &[u8]) -> Result<(Envelope, TraceCarrier)> {
    let empty = FieldTable::default();
    let table = properties.headers().as_ref().unwrap_or(&empty);
    let header = |key: &str| header_str(table, key).map(str::to_string);

    let encoding = header_str(table, headers::DATA_ENCODING).unwrap_or(headers::ENCODING_STRING);
    let data = match encoding {
        headers::ENCODING_JSON if body.is_empty() => serde_json::Value::Null,
        headers::ENCODING_JSON => {
            serde_json::from_slice(body).map_err(|e| BusError::Decode(e.to_string()))?
        }
        headers::ENCODING_STRING => {
            serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
        }
        other => {
            return Err(BusError::Decode(format!("unknown data encoding: {}", other)));
        }
    };

    let event_time = match header_str(table, headers::EVENT_TIME) {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| BusError::Decode(format!("bad event time: {}", e)))?
                .with_timezone(&Utc),
        ),
        None => (*properties.timestamp())
            .and_then(|ts| i64::try_from(ts).ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0)),
    };

    let mut extensions = HashMap::new();
    if let Some(AMQPValue::FieldTable(nested)) = table.inner().get(headers::EXTENSIONS) {
        for key in nested.inner().keys() {
            if let Some(value) = header_str(nested, key.as_str()) {
                extensions.insert(key.as_str().to_string(), value.to_string());
            }
        }
    }

    let carrier = carrier_from_pairs(
        table
            .inner()
            .keys()
            .map(|k| k.as_str())
            .filter(|k| !k.starts_with(headers::PREFIX))
            .filter_map(|k| header_str(table, k).map(|v| (k, v))),
    );

    let short = |value: &Option<ShortString>| {
        value
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default()
    };

    let envelope = Envelope {
        namespace: header(headers::NAMESPACE).unwrap_or_default(),
        event_type: short(properties.kind()),
        event_type_version: header(headers::EVENT_TYPE_VERSION),
        envelope_version: header(headers::ENVELOPE_VERSION).unwrap_or_default(),
        source_type: header(headers::SOURCE_TYPE).unwrap_or_default(),
        source_id: short(properties.correlation_id()),
        event_id: short(properties.message_id()),
        event_time,
        schema_url: header(headers::SCHEMA_URL),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        extensions,
        data,
    };

    Ok((envelope, carrier))
}
