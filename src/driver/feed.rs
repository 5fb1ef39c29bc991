//! Hypervisor-style event feed adapter.
//!
//! Polls an [`EventFeed`] for pages of events, sorts each page by event
//! time, projects each event's kind into a small JSON metadata object and
//! wraps it in an envelope whose event type is derived from the feed's
//! type name (`VmCreatedEvent` -> `vm.created`).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use dispatch_client::Envelope;

use super::{wants_topic, Consumer, DriverError, Result};

/// Schema version stamped on every feed envelope.
pub const SCHEMA_VERSION: &str = "1.0";

/// What an event is about.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSubject {
    Vm { name: String, host: Option<String> },
    Host { name: String },
    Alarm { name: String, entity: String, status: String },
    Other,
}

/// One event as delivered by the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    /// Feed-assigned key, unique per source.
    pub key: i64,
    /// Concrete event type name, e.g. `VmPoweredOnEvent`.
    pub type_name: String,
    pub created_time: DateTime<Utc>,
    pub user_name: Option<String>,
    pub message: String,
    pub datacenter: Option<String>,
    pub subject: FeedSubject,
}

impl FeedEvent {
    /// Per-kind metadata carried as the envelope's data.
    pub fn metadata(&self) -> Value {
        let mut meta = match &self.subject {
            FeedSubject::Vm { name, host } => json!({ "vm": name, "host": host }),
            FeedSubject::Host { name } => json!({ "host": name }),
            FeedSubject::Alarm {
                name,
                entity,
                status,
            } => json!({ "alarm": name, "entity": entity, "status": status }),
            FeedSubject::Other => json!({ "message": self.message }),
        };
        if let Value::Object(map) = &mut meta {
            if let Some(user) = &self.user_name {
                map.insert("user".to_string(), json!(user));
            }
            if let Some(dc) = &self.datacenter {
                map.insert("datacenter".to_string(), json!(dc));
            }
        }
        meta
    }
}

/// Source of event pages (a management API session in production).
#[async_trait]
pub trait EventFeed: Send + Sync + 'static {
    /// Next page of at most `max` events; empty when nothing new arrived.
    async fn next_page(&self, max: usize) -> Result<Vec<FeedEvent>>;

    async fn close(&self) -> Result<()>;
}

/// Feed consumer settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub namespace: String,
    pub source_type: String,
    pub source_id: String,
    pub page_size: usize,
    /// Wait between polls when a page comes back empty or fails.
    pub poll_interval: Duration,
    pub topics: Vec<String>,
}

impl FeedConfig {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            namespace: "vcenter".to_string(),
            source_type: "vcenter".to_string(),
            source_id: source_id.into(),
            page_size: 100,
            poll_interval: Duration::from_secs(1),
            topics: Vec::new(),
        }
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// [`Consumer`] over an [`EventFeed`].
pub struct FeedConsumer<F> {
    feed: Arc<F>,
    config: FeedConfig,
    closed: watch::Sender<bool>,
}

impl<F: EventFeed> FeedConsumer<F> {
    pub fn new(feed: F, config: FeedConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            feed: Arc::new(feed),
            config,
            closed,
        }
    }

    fn to_envelope(config: &FeedConfig, event: &FeedEvent) -> Envelope {
        Envelope::new(
            config.namespace.as_str(),
            topic_from_type_name(&event.type_name),
            config.source_type.as_str(),
            config.source_id.as_str(),
            event.metadata(),
        )
        .with_event_id(event.key.to_string())
        .with_event_time(event.created_time)
        .with_event_type_version(SCHEMA_VERSION)
        .with_content_type("application/json")
    }
}

struct PollState<F> {
    feed: Arc<F>,
    config: FeedConfig,
    topics: Vec<String>,
    buffer: VecDeque<Envelope>,
    stop: watch::Receiver<bool>,
}

impl<F: EventFeed> PollState<F> {
    /// Pull pages until something passes the filter; `None` once stopped.
    async fn next(&mut self) -> Option<Envelope> {
        loop {
            if *self.stop.borrow() {
                return None;
            }
            if let Some(envelope) = self.buffer.pop_front() {
                return Some(envelope);
            }

            match self.feed.next_page(self.config.page_size).await {
                Ok(mut page) if !page.is_empty() => {
                    page.sort_by_key(|e| e.created_time);
                    debug!(events = page.len(), "Received feed page");
                    for event in &page {
                        let envelope = FeedConsumer::<F>::to_envelope(&self.config, event);
                        if wants_topic(&self.topics, &envelope) {
                            self.buffer.push_back(envelope);
                        }
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to read feed page, retrying"),
            }

            tokio::select! {
                _ = self.stop.wait_for(|stopped| *stopped) => return None,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}

#[async_trait]
impl<F: EventFeed> Consumer for FeedConsumer<F> {
    async fn consume(&self, topics: &[String]) -> Result<BoxStream<'static, Envelope>> {
        if *self.closed.borrow() {
            return Err(DriverError::Closed);
        }
        info!(source_id = %self.config.source_id, topics = ?topics, "Consuming event feed");

        let state = PollState {
            feed: self.feed.clone(),
            config: self.config.clone(),
            topics: topics.to_vec(),
            buffer: VecDeque::new(),
            stop: self.closed.subscribe(),
        };
        let events = stream::unfold(state, |mut state| async move {
            state.next().await.map(|envelope| (envelope, state))
        });
        Ok(Box::pin(events))
    }

    fn topics(&self) -> Vec<String> {
        self.config.topics.clone()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.feed.close().await
    }
}

/// `VmPoweredOnEvent` -> `vm.powered.on`.
///
/// The trailing `Event` is dropped and words split at case changes; runs of
/// capitals stay together (`HAHostEvent` -> `ha.host`).
pub fn topic_from_type_name(type_name: &str) -> String {
    let name = type_name.strip_suffix("Event").unwrap_or(type_name);
    let chars: Vec<char> = name.chars().collect();
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_ascii_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase() || prev.is_ascii_digit() || (prev.is_ascii_uppercase() && next_lower) {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words.join(".")
}
