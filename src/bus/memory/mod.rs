//! In-memory transport for single-process use and testing.
//!
//! State is a two-level map `organization -> topic -> bounded queue`. The map
//! mutex only guards creating and removing queues; delivery goes through the
//! queue itself.
//!
//! Publishing to a `(organization, topic)` nobody has subscribed to is a
//! successful no-op: the envelope is dropped. Subscriptions on the same pair
//! share one queue as competing consumers, and the queue is removed when the
//! last of them unsubscribes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, Instrument};

use dispatch_client::Envelope;

use super::subscription::transport_signal;
use super::{require_route, BusError, EventHandler, Result, StopSignal, Subscription, Transport};

/// Default queue capacity per (organization, topic).
pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

type SharedReceiver = Arc<AsyncMutex<mpsc::Receiver<Envelope>>>;

struct Queue {
    sender: mpsc::Sender<Envelope>,
    receiver: SharedReceiver,
    subscribers: usize,
}

type QueueMap = HashMap<String, HashMap<String, Queue>>;

/// Bounded in-process queues keyed by organization and topic.
pub struct MemoryTransport {
    queues: Arc<Mutex<QueueMap>>,
    capacity: usize,
    closed: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (closed, closed_rx) = transport_signal();
        info!(capacity = capacity, "Memory transport initialized");
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            closed,
            closed_rx,
        }
    }

    /// Number of live queues (for diagnostics and tests).
    pub fn queue_count(&self) -> usize {
        self.queues
            .lock()
            .map(|map| map.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueMap>> {
        self.queues
            .lock()
            .map_err(|_| BusError::Connection("queue map poisoned".to_string()))
    }

    /// Get or create the queue for a pair and register one more subscriber.
    fn attach(&self, organization: &str, topic: &str) -> Result<SharedReceiver> {
        let mut map = self.lock()?;
        let queue = map
            .entry(organization.to_string())
            .or_default()
            .entry(topic.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::channel(self.capacity);
                debug!(organization = %organization, topic = %topic, "Created queue");
                Queue {
                    sender,
                    receiver: Arc::new(AsyncMutex::new(receiver)),
                    subscribers: 0,
                }
            });
        queue.subscribers += 1;
        Ok(queue.receiver.clone())
    }

    async fn listen(
        organization: String,
        topic: String,
        receiver: SharedReceiver,
        handler: Arc<dyn EventHandler>,
        mut stop: StopSignal,
    ) {
        loop {
            let next = {
                let mut rx = receiver.lock().await;
                tokio::select! {
                    _ = stop.stopped() => None,
                    envelope = rx.recv() => envelope,
                }
            };

            let Some(envelope) = next else {
                break;
            };

            let span = tracing::info_span!(
                "transport.consume",
                transport = "memory",
                organization = %organization,
                topic = %topic,
                event_id = %envelope.event_id,
            );
            envelope.follow_trace(&span);

            if let Err(e) = handler.handle(envelope).instrument(span).await {
                error!(error = %e, topic = %topic, "Handler failed");
            }
        }

        debug!(organization = %organization, topic = %topic, "Memory listener stopped");
    }
}

/// Drop one subscriber from a pair; remove the queue with the last one.
fn detach(queues: &Mutex<QueueMap>, organization: &str, topic: &str) {
    let Ok(mut map) = queues.lock() else {
        return;
    };
    let Some(topics) = map.get_mut(organization) else {
        return;
    };
    if let Some(queue) = topics.get_mut(topic) {
        queue.subscribers = queue.subscribers.saturating_sub(1);
        if queue.subscribers == 0 {
            topics.remove(topic);
            debug!(organization = %organization, topic = %topic, "Removed queue");
        }
    }
    if topics.is_empty() {
        map.remove(organization);
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    #[tracing::instrument(name = "transport.publish", skip_all, fields(transport = "memory", topic = %topic, organization = %organization))]
    async fn publish(&self, envelope: &Envelope, topic: &str, organization: &str) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        require_route(topic, organization)?;

        // Clone the sender so the map lock is not held while the queue is full.
        let sender = {
            let map = self.lock()?;
            map.get(organization)
                .and_then(|topics| topics.get(topic))
                .map(|queue| queue.sender.clone())
        };

        let Some(sender) = sender else {
            debug!("No subscribers, dropping event");
            return Ok(());
        };

        let mut envelope = envelope.clone();
        envelope.inject_trace();

        sender
            .send(envelope)
            .await
            .map_err(|_| BusError::Publish("queue closed".to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        organization: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        require_route(topic, organization)?;

        let receiver = self.attach(organization, topic)?;
        let (subscription, stop) = Subscription::new(topic, organization, self.closed_rx.clone());

        let queues = self.queues.clone();
        let (org, top) = (organization.to_string(), topic.to_string());
        let subscription = subscription.on_cancel(move || detach(&queues, &org, &top));

        tokio::spawn(Self::listen(
            organization.to_string(),
            topic.to_string(),
            receiver,
            handler,
            stop,
        ));

        info!(organization = %organization, topic = %topic, "Subscribed to memory queue");
        Ok(subscription)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.lock()?.clear();
        info!("Memory transport closed");
        Ok(())
    }
}
