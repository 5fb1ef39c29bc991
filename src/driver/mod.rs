//! Driver pipeline: adapt an external event source and forward to a sidecar.
//!
//! A [`Consumer`] turns some source (a hypervisor event feed, a timer) into
//! a stream of envelopes. A [`Driver`] pumps that stream into an
//! [`EventSender`], one event at a time, in arrival order.
//!
//! The run loop is fail-fast: the first send failure ends it. There is no
//! retry.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, error, info, Instrument};

use dispatch_client::{ClientError, Envelope, EventSender};

pub mod feed;
pub mod ticker;

pub use feed::{EventFeed, FeedConfig, FeedConsumer, FeedEvent};
pub use ticker::TickerConsumer;

pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors from the driver pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Failed to open event source: {0}")]
    Source(String),

    #[error("Failed to send event {event_id}: {source}")]
    Send {
        event_id: String,
        #[source]
        source: ClientError,
    },

    #[error("Consumer is closed")]
    Closed,
}

/// An external event source.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Start delivering envelopes for `topics` (empty = everything).
    ///
    /// Topics are matched with [`wants_topic`].
    ///
    /// The stream ends after [`close`](Consumer::close).
    async fn consume(&self, topics: &[String]) -> Result<BoxStream<'static, Envelope>>;

    /// Topics this consumer was configured with.
    fn topics(&self) -> Vec<String>;

    async fn close(&self) -> Result<()>;
}

/// Topic selection shared by every consumer.
///
/// An empty list selects everything. Otherwise an envelope is selected when
/// a topic equals its routing topic (`vcenter.vm.created`, see
/// [`Envelope::default_topic`]) or its bare event type (`vm.created`).
pub fn wants_topic(topics: &[String], envelope: &Envelope) -> bool {
    if topics.is_empty() {
        return true;
    }
    let routing = envelope.default_topic();
    topics
        .iter()
        .any(|t| *t == envelope.event_type || *t == routing)
}

/// Pumps one consumer into one sender.
pub struct Driver<C, S> {
    consumer: C,
    sender: S,
}

impl<C: Consumer, S: EventSender> Driver<C, S> {
    pub fn new(consumer: C, sender: S) -> Self {
        Self { consumer, sender }
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Forward events until the source ends or a send fails.
    ///
    /// Returns the number of events delivered.
    pub async fn run(&self) -> Result<u64> {
        let topics = self.consumer.topics();
        let mut events = self.consumer.consume(&topics).await?;
        info!(topics = ?topics, "Driver started");

        let mut sent = 0u64;
        while let Some(event) = events.next().await {
            let span = tracing::info_span!(
                "driver.send",
                event_id = %event.event_id,
                event_type = %event.event_type,
            );
            if let Err(source) = self.sender.send_one(&event).instrument(span).await {
                error!(event_id = %event.event_id, error = %source, "Send failed, stopping driver");
                return Err(DriverError::Send {
                    event_id: event.event_id,
                    source,
                });
            }
            sent += 1;
            debug!(event_id = %event.event_id, sent, "Forwarded event");
        }

        info!(sent, "Event source ended");
        Ok(sent)
    }

    pub async fn close(&self) -> Result<()> {
        self.consumer.close().await
    }
}

#[cfg(test)]
mod tests;
