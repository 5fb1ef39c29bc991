//! Timer event source.
//!
//! Emits a `tick` envelope (default topic `ticker.tick`) every interval,
//! with a sequence number starting at 1.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

use dispatch_client::Envelope;

use super::{wants_topic, Consumer, DriverError, Result};

pub const SOURCE_TYPE: &str = "ticker";
pub const EVENT_TYPE: &str = "tick";

pub struct TickerConsumer {
    interval: Duration,
    source_id: String,
    closed: watch::Sender<bool>,
}

impl TickerConsumer {
    pub fn new(interval: Duration, source_id: impl Into<String>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            interval,
            source_id: source_id.into(),
            closed,
        }
    }

    /// Default topic of every emitted envelope.
    pub fn topic() -> String {
        format!("{}.{}", SOURCE_TYPE, EVENT_TYPE)
    }

    fn tick(source_id: &str, seq: u64) -> Envelope {
        let now = Utc::now();
        Envelope::new(
            SOURCE_TYPE,
            EVENT_TYPE,
            SOURCE_TYPE,
            source_id,
            json!({ "seq": seq, "time": now.to_rfc3339() }),
        )
        .with_event_time(now)
        .with_content_type("application/json")
    }
}

#[async_trait]
impl Consumer for TickerConsumer {
    async fn consume(&self, topics: &[String]) -> Result<BoxStream<'static, Envelope>> {
        if *self.closed.borrow() {
            return Err(DriverError::Closed);
        }
        if self.interval.is_zero() {
            return Err(DriverError::Source("ticker interval must be positive".to_string()));
        }
        if !wants_topic(topics, &TickerConsumer::tick(&self.source_id, 0)) {
            info!(topics = ?topics, "No ticker topic requested, nothing to emit");
            return Ok(stream::empty().boxed());
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let state = (ticker, 0u64, self.closed.subscribe(), self.source_id.clone());

        info!(interval_ms = self.interval.as_millis() as u64, "Ticker started");
        let ticks = stream::unfold(state, |(mut ticker, seq, mut stop, source_id)| async move {
            if *stop.borrow() {
                return None;
            }
            tokio::select! {
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => None,
                _ = ticker.tick() => {
                    let seq = seq + 1;
                    let envelope = TickerConsumer::tick(&source_id, seq);
                    Some((envelope, (ticker, seq, stop, source_id)))
                }
            }
        });
        Ok(ticks.boxed())
    }

    fn topics(&self) -> Vec<String> {
        vec![TickerConsumer::topic()]
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}
