//! Mock transport for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use dispatch_client::Envelope;

use super::{BusError, EventHandler, Result, Subscription, Transport};

/// One recorded `publish` call.
#[derive(Debug, Clone)]
pub struct Published {
    pub envelope: Envelope,
    pub topic: String,
    pub organization: String,
}

/// Records publishes and can be told to fail them.
#[derive(Default)]
pub struct MockTransport {
    published: RwLock<Vec<Published>>,
    fail_on_publish: RwLock<bool>,
    /// Fail every publish once this many have succeeded.
    fail_after: RwLock<Option<usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Let `successes` publishes through, then fail the rest.
    pub async fn set_fail_after(&self, successes: usize) {
        *self.fail_after.write().await = Some(successes);
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<Published> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, envelope: &Envelope, topic: &str, organization: &str) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }

        let mut published = self.published.write().await;
        if let Some(limit) = *self.fail_after.read().await {
            if published.len() >= limit {
                return Err(BusError::Publish("Mock publish failure".to_string()));
            }
        }

        published.push(Published {
            envelope: envelope.clone(),
            topic: topic.to_string(),
            organization: organization.to_string(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _organization: &str,
        _handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        Err(BusError::Subscribe(
            "mock transport does not deliver".to_string(),
        ))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
