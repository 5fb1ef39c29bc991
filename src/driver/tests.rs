use super::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::DateTime;
use serde_json::json;

use super::feed::FeedSubject;

/// Records every attempted send; fails the attempt at `fail_at` (0-based).
#[derive(Default)]
struct RecordingSender {
    attempts: Mutex<Vec<String>>,
    fail_at: Option<usize>,
}

impl RecordingSender {
    fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::default()
        }
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSender for RecordingSender {
    async fn send_one(&self, envelope: &Envelope) -> dispatch_client::Result<()> {
        let index = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(envelope.event_id.clone());
            attempts.len() - 1
        };
        if self.fail_at == Some(index) {
            return Err(ClientError::Rejected {
                status: 500,
                body: "broker down".to_string(),
            });
        }
        Ok(())
    }

    async fn send(&self, envelopes: &[Envelope]) -> dispatch_client::Result<()> {
        for envelope in envelopes {
            self.send_one(envelope).await?;
        }
        Ok(())
    }
}

/// Emits a fixed list of envelopes, then ends.
struct ListConsumer {
    events: Vec<Envelope>,
    closed: Mutex<bool>,
}

impl ListConsumer {
    fn new(ids: &[&str]) -> Self {
        let events = ids
            .iter()
            .map(|id| {
                Envelope::new("ns", "thing.happened", "test", "src-1", json!({})).with_event_id(*id)
            })
            .collect();
        Self {
            events,
            closed: Mutex::new(false),
        }
    }
}

#[async_trait]
impl Consumer for ListConsumer {
    async fn consume(&self, _topics: &[String]) -> Result<BoxStream<'static, Envelope>> {
        Ok(futures::stream::iter(self.events.clone()).boxed())
    }

    fn topics(&self) -> Vec<String> {
        Vec::new()
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

#[tokio::test]
async fn test_run_forwards_in_order() {
    let driver = Driver::new(ListConsumer::new(&["a", "b", "c"]), RecordingSender::default());

    let sent = driver.run().await.unwrap();

    assert_eq!(sent, 3);
    assert_eq!(driver.sender.attempts(), ["a", "b", "c"]);
}

/// The first send failure aborts the run; later events are never attempted.
#[tokio::test]
async fn test_run_stops_at_first_send_failure() {
    let driver = Driver::new(
        ListConsumer::new(&["a", "b", "c"]),
        RecordingSender::failing_at(1),
    );

    let result = driver.run().await;

    match result {
        Err(DriverError::Send { event_id, source }) => {
            assert_eq!(event_id, "b");
            assert_eq!(source.status(), Some(500));
        }
        other => panic!("expected send error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(driver.sender.attempts(), ["a", "b"]);
}

#[tokio::test]
async fn test_close_closes_consumer() {
    let driver = Driver::new(ListConsumer::new(&[]), RecordingSender::default());
    driver.close().await.unwrap();
    assert!(*driver.consumer().closed.lock().unwrap());
}

// ============================================================================
// Feed consumer
// ============================================================================

/// Serves scripted pages, then empty pages forever.
struct ScriptedFeed {
    pages: Mutex<Vec<Vec<FeedEvent>>>,
    closed: Arc<Mutex<bool>>,
}

#[async_trait]
impl EventFeed for ScriptedFeed {
    async fn next_page(&self, max: usize) -> Result<Vec<FeedEvent>> {
        let mut pages = self.pages.lock().unwrap();
        if pages.is_empty() {
            return Ok(Vec::new());
        }
        let mut page = pages.remove(0);
        page.truncate(max);
        Ok(page)
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

fn feed_event(key: i64, secs: i64, type_name: &str) -> FeedEvent {
    FeedEvent {
        key,
        type_name: type_name.to_string(),
        created_time: DateTime::from_timestamp(secs, 0).unwrap(),
        user_name: None,
        message: String::new(),
        datacenter: None,
        subject: FeedSubject::Vm {
            name: format!("vm-{}", key),
            host: None,
        },
    }
}

fn scripted(pages: Vec<Vec<FeedEvent>>) -> (ScriptedFeed, Arc<Mutex<bool>>) {
    let closed = Arc::new(Mutex::new(false));
    let feed = ScriptedFeed {
        pages: Mutex::new(pages),
        closed: closed.clone(),
    };
    (feed, closed)
}

fn fast_config() -> FeedConfig {
    FeedConfig::new("vc-01").with_poll_interval(Duration::from_millis(5))
}

#[tokio::test]
async fn test_feed_pages_are_sorted_by_time() {
    let (feed, _) = scripted(vec![vec![
        feed_event(3, 300, "VmCreatedEvent"),
        feed_event(1, 100, "VmCreatedEvent"),
        feed_event(2, 200, "VmRemovedEvent"),
    ]]);
    let consumer = FeedConsumer::new(feed, fast_config());

    let events: Vec<Envelope> = consumer.consume(&[]).await.unwrap().take(3).collect().await;

    let ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, ["1", "2", "3"]);
    assert_eq!(events[1].event_type, "vm.removed");
    assert_eq!(events[0].data["vm"], "vm-1");
}

#[tokio::test]
async fn test_feed_filters_by_topic() {
    let (feed, _) = scripted(vec![
        vec![feed_event(1, 100, "VmCreatedEvent"), feed_event(2, 200, "VmRemovedEvent")],
        vec![feed_event(3, 300, "VmCreatedEvent")],
    ]);
    let consumer = FeedConsumer::new(feed, fast_config());

    let events: Vec<Envelope> = consumer
        .consume(&["vm.created".to_string()])
        .await
        .unwrap()
        .take(2)
        .collect()
        .await;

    let ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, ["1", "3"]);
}

#[tokio::test]
async fn test_feed_accepts_routing_topic_form() {
    let (feed, _) = scripted(vec![vec![
        feed_event(1, 100, "VmRemovedEvent"),
        feed_event(2, 200, "VmCreatedEvent"),
    ]]);
    let consumer = FeedConsumer::new(feed, fast_config());

    let events: Vec<Envelope> = consumer
        .consume(&["vcenter.vm.created".to_string()])
        .await
        .unwrap()
        .take(1)
        .collect()
        .await;

    assert_eq!(events[0].event_id, "2");
}

#[test]
fn test_wants_topic() {
    let envelope = Envelope::new("vcenter", "vm.created", "vcenter", "vc-01", json!({}));
    assert!(wants_topic(&[], &envelope));
    assert!(wants_topic(&["vm.created".to_string()], &envelope));
    assert!(wants_topic(&["vcenter.vm.created".to_string()], &envelope));
    assert!(!wants_topic(&["vm.removed".to_string()], &envelope));
    assert!(!wants_topic(&["vcenter".to_string()], &envelope));
}

#[tokio::test]
async fn test_feed_close_ends_stream_and_closes_feed() {
    let (feed, feed_closed) = scripted(Vec::new());
    let consumer = FeedConsumer::new(feed, fast_config());
    let mut events = consumer.consume(&[]).await.unwrap();

    consumer.close().await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .expect("stream should end after close");
    assert!(next.is_none());
    assert!(*feed_closed.lock().unwrap());
    assert!(matches!(consumer.consume(&[]).await, Err(DriverError::Closed)));
}

#[tokio::test]
async fn test_driver_over_feed_until_failure() {
    let (feed, _) = scripted(vec![vec![
        feed_event(1, 100, "VmCreatedEvent"),
        feed_event(2, 200, "VmCreatedEvent"),
    ]]);
    let driver = Driver::new(
        FeedConsumer::new(feed, fast_config()),
        RecordingSender::failing_at(1),
    );

    let result = driver.run().await;
    assert!(matches!(result, Err(DriverError::Send { ref event_id, .. }) if event_id == "2"));
}
