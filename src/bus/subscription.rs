//! Subscription handles and listener stop signals.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::debug;

type CancelHook = Box<dyn FnOnce() + Send>;

/// One active consumption of `(organization, topic)`.
///
/// `unsubscribe` is idempotent: the first call fires the done-signal and the
/// backend's cleanup hook, later calls do nothing. Dropping the handle
/// unsubscribes. The listener finishes its in-flight handler call before it
/// observes the signal.
pub struct Subscription {
    topic: String,
    organization: String,
    cancelled: AtomicBool,
    done: watch::Sender<bool>,
    on_cancel: Mutex<Option<CancelHook>>,
}

impl Subscription {
    /// Create a handle and the signal its listener waits on.
    ///
    /// `transport_stop` is the owning transport's close signal.
    pub(crate) fn new(
        topic: &str,
        organization: &str,
        transport_stop: watch::Receiver<bool>,
    ) -> (Self, StopSignal) {
        let (done, done_rx) = watch::channel(false);
        let subscription = Self {
            topic: topic.to_string(),
            organization: organization.to_string(),
            cancelled: AtomicBool::new(false),
            done,
            on_cancel: Mutex::new(None),
        };
        let signal = StopSignal {
            subscription: done_rx,
            transport: transport_stop,
        };
        (subscription, signal)
    }

    /// Register backend cleanup to run on the first `unsubscribe`.
    pub(crate) fn on_cancel(self, hook: impl FnOnce() + Send + 'static) -> Self {
        if let Ok(mut slot) = self.on_cancel.lock() {
            *slot = Some(Box::new(hook));
        }
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// Whether `unsubscribe` has not been called yet.
    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
    }

    /// Stop the listener. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let hook = self.on_cancel.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook();
        }

        self.done.send_replace(true);
        debug!(
            topic = %self.topic,
            organization = %self.organization,
            "Unsubscribed"
        );
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("organization", &self.organization)
            .field("active", &self.is_active())
            .finish()
    }
}

/// What a listener waits on: its own subscription or the whole transport.
#[derive(Clone)]
pub struct StopSignal {
    subscription: watch::Receiver<bool>,
    transport: watch::Receiver<bool>,
}

impl StopSignal {
    /// Resolves once either signal fires (or its sender is gone).
    pub async fn stopped(&mut self) {
        tokio::select! {
            _ = self.subscription.wait_for(|done| *done) => {}
            _ = self.transport.wait_for(|done| *done) => {}
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.subscription.borrow() || *self.transport.borrow()
    }
}

/// Close signal owned by a transport.
pub(crate) fn transport_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
