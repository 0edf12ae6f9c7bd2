//! Log distribution hub.
//!
//! Pipeline code emits progress messages tagged with a request ID; live
//! observers subscribe with an optional request ID filter and receive only
//! the matching events, in emission order. There is no replay buffer: an
//! observer only sees what is emitted while it is attached.

mod reporter;

pub use reporter::RunReporter;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A single progress message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub message: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Messages delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubMessage {
    /// First message of every subscription.
    Connected {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// A progress log line.
    Log {
        log: String,
        request_id: String,
        timestamp: DateTime<Utc>,
    },
    /// The run for `request_id` has finished.
    Complete {
        message: String,
        request_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl HubMessage {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

impl From<LogEvent> for HubMessage {
    fn from(event: LogEvent) -> Self {
        Self::Log {
            log: event.message,
            request_id: event.request_id,
            timestamp: event.timestamp,
        }
    }
}

/// Opaque subscriber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(u64);

#[derive(Debug)]
struct SubscriberEntry {
    filter: Option<String>,
    tx: mpsc::UnboundedSender<HubMessage>,
}

impl SubscriberEntry {
    fn accepts(&self, request_id: &str) -> bool {
        self.filter.as_deref().is_none_or(|f| f == request_id)
    }
}

#[derive(Debug, Default)]
struct HubInner {
    subscribers: DashMap<SubscriberHandle, SubscriberEntry>,
    next_id: AtomicU64,
}

/// Publish/subscribe hub for progress events.
///
/// Cheap to clone; all clones share the same subscriber set. Each subscriber
/// owns an unbounded queue, so emitting never waits on a slow observer.
#[derive(Debug, Clone, Default)]
pub struct LogHub {
    inner: Arc<HubInner>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message for `request_id` to every matching subscriber.
    ///
    /// Returns the number of subscribers the event was delivered to.
    pub fn emit(&self, message: impl Into<String>, request_id: &str) -> usize {
        let event = LogEvent {
            message: message.into(),
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
        };
        info!(request_id, "{}", event.message);
        self.publish(request_id, HubMessage::from(event))
    }

    /// Publish the terminal completion notice for `request_id`.
    pub fn complete(&self, request_id: &str, message: impl Into<String>) -> usize {
        let message = message.into();
        info!(request_id, "Run complete: {}", message);
        self.publish(
            request_id,
            HubMessage::Complete {
                message,
                request_id: request_id.to_string(),
                timestamp: Utc::now(),
            },
        )
    }

    fn publish(&self, request_id: &str, message: HubMessage) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();

        for entry in self.inner.subscribers.iter() {
            if !entry.accepts(request_id) {
                continue;
            }
            if entry.tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(*entry.key());
            }
        }

        // Iteration guards are released before removing.
        for handle in gone {
            self.unsubscribe(handle);
        }
        delivered
    }

    /// Attach a new subscriber.
    ///
    /// The returned subscription yields a [`HubMessage::Connected`] notice
    /// first, then every matching event emitted from now on.
    pub fn subscribe(&self, request_id_filter: Option<String>) -> Subscription {
        let handle = SubscriberHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let notice = match &request_id_filter {
            Some(id) => format!("Connected to logs for request {}", id),
            None => "Connected to all logs".to_string(),
        };
        // The receiver is alive here, so the notice is always queued first.
        let _ = tx.send(HubMessage::Connected {
            message: notice,
            timestamp: Utc::now(),
        });

        debug!(subscriber = handle.0, filter = ?request_id_filter, "Subscriber attached");
        self.inner.subscribers.insert(
            handle,
            SubscriberEntry {
                filter: request_id_filter,
                tx,
            },
        );

        Subscription {
            handle,
            rx,
            hub: self.clone(),
        }
    }

    /// Detach a subscriber. Unknown or already removed handles are a no-op.
    ///
    /// Returns whether a subscriber was actually removed.
    pub fn unsubscribe(&self, handle: SubscriberHandle) -> bool {
        let removed = self.inner.subscribers.remove(&handle).is_some();
        if removed {
            debug!(subscriber = handle.0, "Subscriber detached");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

/// A live subscription. Detaches from the hub when dropped.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriberHandle,
    rx: mpsc::UnboundedReceiver<HubMessage>,
    hub: LogHub,
}

impl Subscription {
    pub fn handle(&self) -> SubscriberHandle {
        self.handle
    }

    /// Wait for the next message. Returns `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.rx.recv().await
    }

    /// Take the next message if one is queued.
    pub fn try_recv(&mut self) -> Option<HubMessage> {
        self.rx.try_recv().ok()
    }

    /// Detach explicitly; dropping the subscription afterwards is harmless.
    pub fn unsubscribe(&self) -> bool {
        self.hub.unsubscribe(self.handle)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.handle);
    }
}
