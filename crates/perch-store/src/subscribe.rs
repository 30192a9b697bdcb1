//! Live-update fan-out.
//!
//! Every collection (and document) owns a [`SubscriberRegistry`]. Mutations
//! hand the registry a serialized event plus an interval value; the registry
//! enqueues the event onto every subscriber whose `[start, end]` interval
//! contains that value. Each subscriber's queue is drained by exactly one
//! delivery loop — the HTTP response body stream — and a subscriber that
//! cannot keep up is closed rather than allowed to stall the writer.

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::now_millis;

/// Pending events a subscriber may have in flight.
pub const QUEUE_DEPTH: usize = 100;

/// How long a notifier waits on a full queue before giving the subscriber up.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of `: keep-alive` comments on an idle stream.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// One live listener with its interval filter and outbound queue.
#[derive(Debug)]
pub struct Subscriber {
    id: String,
    interval_start: String,
    interval_end: String,
    tx: mpsc::Sender<Bytes>,
    closed: AtomicBool,
}

impl Subscriber {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Inclusive lexicographic interval test used to filter notifications.
    pub fn matches(&self, interval_value: &str) -> bool {
        self.interval_start.as_str() <= interval_value
            && interval_value <= self.interval_end.as_str()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting events. The delivery loop drains whatever is already
    /// queued and then sees the channel close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Queue an event, waiting up to [`ENQUEUE_TIMEOUT`] for room.
    ///
    /// Returns `false` — after closing the subscriber — when it is already
    /// closed, gone, or too slow.
    pub async fn enqueue(&self, event: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.send_timeout(event, ENQUEUE_TIMEOUT).await {
            Ok(()) => true,
            Err(_) => {
                info!(id = %self.id, "subscriber queue stalled or dropped, closing");
                self.close();
                false
            }
        }
    }
}

/// A registered subscriber handed back to the transport.
///
/// Dropping it (the client went away or the stream errored) closes the
/// subscriber and removes it from its registry.
pub struct Subscription {
    pub subscriber: Arc<Subscriber>,
    pub receiver: mpsc::Receiver<Bytes>,
    registry: SubscriberRegistry,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscriber.close();
        self.registry.remove(self.subscriber.id());
    }
}

/// The set of subscribers attached to one collection or document.
#[derive(Clone, Default, Debug)]
pub struct SubscriberRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Subscriber>>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber over `[interval_start, interval_end]`.
    pub fn subscribe(&self, interval_start: String, interval_end: String) -> Subscription {
        let (tx, receiver) = mpsc::channel(QUEUE_DEPTH);
        let subscriber = Arc::new(Subscriber {
            id: Uuid::new_v4().simple().to_string(),
            interval_start,
            interval_end,
            tx,
            closed: AtomicBool::new(false),
        });
        self.inner
            .write()
            .insert(subscriber.id.clone(), subscriber.clone());
        info!(id = %subscriber.id, "subscriber added");
        Subscription {
            subscriber,
            receiver,
            registry: self.clone(),
        }
    }

    pub fn remove(&self, id: &str) {
        if self.inner.write().remove(id).is_some() {
            info!(id = %id, "subscriber removed");
        }
    }

    /// Deliver an update event to every subscriber whose interval contains
    /// `interval_value`.
    ///
    /// Targets are collected under the read lock and enqueued after it is
    /// released, so one slow queue never blocks the registry. Subscribers
    /// whose enqueue fails are dropped.
    pub async fn notify_update(&self, event: Bytes, interval_value: &str) {
        let targets: Vec<Arc<Subscriber>> = self
            .inner
            .read()
            .values()
            .filter(|s| s.matches(interval_value))
            .cloned()
            .collect();
        for subscriber in targets {
            debug!(id = %subscriber.id, interval_value, "notifying subscriber");
            if !subscriber.enqueue(event.clone()).await {
                self.remove(subscriber.id());
            }
        }
    }

    /// Deliver a delete event; same filtering and backpressure as updates.
    pub async fn notify_delete(&self, event: Bytes, interval_value: &str) {
        self.notify_update(event, interval_value).await;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.read().len()
    }
}

/// Frame one event for the wire:
/// `id: <ms-epoch>\nevent: <type>\ndata: <payload>\n\n`.
pub fn event_frame(payload: &Bytes) -> Bytes {
    let event = event_type(payload);
    let data = String::from_utf8_lossy(payload);
    Bytes::from(format!(
        "id: {id}\nevent: {event}\ndata: {data}\n\n",
        id = now_millis()
    ))
}

/// The comment frame that keeps idle connections open.
pub fn keep_alive_frame() -> Bytes {
    Bytes::from_static(b": keep-alive\n\n")
}

/// Event type of a payload: its `action` field when it parses as a JSON
/// object, `message` otherwise.
fn event_type(payload: &Bytes) -> String {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|v| v.get("action").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "message".to_string())
}
