//! Per-client subscription table with lossy non-blocking broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pcas_types::{BusError, Event, Result};

/// Bounded queue capacity per subscriber.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

/// The subscriber table.
///
/// Broadcast iterates under a read lock and uses non-blocking sends: a full
/// queue drops the event for that subscriber only, so slow subscribers never
/// block fast ones and never block the publisher.
#[derive(Default, Debug)]
pub struct SubscriberTable {
    inner: RwLock<HashMap<String, mpsc::Sender<Event>>>,
}

impl SubscriberTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and return its subscription guard.
    ///
    /// Rejects empty client identifiers and duplicates. Dropping the
    /// returned [`Subscription`] removes the entry and closes the queue, so
    /// cleanup happens on every exit path.
    pub fn subscribe(self: &Arc<Self>, client_id: &str) -> Result<Subscription> {
        if client_id.is_empty() {
            return Err(BusError::InvalidArgument(
                "client_id cannot be empty".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        {
            let mut subscribers = self.inner.write();
            if subscribers.contains_key(client_id) {
                return Err(BusError::AlreadyExists(format!(
                    "client {client_id} is already subscribed"
                )));
            }
            subscribers.insert(client_id.to_string(), tx);
        }

        debug!(client_id, "Client subscribed");
        Ok(Subscription {
            table: Arc::clone(self),
            client_id: client_id.to_string(),
            receiver: rx,
        })
    }

    fn unsubscribe(&self, client_id: &str) {
        if self.inner.write().remove(client_id).is_some() {
            debug!(client_id, "Client unsubscribed");
        }
    }

    /// Send an event to every subscriber without blocking.
    ///
    /// Returns the number of subscribers the event was delivered to.
    pub fn broadcast(&self, event: &Event) -> usize {
        let subscribers = self.inner.read();
        debug!(
            event_id = %event.id,
            subscribers = subscribers.len(),
            "Broadcasting event"
        );

        let mut delivered = 0;
        for (client_id, queue) in subscribers.iter() {
            match queue.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client_id = %client_id, event_id = %event.id,
                        "Subscriber queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Guard drop removes the entry; nothing to do here.
                    debug!(client_id = %client_id, "Subscriber queue closed");
                }
            }
        }
        delivered
    }

    /// Number of active subscribers.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when no subscriber is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// An active subscription.
///
/// Holds the receiving end of the client's bounded queue; dropping it
/// deregisters the client and lets the identifier be reused.
#[derive(Debug)]
pub struct Subscription {
    table: Arc<SubscriberTable>,
    client_id: String,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    /// The subscribed client identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Receive the next event; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, used by drain loops and tests.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.table.unsubscribe(&self.client_id);
    }
}
