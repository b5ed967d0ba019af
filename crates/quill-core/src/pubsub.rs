//! Typed in-process event bus.
//!
//! One [`Broker`] per payload kind. Stores publish after committing, so the
//! bus is the only ordering point between mutators and observers. Delivery
//! uses a bounded buffer per subscriber; a subscriber that falls behind is
//! dropped rather than ever blocking a publisher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::logging::LogRecord;
use crate::message::Message;
use crate::permission::{PermissionReply, PermissionRequest};
use crate::storage::{FileSnapshot, Session};

/// Per-subscriber buffer size. A consumer more than this many events behind
/// is considered slow and loses its subscription.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct Event<T> {
    pub event_type: EventType,
    pub payload: T,
}

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<Event<T>>,
    lagged: Arc<AtomicBool>,
}

/// Fan-out broker for a single payload kind.
pub struct Broker<T> {
    subscribers: Arc<Mutex<Vec<Subscriber<T>>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Broker<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe for the lifetime of `scope`. Cancelling the scope removes
    /// the subscriber and releases its buffer.
    pub fn subscribe(&self, scope: CancellationToken) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lagged = Arc::new(AtomicBool::new(false));

        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(Subscriber {
                id,
                tx,
                lagged: lagged.clone(),
            });

        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            scope.cancelled().await;
            subscribers
                .lock()
                .expect("subscriber lock poisoned")
                .retain(|s| s.id != id);
        });

        Subscription { rx, lagged }
    }

    /// Deliver to every live subscriber in publish order. The subscriber
    /// list is copied out so no lock is held during delivery.
    pub fn publish(&self, event_type: EventType, payload: T) {
        let targets: Vec<(u64, mpsc::Sender<Event<T>>, Arc<AtomicBool>)> = {
            let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
            subscribers
                .iter()
                .map(|s| (s.id, s.tx.clone(), s.lagged.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx, lagged) in targets {
            match tx.try_send(Event {
                event_type,
                payload: payload.clone(),
            }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    lagged.store(true, Ordering::Relaxed);
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        if !dead.is_empty() {
            self.subscribers
                .lock()
                .expect("subscriber lock poisoned")
                .retain(|s| !dead.contains(&s.id));
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

/// Receiving side of a subscription. The stream closes after the scope is
/// cancelled or, for a slow consumer, once the buffered suffix is drained.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Event<T>>,
    lagged: Arc<AtomicBool>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event<T>> {
        self.rx.try_recv().ok()
    }

    /// True when the subscription was terminated for falling behind.
    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Relaxed)
    }
}

/// All brokers the process publishes on, one per payload kind. Shared as
/// `Arc`s so stores and brokers can hold their topic directly.
#[derive(Default)]
pub struct EventBus {
    pub messages: Arc<Broker<Message>>,
    pub sessions: Arc<Broker<Session>>,
    pub files: Arc<Broker<FileSnapshot>>,
    pub logs: Arc<Broker<LogRecord>>,
    pub permission_requests: Arc<Broker<PermissionRequest>>,
    pub permission_replies: Arc<Broker<PermissionReply>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_in_publish_order() {
        let broker: Broker<u32> = Broker::new();
        let scope = CancellationToken::new();
        let mut sub = broker.subscribe(scope.clone());

        for i in 0..10 {
            broker.publish(EventType::Created, i);
        }

        for i in 0..10 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.payload, i);
            assert_eq!(event.event_type, EventType::Created);
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped_not_blocking() {
        let broker: Broker<u32> = Broker::new();
        let scope = CancellationToken::new();
        let mut sub = broker.subscribe(scope.clone());

        // Overflow the bounded buffer without draining.
        for i in 0..200 {
            broker.publish(EventType::Created, i);
        }
        assert_eq!(broker.subscriber_count(), 0);

        // The received sequence is a contiguous prefix, then the stream ends.
        let mut last = None;
        while let Some(event) = sub.recv().await {
            if let Some(prev) = last {
                assert_eq!(event.payload, prev + 1);
            }
            last = Some(event.payload);
        }
        assert!(sub.is_lagged());
    }

    #[tokio::test]
    async fn cancellation_removes_subscriber() {
        let broker: Broker<u32> = Broker::new();
        let scope = CancellationToken::new();
        let _sub = broker.subscribe(scope.clone());
        assert_eq!(broker.subscriber_count(), 1);

        scope.cancel();
        // The watcher task runs on the same runtime; yield until it fires.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if broker.subscriber_count() == 0 {
                return;
            }
        }
        panic!("subscriber not removed after cancellation");
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_events() {
        let broker: Broker<u32> = Broker::new();
        broker.publish(EventType::Created, 1);

        let scope = CancellationToken::new();
        let mut sub = broker.subscribe(scope);
        broker.publish(EventType::Updated, 2);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload, 2);
        assert_eq!(event.event_type, EventType::Updated);
    }
}
