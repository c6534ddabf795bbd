//! Synchronous event delivery.
//!
//! Subscribers run inline, before the originating kernel call returns.
//! There is no queue; subscribers must not block on I/O.

use std::sync::RwLock;
use tracing::debug;

use anchor_types::event::KernelEvent;

/// A registered event subscriber.
pub type Subscriber = Box<dyn Fn(&KernelEvent) + Send + Sync>;

/// Subscriber registry with synchronous fan-out.
#[derive(Default)]
pub struct EventSink {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Subscribers live for the sink's lifetime.
    pub fn subscribe(&self, subscriber: Subscriber) {
        if let Ok(mut subs) = self.subscribers.write() {
            subs.push(subscriber);
        }
    }

    /// Deliver an event to every subscriber, in registration order.
    pub fn emit(&self, event: &KernelEvent) {
        debug!(event = event.name(), "emitting kernel event");
        if let Ok(subs) = self.subscribers.read() {
            for subscriber in subs.iter() {
                subscriber(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn test_emit_is_synchronous() {
        let sink = EventSink::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sink.subscribe(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let c = count.clone();
        sink.subscribe(Box::new(move |_| {
            c.fetch_add(10, Ordering::SeqCst);
        }));

        sink.emit(&KernelEvent::MemoryDeleted { id: Uuid::new_v4() });
        // Both subscribers ran before emit returned.
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_event_names() {
        let e = KernelEvent::IdentityProposed {
            change_id: Uuid::new_v4(),
        };
        assert_eq!(e.name(), "identity.proposed");
    }
}
