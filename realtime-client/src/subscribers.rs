// realtime-client/src/subscribers.rs
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use common::{EventKind, InboundEvent};

pub type Callback = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// A registered callback and the handle that identifies it
#[derive(Clone)]
pub struct Subscriber {
    pub id: Uuid,
    callback: Callback,
}

impl Subscriber {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            callback: Arc::new(callback),
        }
    }

    pub fn notify(&self, event: &InboundEvent) {
        (self.callback)(event)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

/// Subscribers per event kind, in registration order
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    by_kind: HashMap<EventKind, Vec<Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if this handle was already registered for `kind`
    pub fn register(&mut self, kind: EventKind, subscriber: Subscriber) -> bool {
        let list = self.by_kind.entry(kind).or_default();
        if list.iter().any(|existing| existing.id == subscriber.id) {
            return false;
        }
        list.push(subscriber);
        true
    }

    /// Unknown handles are a no-op
    pub fn unregister(&mut self, kind: EventKind, id: Uuid) -> bool {
        let Some(list) = self.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|subscriber| subscriber.id != id);
        before != list.len()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.by_kind.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Hand the event to every subscriber of its kind; returns how many ran
    pub fn dispatch(&self, event: &InboundEvent) -> usize {
        let Some(list) = self.by_kind.get(&event.kind) else {
            return 0;
        };
        for subscriber in list {
            subscriber.notify(event);
        }
        list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    fn event(kind: &str) -> InboundEvent {
        InboundEvent::from_frame(json!({ "type": kind, "issue_id": 1 }), Utc::now())
    }

    #[test]
    fn test_dispatch_follows_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriberRegistry::new();
        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            registry.register(
                EventKind::NewMessage,
                Subscriber::new(move |_| seen.lock().unwrap().push(label)),
            );
        }

        assert_eq!(registry.dispatch(&event("new_message")), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_register_and_unregister_are_idempotent() {
        let mut registry = SubscriberRegistry::new();
        let subscriber = Subscriber::new(|_| {});
        let id = subscriber.id;

        assert!(registry.register(EventKind::Generic, subscriber.clone()));
        assert!(!registry.register(EventKind::Generic, subscriber.clone()));
        assert_eq!(registry.count(EventKind::Generic), 1);

        // Same handle, different kind, is a separate registration
        assert!(registry.register(EventKind::StatusNotification, subscriber));

        assert!(registry.unregister(EventKind::Generic, id));
        assert!(!registry.unregister(EventKind::Generic, id));
        assert!(!registry.unregister(EventKind::NewMessage, Uuid::new_v4()));
        assert_eq!(registry.count(EventKind::StatusNotification), 1);
    }

    #[test]
    fn test_other_kinds_are_not_notified() {
        let hits = Arc::new(Mutex::new(0));
        let mut registry = SubscriberRegistry::new();
        let counter = hits.clone();
        registry.register(
            EventKind::StatusNotification,
            Subscriber::new(move |_| *counter.lock().unwrap() += 1),
        );

        assert_eq!(registry.dispatch(&event("new_message")), 0);
        assert_eq!(*hits.lock().unwrap(), 0);
    }
}
