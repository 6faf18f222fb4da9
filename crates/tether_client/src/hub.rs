//! Notification fan-out for one space.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_core::{Notification, NotificationKind, SubscriptionId};

/// A registered notification handler.
pub type NotificationHandler = dyn Fn(&Notification) + Send + Sync;

/// Dispatch table keyed by notification kind.
///
/// Handlers are invoked on the emitting thread after the table lock is
/// released, so a handler may subscribe or unsubscribe without
/// deadlocking.
#[derive(Default)]
pub struct NotificationHub {
    next_id: AtomicU64,
    by_kind: RwLock<BTreeMap<NotificationKind, Vec<(SubscriptionId, Arc<NotificationHandler>)>>>,
    any: RwLock<Vec<(SubscriptionId, Arc<NotificationHandler>)>>,
}

impl NotificationHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one notification kind.
    pub fn subscribe(
        &self,
        kind: NotificationKind,
        handler: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.allocate();
        self.by_kind
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Registers a handler for every notification.
    pub fn subscribe_any(
        &self,
        handler: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.allocate();
        self.any.write().push((id, Arc::new(handler)));
        id
    }

    /// Removes a subscription. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut found = false;
        {
            let mut by_kind = self.by_kind.write();
            for handlers in by_kind.values_mut() {
                let before = handlers.len();
                handlers.retain(|(sub, _)| *sub != id);
                found |= handlers.len() != before;
            }
        }
        if !found {
            let mut any = self.any.write();
            let before = any.len();
            any.retain(|(sub, _)| *sub != id);
            found = any.len() != before;
        }
        found
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let kinds: usize = self.by_kind.read().values().map(Vec::len).sum();
        kinds + self.any.read().len()
    }

    /// Dispatches one notification.
    pub fn emit(&self, notification: &Notification) {
        let mut handlers: Vec<Arc<NotificationHandler>> = Vec::new();
        {
            let by_kind = self.by_kind.read();
            if let Some(subscribed) = by_kind.get(&notification.kind()) {
                handlers.extend(subscribed.iter().map(|(_, h)| h.clone()));
            }
        }
        {
            let any = self.any.read();
            handlers.extend(any.iter().map(|(_, h)| h.clone()));
        }
        for handler in handlers {
            handler(notification);
        }
    }

    /// Dispatches a batch in order.
    pub fn emit_all(&self, batch: &[Notification]) {
        for notification in batch {
            self.emit(notification);
        }
    }

    fn allocate(&self) -> SubscriptionId {
        SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tether_core::ObjectId;
    use tether_proto::ChangeSource;

    fn created(id: &str) -> Notification {
        Notification::ObjectCreated {
            id: ObjectId::parse(id).unwrap(),
            source: ChangeSource::LocalUser,
        }
    }

    fn deleted(id: &str) -> Notification {
        Notification::ObjectDeleted {
            id: ObjectId::parse(id).unwrap(),
            source: ChangeSource::LocalUser,
        }
    }

    #[test]
    fn kind_filtering() {
        let hub = NotificationHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        hub.subscribe(NotificationKind::ObjectCreated, move |n| {
            sink.lock().push(n.kind());
        });

        hub.emit(&created("a"));
        hub.emit(&deleted("a"));

        assert_eq!(seen.lock().as_slice(), &[NotificationKind::ObjectCreated]);
    }

    #[test]
    fn any_receives_everything() {
        let hub = NotificationHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        hub.subscribe_any(move |n| sink.lock().push(n.kind()));

        hub.emit_all(&[created("a"), deleted("a")]);
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = NotificationHub::new();
        let seen = Arc::new(Mutex::new(0usize));

        let sink = seen.clone();
        let id = hub.subscribe(NotificationKind::ObjectCreated, move |_| {
            *sink.lock() += 1;
        });

        hub.emit(&created("a"));
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(&created("b"));

        assert_eq!(*seen.lock(), 1);
        assert_eq!(hub.subscription_count(), 0);
    }

    #[test]
    fn handler_may_resubscribe_during_emit() {
        let hub = Arc::new(NotificationHub::new());
        let inner = hub.clone();
        hub.subscribe_any(move |_| {
            // Must not deadlock against the dispatch locks.
            let id = inner.subscribe(NotificationKind::ObjectDeleted, |_| {});
            inner.unsubscribe(id);
        });
        hub.emit(&created("a"));
    }
}
