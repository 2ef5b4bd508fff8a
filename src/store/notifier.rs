use crate::store::element::ElementId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEventKind {
    Created,
    Updated,
    Removed,
}

/// Something changed on `element`, a child of `parent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    pub element: ElementId,
    pub parent: Option<ElementId>,
    pub kind: DomainEventKind,
}

impl DomainEvent {
    /// Whether a listener registered on `target` cares about this event.
    pub fn concerns(&self, target: &ElementId) -> bool {
        &self.element == target || self.parent.as_ref() == Some(target)
    }
}

struct Listener {
    target: ElementId,
    tx: mpsc::UnboundedSender<DomainEvent>,
}

/// Fan-out of domain events to listeners registered per element.
#[derive(Default)]
pub struct DomainNotifier {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
    disabled: AtomicBool,
}

impl DomainNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, target: ElementId) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Listener { target, tx });
        Subscription {
            id,
            rx,
            notifier: Arc::downgrade(self),
        }
    }

    pub fn notify(&self, event: DomainEvent) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.values() {
            if event.concerns(&listener.target) {
                let _ = listener.tx.send(event.clone());
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::Relaxed);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn unregister(&self, id: u64) {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }
}

/// Registered listener. Unregisters itself when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<DomainEvent>,
    notifier: Weak<DomainNotifier>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        self.rx.try_recv().ok()
    }

    /// Discards queued events, returning how many there were.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.unregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_see_own_element_and_children_only() {
        let notifier = DomainNotifier::new();
        let mut sub = notifier.subscribe(ElementId::from("s.1"));
        notifier.notify(DomainEvent {
            element: ElementId::from("s.2"),
            parent: Some(ElementId::from("s.1")),
            kind: DomainEventKind::Created,
        });
        notifier.notify(DomainEvent {
            element: ElementId::from("s.9"),
            parent: Some(ElementId::from("s.8")),
            kind: DomainEventKind::Created,
        });
        assert_eq!(sub.drain(), 1);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let notifier = DomainNotifier::new();
        let sub = notifier.subscribe(ElementId::from("s.1"));
        assert_eq!(notifier.listener_count(), 1);
        drop(sub);
        assert_eq!(notifier.listener_count(), 0);
    }
}
