//! Listener sets with drop-to-unsubscribe handles.
//!
//! Listeners are invoked synchronously by [`ListenerSet::emit`], outside the
//! internal lock, so a listener may subscribe or unsubscribe re-entrantly.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Slots<E> {
    next_id: u64,
    entries: Vec<(u64, Listener<E>)>,
}

/// A set of callbacks observing events of type `E`.
pub struct ListenerSet<E> {
    slots: Arc<Mutex<Slots<E>>>,
}

impl<E: 'static> ListenerSet<E> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or the set is cleared.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut slots = lock(&self.slots);
            let id = slots.next_id;
            slots.next_id += 1;
            slots.entries.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Slots<E>>> = Arc::downgrade(&self.slots);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    lock(&slots).entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Invoke every registered listener with `event`.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = lock(&self.slots)
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        lock(&self.slots).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every listener. Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        lock(&self.slots).entries.clear();
    }
}

impl<E: 'static> Default for ListenerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<E>(slots: &Mutex<Slots<E>>) -> MutexGuard<'_, Slots<E>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by [`ListenerSet::subscribe`]; unsubscribes on drop.
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribe now. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_all_listeners() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = set.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _b = set.subscribe(move |v| {
            t2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        set.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let set: ListenerSet<()> = ListenerSet::new();
        let sub = set.subscribe(|_| {});
        assert_eq!(set.len(), 1);
        drop(sub);
        assert!(set.is_empty());
    }

    #[test]
    fn test_subscription_outlives_set() {
        let set: ListenerSet<()> = ListenerSet::new();
        let sub = set.subscribe(|_| {});
        drop(set);
        sub.unsubscribe(); // must not panic
    }

    #[test]
    fn test_listener_can_resubscribe_during_emit() {
        let set: Arc<ListenerSet<()>> = Arc::new(ListenerSet::new());
        let inner = set.clone();
        let held = Arc::new(Mutex::new(Vec::new()));
        let held_clone = held.clone();
        let _sub = set.subscribe(move |_| {
            let sub = inner.subscribe(|_| {});
            held_clone.lock().unwrap().push(sub);
        });

        set.emit(&());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_clear_drops_listeners() {
        let set: ListenerSet<()> = ListenerSet::new();
        let _a = set.subscribe(|_| {});
        let _b = set.subscribe(|_| {});
        set.clear();
        assert!(set.is_empty());
    }
}
