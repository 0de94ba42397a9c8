/// Listener registries for change, revertible, roster and container events
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Listener<E> = Arc<Mutex<dyn FnMut(&E) + Send>>;

struct Registry<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// Fan-out of events of type `E` to registered callbacks.
///
/// Listeners are invoked outside the registry lock, so a callback may
/// subscribe or drop subscriptions on the same emitter.
pub struct EventEmitter<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&E) + Send + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .listeners
                .push((id, Arc::new(Mutex::new(listener)) as Listener<E>));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.lock().listeners.retain(|(lid, _)| *lid != id);
            }
        })
    }

    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .registry
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            let mut callback = listener.lock();
            (*callback)(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().listeners.len()
    }
}

impl<E: 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a listener registered. Dropping it (or calling `unsubscribe`)
/// removes the listener.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}
