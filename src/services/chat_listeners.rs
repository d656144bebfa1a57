//! Presentation-layer listeners.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::chat_types::CacheEvent;

pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Listeners are invoked outside the registry lock, so a callback may
/// unsubscribe itself.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push((id, Arc::new(listener)));
        Unsubscribe {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn emit(&self, event: &CacheEvent) {
        let listeners: Vec<Listener> = lock(&self.inner)
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.inner).listeners.clear();
    }
}

/// Handle returned by `subscribe`. Dropping it leaves the listener in place.
#[must_use = "keep the handle to unsubscribe later"]
pub struct Unsubscribe {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.registry.upgrade() {
            lock(&inner).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock(inner: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}
