//! Connection registry: the authoritative set of open connections.

use super::connection::{identity, SharedConnection};
use super::lock;
use std::sync::{Arc, Mutex, Weak};

/// Open connections in acceptance order. Cloning shares the same set.
///
/// A connection appears at most once and leaves the set as soon as its close
/// notification fires or `close_all` runs.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Vec<SharedConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `connection` and subscribe to its close notification so it removes itself.
    /// Returns false (and does nothing) when it is already tracked.
    pub fn track(&self, connection: SharedConnection) -> bool {
        let key = identity(&connection);
        {
            let mut g = lock(&self.inner);
            if g.iter().any(|c| identity(c) == key) {
                return false;
            }
            g.push(connection.clone());
        }
        // Subscribed outside the lock: an already-closed connection fires right away.
        let set: Weak<Mutex<Vec<SharedConnection>>> = Arc::downgrade(&self.inner);
        connection.on_close(Box::new(move || {
            if let Some(set) = set.upgrade() {
                remove(&set, key);
            }
        }));
        log::debug!("tracking {}", connection.label());
        true
    }

    /// Remove the connection if present. Returns false when it was not tracked.
    pub fn untrack(&self, connection: &SharedConnection) -> bool {
        remove(&self.inner, identity(connection))
    }

    /// Snapshot of the tracked connections, in acceptance order.
    pub fn all(&self) -> Vec<SharedConnection> {
        lock(&self.inner).clone()
    }

    /// Close every tracked connection in acceptance order and leave the set empty.
    /// Returns how many were closed; a second call closes nothing.
    pub fn close_all(&self) -> usize {
        let drained = std::mem::take(&mut *lock(&self.inner));
        for connection in &drained {
            if let Err(e) = connection.close() {
                log::debug!("closing {}: {}", connection.label(), e);
            }
        }
        drained.len()
    }

    /// Handle that does not keep the set alive; for callbacks stored on tracked connections.
    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

/// Non-owning counterpart of `ConnectionRegistry`.
#[derive(Clone)]
pub struct WeakRegistry {
    inner: Weak<Mutex<Vec<SharedConnection>>>,
}

impl WeakRegistry {
    /// `None` once every `ConnectionRegistry` clone is gone.
    pub fn upgrade(&self) -> Option<ConnectionRegistry> {
        self.inner.upgrade().map(|inner| ConnectionRegistry { inner })
    }
}

fn remove(set: &Mutex<Vec<SharedConnection>>, key: usize) -> bool {
    let mut g = lock(set);
    match g.iter().position(|c| identity(c) == key) {
        Some(i) => {
            g.remove(i);
            true
        }
        None => false,
    }
}
