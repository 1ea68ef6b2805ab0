//! Listener registries with independent, idempotent unsubscribe handles.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use crate::types::{Error, ErrorCallback, Operation};

type Cancel = Box<dyn FnOnce() + Send>;

/// Runs its cancel action at most once, on [`OnceCancel::cancel`] or on drop.
pub(crate) struct OnceCancel {
    cancel: Mutex<Option<Cancel>>,
}

impl OnceCancel {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub(crate) fn cancel(&self) {
        let cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl Drop for OnceCancel {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run a user listener, reporting a panic as [`Error::ListenerPanicked`]
/// instead of unwinding into the caller.
pub(crate) fn run_listener(
    name: &'static str,
    on_error: Option<&ErrorCallback>,
    f: impl FnOnce(),
) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        let error = Error::ListenerPanicked(name);
        match on_error {
            Some(on_error) => on_error(&error, Operation::Listener),
            None => tracing::warn!("{error}"),
        }
    }
}

/// Handle to a registered listener.
///
/// Dropping the handle removes the listener, as does [`unsubscribe`](ListenerHandle::unsubscribe).
#[must_use = "dropping the handle removes the listener"]
pub struct ListenerHandle {
    cancel: OnceCancel,
}

impl ListenerHandle {
    /// Remove the listener. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }
}

struct Registry<F: ?Sized> {
    next_id: u64,
    listeners: BTreeMap<u64, Arc<F>>,
}

/// Listeners notified in registration order.
pub(crate) struct ListenerSet<F: ?Sized> {
    registry: Arc<Mutex<Registry<F>>>,
}

impl<F: ?Sized> Clone for ListenerSet<F> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<F: ?Sized> Default for ListenerSet<F> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> ListenerSet<F> {
    pub(crate) fn add(&self, listener: Arc<F>) -> ListenerHandle {
        let id = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(id, listener);
            id
        };
        let weak = Arc::downgrade(&self.registry);
        ListenerHandle {
            cancel: OnceCancel::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .listeners
                        .remove(&id);
                }
            }),
        }
    }

    /// Current listeners, cloned out so they can be invoked without holding the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .values()
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }
}
