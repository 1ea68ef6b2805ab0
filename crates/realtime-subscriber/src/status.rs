//! Connection status store: status, connection id and last error, with
//! de-duplicated change notifications.

use std::sync::{Arc, Mutex};

use crate::listeners::{ListenerHandle, ListenerSet, run_listener};
use crate::types::{ConnectionStatus, Error, ErrorCallback};

type StatusListener = dyn Fn(ConnectionStatus) + Send + Sync;

#[derive(Default)]
struct StoreState {
    status: ConnectionStatus,
    connection_id: Option<String>,
    error: Option<Arc<Error>>,
}

/// Shared, cloneable view of the connection state.
///
/// Listeners run synchronously inside the call that changed the status, after
/// the store's lock has been released, so they may read the store freely.
/// A panicking listener does not stop the others.
#[derive(Clone, Default)]
pub struct StatusStore {
    state: Arc<Mutex<StoreState>>,
    listeners: ListenerSet<StatusListener>,
    on_error: Option<ErrorCallback>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that reports panicking listeners to `on_error`.
    pub fn with_error_callback(on_error: ErrorCallback) -> Self {
        Self {
            on_error: Some(on_error),
            ..Self::default()
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    /// Update the status, notifying listeners only if the value changed.
    pub fn set_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut self.lock().status, status);
        if previous != status {
            tracing::debug!(from = %previous, to = %status, "Connection status changed");
            self.notify(status);
        }
    }

    pub fn connection_id(&self) -> Option<String> {
        self.lock().connection_id.clone()
    }

    pub fn set_connection_id(&self, connection_id: Option<String>) {
        self.lock().connection_id = connection_id;
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.lock().error.clone()
    }

    pub fn set_error(&self, error: Option<Arc<Error>>) {
        self.lock().error = error;
    }

    /// Return status, connection id and error to their initial values.
    pub fn reset(&self) {
        let previous = std::mem::take(&mut *self.lock()).status;
        if previous != ConnectionStatus::default() {
            self.notify(ConnectionStatus::default());
        }
    }

    /// Register a listener invoked on every status change.
    pub fn on_status_change(
        &self,
        listener: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listeners.add(Arc::new(listener))
    }

    fn notify(&self, status: ConnectionStatus) {
        for listener in self.listeners.snapshot() {
            run_listener("status", self.on_error.as_ref(), || listener(status));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
