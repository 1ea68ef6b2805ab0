//! Reference-counted, batched subscription table.
//!
//! Logical subscriptions are keyed by `(channel, params)`. The first handle for
//! a key queues a network subscribe; the last handle to go queues an
//! unsubscribe. Queued changes are flushed on the next scheduler tick, after
//! keys that were both added and removed in the meantime cancel out, so churn
//! within one tick never reaches the network.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::runtime::Handle;

use crate::handler::{Direction, Handler, SessionRefresher};
use crate::listeners::OnceCancel;
use crate::protocol::default_subscription_key;
use crate::types::{
    ActiveSubscription, BoxError, Error, ErrorCallback, MessageCallback, Operation,
    SubscriptionMessage,
};

/// Derives the subscription key for `(channel, params)`.
pub type KeyFn<P> = Arc<dyn Fn(&str, &P) -> Result<String, Error> + Send + Sync>;

/// Invoked with the new number of active subscriptions whenever an entry is
/// created or destroyed.
pub type CountChangeCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Bounds required of subscription params.
pub trait SubscriptionParams: Serialize + Clone + Send + Sync + 'static {}

impl<T: Serialize + Clone + Send + Sync + 'static> SubscriptionParams for T {}

/// Arguments to a subscribe call.
pub struct SubscribeRequest<P> {
    pub channel: String,
    pub params: P,
    pub callback: Option<MessageCallback>,
}

impl<P> SubscribeRequest<P> {
    pub fn new(channel: impl Into<String>, params: P) -> Self {
        Self {
            channel: channel.into(),
            params,
            callback: None,
        }
    }

    /// Route messages for this subscription to `callback`.
    pub fn on_message(
        mut self,
        callback: impl Fn(&SubscriptionMessage) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }
}

/// Handle to one logical subscription.
///
/// Dropping the handle unsubscribes, as does [`unsubscribe`](SubscriptionHandle::unsubscribe).
#[must_use = "dropping the handle unsubscribes"]
pub struct SubscriptionHandle {
    key: String,
    cancel: OnceCancel,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release this handle's share of the subscription. Calling this more than
    /// once is a no-op.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }
}

/// Construction parameters for a [`SubscriptionManager`].
pub struct ManagerConfig<P> {
    pub handler: Handler<P>,
    pub session_refresher: Option<Arc<dyn SessionRefresher>>,
    pub key_fn: KeyFn<P>,
    pub on_error: ErrorCallback,
    pub on_count_change: Option<CountChangeCallback>,
}

impl<P: SubscriptionParams> ManagerConfig<P> {
    pub fn new(handler: Handler<P>) -> Self {
        Self {
            handler,
            session_refresher: None,
            key_fn: default_key_fn(),
            on_error: Arc::new(log_error),
            on_count_change: None,
        }
    }
}

pub(crate) fn default_key_fn<P: SubscriptionParams>() -> KeyFn<P> {
    Arc::new(|channel, params| default_subscription_key(channel, params))
}

/// Default error reporter.
pub(crate) fn log_error(error: &Error, operation: Operation) {
    tracing::warn!(%operation, "Subscription client error: {error}");
}

struct Entry<P> {
    channel: String,
    params: P,
    callbacks: BTreeMap<u64, Option<MessageCallback>>,
}

struct ManagerState<P> {
    entries: BTreeMap<String, Entry<P>>,
    pending_subscribes: BTreeMap<String, P>,
    pending_unsubscribes: BTreeMap<String, P>,
    flush_scheduled: bool,
    connection_id: Option<String>,
    next_callback_id: u64,
}

struct ManagerInner<P> {
    state: Mutex<ManagerState<P>>,
    handler: Handler<P>,
    session_refresher: Option<Arc<dyn SessionRefresher>>,
    key_fn: KeyFn<P>,
    on_error: ErrorCallback,
    on_count_change: Option<CountChangeCallback>,
    runtime: Handle,
}

/// The subscription table. Cheap to clone; clones share state.
pub struct SubscriptionManager<P> {
    inner: Arc<ManagerInner<P>>,
}

impl<P> Clone for SubscriptionManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: SubscriptionParams> SubscriptionManager<P> {
    /// Create a manager bound to the current Tokio runtime, which runs flushes
    /// and network calls.
    pub fn new(config: ManagerConfig<P>) -> Result<Self, Error> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Ok(Self::with_runtime(config, runtime))
    }

    pub(crate) fn with_runtime(config: ManagerConfig<P>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(ManagerState {
                    entries: BTreeMap::new(),
                    pending_subscribes: BTreeMap::new(),
                    pending_unsubscribes: BTreeMap::new(),
                    flush_scheduled: false,
                    connection_id: None,
                    next_callback_id: 0,
                }),
                handler: config.handler,
                session_refresher: config.session_refresher,
                key_fn: config.key_fn,
                on_error: config.on_error,
                on_count_change: config.on_count_change,
                runtime,
            }),
        }
    }

    /// Register a logical subscription and return its handle.
    ///
    /// Only the first handle for a key queues a network subscribe.
    pub fn subscribe(&self, request: SubscribeRequest<P>) -> Result<SubscriptionHandle, Error> {
        let SubscribeRequest {
            channel,
            params,
            callback,
        } = request;
        let key = (self.inner.key_fn)(&channel, &params)?;

        let (callback_id, new_count) = {
            let mut state = self.lock();
            let callback_id = state.next_callback_id;
            state.next_callback_id += 1;
            match state.entries.get_mut(&key) {
                Some(entry) => {
                    entry.callbacks.insert(callback_id, callback);
                    (callback_id, None)
                }
                None => {
                    tracing::debug!(%key, %channel, "New subscription");
                    state.entries.insert(
                        key.clone(),
                        Entry {
                            channel,
                            params: params.clone(),
                            callbacks: BTreeMap::from([(callback_id, callback)]),
                        },
                    );
                    // Re-added before an unsubscribe went out: the server still has it.
                    if state.pending_unsubscribes.remove(&key).is_none() {
                        state.pending_subscribes.insert(key.clone(), params);
                        self.schedule_flush(&mut state);
                    }
                    (callback_id, Some(state.entries.len()))
                }
            }
        };

        if let Some(count) = new_count {
            self.notify_count_change(count);
        }

        let weak: Weak<ManagerInner<P>> = Arc::downgrade(&self.inner);
        let handle_key = key.clone();
        Ok(SubscriptionHandle {
            key,
            cancel: OnceCancel::new(move || {
                if let Some(inner) = weak.upgrade() {
                    SubscriptionManager { inner }.release(&handle_key, callback_id);
                }
            }),
        })
    }

    fn release(&self, key: &str, callback_id: u64) {
        let new_count = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            if entry.callbacks.remove(&callback_id).is_none() || !entry.callbacks.is_empty() {
                return;
            }
            let Some(entry) = state.entries.remove(key) else {
                return;
            };
            tracing::debug!(%key, channel = %entry.channel, "Last subscriber left");
            // Removed before its subscribe went out: nothing to undo.
            if state.pending_subscribes.remove(key).is_none() {
                state.pending_unsubscribes.insert(key.to_string(), entry.params);
                self.schedule_flush(&mut state);
            }
            state.entries.len()
        };
        self.notify_count_change(new_count);
    }

    fn notify_count_change(&self, count: usize) {
        if let Some(on_count_change) = &self.inner.on_count_change {
            on_count_change(count);
        }
    }

    fn schedule_flush(&self, state: &mut ManagerState<P>) {
        if state.flush_scheduled {
            return;
        }
        state.flush_scheduled = true;
        let manager = self.clone();
        self.inner.runtime.spawn(async move {
            tokio::task::yield_now().await;
            manager.flush().await;
        });
    }

    /// Send everything queued since the last flush.
    async fn flush(&self) {
        let (connection_id, subscribes, unsubscribes) = {
            let mut state = self.lock();
            state.flush_scheduled = false;
            let subscribes: Vec<P> = std::mem::take(&mut state.pending_subscribes)
                .into_values()
                .collect();
            let unsubscribes: Vec<P> = std::mem::take(&mut state.pending_unsubscribes)
                .into_values()
                .collect();
            (state.connection_id.clone(), subscribes, unsubscribes)
        };

        let Some(connection_id) = connection_id else {
            if !subscribes.is_empty() || !unsubscribes.is_empty() {
                tracing::debug!(
                    subscribes = subscribes.len(),
                    unsubscribes = unsubscribes.len(),
                    "No connection yet, leaving changes to resubscription"
                );
            }
            return;
        };

        let handler = &self.inner.handler;
        self.send(
            Direction::Subscribe,
            &connection_id,
            &subscribes,
            handler.operation(Direction::Subscribe),
        )
        .await;
        self.send(
            Direction::Unsubscribe,
            &connection_id,
            &unsubscribes,
            handler.operation(Direction::Unsubscribe),
        )
        .await;
    }

    /// Record `connection_id` and subscribe every active entry on it, in one round.
    ///
    /// Pending changes are discarded: the table already reflects them and the
    /// new connection starts from the table. The network call runs in the
    /// background; failures are reported, not returned.
    pub fn resubscribe_all(&self, connection_id: &str) {
        let params: Vec<P> = {
            let mut state = self.lock();
            state.connection_id = Some(connection_id.to_string());
            state.pending_subscribes.clear();
            state.pending_unsubscribes.clear();
            state.entries.values().map(|e| e.params.clone()).collect()
        };
        if params.is_empty() {
            return;
        }
        tracing::info!(%connection_id, count = params.len(), "Resubscribing");
        self.spawn_send(
            Direction::Subscribe,
            connection_id.to_string(),
            params,
            Operation::ResubscribeAll,
        );
    }

    async fn send(
        &self,
        direction: Direction,
        connection_id: &str,
        params: &[P],
        operation: Operation,
    ) {
        if params.is_empty() {
            return;
        }
        tracing::debug!(%connection_id, %operation, count = params.len(), "Sending changes");
        if let Err(e) = self.inner.handler.apply(direction, connection_id, params).await {
            self.report(&Error::Handler(e), operation);
        }
    }

    fn spawn_send(
        &self,
        direction: Direction,
        connection_id: String,
        params: Vec<P>,
        operation: Operation,
    ) {
        if params.is_empty() {
            return;
        }
        let manager = self.clone();
        self.inner.runtime.spawn(async move {
            manager.send(direction, &connection_id, &params, operation).await;
        });
    }

    /// Deliver `message` to every callback registered under `key`, in
    /// registration order. Unknown keys are ignored.
    pub fn dispatch(&self, key: &str, message: &SubscriptionMessage) {
        let callbacks: Vec<MessageCallback> = {
            let state = self.lock();
            let Some(entry) = state.entries.get(key) else {
                tracing::trace!(%key, "Message for inactive subscription dropped");
                return;
            };
            entry.callbacks.values().flatten().cloned().collect()
        };

        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => self.report(
                    &Error::Callback {
                        key: key.to_string(),
                        error,
                    },
                    Operation::Dispatch,
                ),
                Err(_) => self.report(
                    &Error::CallbackPanicked {
                        key: key.to_string(),
                    },
                    Operation::Dispatch,
                ),
            }
        }
    }

    /// Forget every subscription without any network call.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.pending_subscribes.clear();
        state.pending_unsubscribes.clear();
        state.connection_id = None;
    }

    /// [`clear`](Self::clear) only if no subscription is active, atomically.
    ///
    /// Unsubscribes already queued for the current connection still go out.
    pub(crate) fn clear_if_idle(&self) -> bool {
        let (connection_id, unsubscribes) = {
            let mut state = self.lock();
            if !state.entries.is_empty() {
                return false;
            }
            state.pending_subscribes.clear();
            let unsubscribes: Vec<P> = std::mem::take(&mut state.pending_unsubscribes)
                .into_values()
                .collect();
            (state.connection_id.take(), unsubscribes)
        };
        if let Some(connection_id) = connection_id {
            let operation = self.inner.handler.operation(Direction::Unsubscribe);
            self.spawn_send(Direction::Unsubscribe, connection_id, unsubscribes, operation);
        }
        true
    }

    pub fn set_connection_id(&self, connection_id: Option<String>) {
        self.lock().connection_id = connection_id;
    }

    pub fn connection_id(&self) -> Option<String> {
        self.lock().connection_id.clone()
    }

    pub fn has_active_subscriptions(&self) -> bool {
        !self.lock().entries.is_empty()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn active_subscriptions(&self) -> Vec<ActiveSubscription<P>> {
        self.lock()
            .entries
            .iter()
            .map(|(key, entry)| ActiveSubscription {
                key: key.clone(),
                channel: entry.channel.clone(),
                params: entry.params.clone(),
                subscribers: entry.callbacks.len(),
            })
            .collect()
    }

    /// Ask the session refresher to extend the current connection's session.
    /// No-op without a refresher or a connection id; failures are reported.
    pub async fn refresh_session(&self) {
        let Some(refresher) = &self.inner.session_refresher else {
            return;
        };
        let Some(connection_id) = self.connection_id() else {
            return;
        };
        if let Err(e) = refresher.refresh_session(&connection_id).await {
            self.report(&Error::Handler(e), Operation::RefreshSession);
        }
    }

    fn report(&self, error: &Error, operation: Operation) {
        (self.inner.on_error)(error, operation);
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState<P>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
