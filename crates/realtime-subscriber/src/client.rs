//! Public entry point: [`SubscriptionClient`] and its connection lifecycle.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::config::ClientConfig;
use crate::handler::{Handler, SessionRefresher};
use crate::listeners::{ListenerHandle, ListenerSet, run_listener};
use crate::manager::{
    KeyFn, ManagerConfig, SubscribeRequest, SubscriptionHandle, SubscriptionManager,
    SubscriptionParams, default_key_fn, log_error,
};
use crate::protocol::{JsonMessageParser, MessageParser};
use crate::status::StatusStore;
use crate::transport::{ReadyState, Socket, SocketConnection, SocketEvent, TransportFactory};
use crate::types::{
    ActiveSubscription, ConnectionStatus, Error, ErrorCallback, Operation, RawMessageCallback,
};
use crate::websocket::WebSocketTransport;

type ConnectionListener = dyn Fn(&str) + Send + Sync;
type SocketSlot = Arc<Mutex<Option<Arc<dyn Socket>>>>;

/// Everything a [`SubscriptionClient`] is built from.
///
/// [`ClientOptions::new`] fills in the default WebSocket transport, JSON
/// classifier and key function; override the public fields as needed.
pub struct ClientOptions<P> {
    pub config: ClientConfig,
    pub handler: Handler<P>,
    pub transport: Arc<dyn TransportFactory>,
    pub parser: Arc<dyn MessageParser>,
    pub key_fn: KeyFn<P>,
    pub session_refresher: Option<Arc<dyn SessionRefresher>>,
    /// Receives every recoverable error. Defaults to a `tracing` warning.
    pub on_error: ErrorCallback,
    /// Sees every inbound frame after JSON parsing.
    pub on_raw_message: Option<RawMessageCallback>,
}

impl<P: SubscriptionParams> ClientOptions<P> {
    pub fn new(config: ClientConfig, handler: Handler<P>) -> Self {
        Self {
            config,
            handler,
            transport: Arc::new(WebSocketTransport),
            parser: Arc::new(JsonMessageParser),
            key_fn: default_key_fn(),
            session_refresher: None,
            on_error: Arc::new(log_error),
            on_raw_message: None,
        }
    }
}

enum Command {
    /// Open a socket if subscriptions are active and none is open.
    Connect,
    /// Tear the socket down if no subscription is active.
    Disconnect,
    Close(oneshot::Sender<()>),
}

struct Shared<P> {
    manager: SubscriptionManager<P>,
    store: StatusStore,
    connection_listeners: ListenerSet<ConnectionListener>,
    socket: SocketSlot,
    commands: mpsc::UnboundedSender<Command>,
}

/// Real-time subscription client.
///
/// The socket is opened lazily when the first subscription is registered and
/// closed when the last one is released. Every new connection resubscribes all
/// active subscriptions. Clones share one connection; dropping the last clone
/// shuts the client down.
pub struct SubscriptionClient<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for SubscriptionClient<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: SubscriptionParams> SubscriptionClient<P> {
    /// Validate the configuration and start the connection controller on the
    /// current Tokio runtime. No socket is opened until the first subscription.
    pub fn new(options: ClientOptions<P>) -> Result<Self, Error> {
        options.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let hook_tx = command_tx.downgrade();
        let manager = SubscriptionManager::with_runtime(
            ManagerConfig {
                handler: options.handler,
                session_refresher: options.session_refresher,
                key_fn: options.key_fn,
                on_error: Arc::clone(&options.on_error),
                on_count_change: Some(Arc::new(move |count| {
                    let Some(tx) = hook_tx.upgrade() else {
                        return;
                    };
                    let command = if count == 0 {
                        Command::Disconnect
                    } else {
                        Command::Connect
                    };
                    let _ = tx.send(command);
                })),
            },
            runtime.clone(),
        );

        let store = StatusStore::with_error_callback(Arc::clone(&options.on_error));
        let connection_listeners = ListenerSet::default();
        let socket: SocketSlot = Arc::new(Mutex::new(None));

        runtime.spawn(
            Controller {
                manager: manager.clone(),
                store: store.clone(),
                connection_listeners: connection_listeners.clone(),
                socket_slot: Arc::clone(&socket),
                config: options.config,
                transport: options.transport,
                parser: options.parser,
                on_error: options.on_error,
                on_raw_message: options.on_raw_message,
                socket: None,
                events: None,
                was_connected: false,
            }
            .run(command_rx),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                store,
                connection_listeners,
                socket,
                commands: command_tx,
            }),
        })
    }

    /// Register a subscription. The returned handle unsubscribes when dropped.
    ///
    /// Registration is immediate; connecting and the network subscribe happen
    /// in the background.
    pub fn subscribe(&self, request: SubscribeRequest<P>) -> Result<SubscriptionHandle, Error> {
        self.shared.manager.subscribe(request)
    }

    /// Called with every status change, without duplicates.
    pub fn on_status_change(
        &self,
        listener: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared.store.on_status_change(listener)
    }

    /// Called with the connection id each time the server confirms a connection.
    pub fn on_connection_established(
        &self,
        listener: impl Fn(&str) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.shared.connection_listeners.add(Arc::new(listener))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.store.status()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.shared.store.connection_id()
    }

    /// The most recent transport error, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.shared.store.error()
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| s.ready_state() == ReadyState::Open)
    }

    pub fn has_active_subscriptions(&self) -> bool {
        self.shared.manager.has_active_subscriptions()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.manager.subscription_count()
    }

    pub fn active_subscriptions(&self) -> Vec<ActiveSubscription<P>> {
        self.shared.manager.active_subscriptions()
    }

    /// Extend the current connection's server-side session.
    pub async fn refresh_session(&self) {
        self.shared.manager.refresh_session().await;
    }

    /// Open a new socket if subscriptions are active but the previous socket
    /// gave up.
    pub fn reconnect(&self) {
        let _ = self.shared.commands.send(Command::Connect);
    }

    /// Drop every subscription without network calls, close the socket and
    /// stop the controller. Outstanding handles become no-ops.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.shared.commands.send(Command::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Controller task
// ---------------------------------------------------------------------------

struct Controller<P> {
    manager: SubscriptionManager<P>,
    store: StatusStore,
    connection_listeners: ListenerSet<ConnectionListener>,
    socket_slot: SocketSlot,
    config: ClientConfig,
    transport: Arc<dyn TransportFactory>,
    parser: Arc<dyn MessageParser>,
    on_error: ErrorCallback,
    on_raw_message: Option<RawMessageCallback>,
    socket: Option<Arc<dyn Socket>>,
    events: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    was_connected: bool,
}

impl<P: SubscriptionParams> Controller<P> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect) => self.connect(),
                    Some(Command::Disconnect) => self.disconnect(),
                    Some(Command::Close(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        tracing::debug!("All client handles dropped");
                        self.shutdown();
                        return;
                    }
                },
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_socket_event(event),
                    None => self.transport_ended(),
                },
            }
        }
    }

    fn connect(&mut self) {
        if self.socket.is_some() || !self.manager.has_active_subscriptions() {
            return;
        }
        tracing::info!(url = %self.config.url, "Connecting");
        self.store.set_status(ConnectionStatus::Connecting);

        let options = self.config.socket_options();
        match self.transport.connect(&self.config.url, &options) {
            Ok(SocketConnection { socket, events }) => {
                self.set_socket(Some(socket));
                self.events = Some(events);
            }
            Err(e) => {
                tracing::warn!(url = %self.config.url, "Transport refused to connect: {e}");
                self.record_error(e);
                self.store.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    fn disconnect(&mut self) {
        if !self.manager.clear_if_idle() {
            return;
        }
        let Some(socket) = self.socket.take() else {
            return;
        };
        tracing::info!("Last subscription released, disconnecting");
        // Must precede close() so the close event is not read as a drop.
        self.was_connected = false;
        socket.close();
        self.events = None;
        self.set_socket(None);
        self.store.reset();
        self.store.set_status(ConnectionStatus::Disconnected);
    }

    fn shutdown(&mut self) {
        self.manager.clear();
        self.was_connected = false;
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.events = None;
        self.set_socket(None);
        self.store.reset();
        tracing::info!("Subscription client closed");
    }

    /// The socket stopped producing events without being closed here.
    fn transport_ended(&mut self) {
        tracing::warn!("Transport gave up, waiting for a new subscription or reconnect");
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.events = None;
        self.set_socket(None);
        self.was_connected = false;
        self.forget_connection();
        self.store.set_status(ConnectionStatus::Disconnected);
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        if self.socket.is_none() {
            return;
        }
        match event {
            SocketEvent::Open => {
                tracing::info!("Socket open");
                self.was_connected = true;
                self.store.set_status(ConnectionStatus::Connected);
            }
            SocketEvent::Close { code, reason } => {
                tracing::info!(?code, %reason, was_connected = self.was_connected, "Socket closed");
                self.forget_connection();
                self.store.set_status(if self.was_connected {
                    ConnectionStatus::Reconnecting
                } else {
                    ConnectionStatus::Disconnected
                });
            }
            SocketEvent::Error(e) => {
                tracing::warn!("Socket error: {e}");
                self.record_error(e);
            }
            SocketEvent::Message(text) => self.handle_frame(&text),
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let raw: serde_json::Value = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("Dropping non-JSON frame");
                (self.on_error)(&Error::Json(e), Operation::Parse);
                return;
            }
        };
        tracing::trace!(frame = %raw, "Frame received");

        if let Some(on_raw_message) = &self.on_raw_message {
            run_listener("raw message", Some(&self.on_error), || on_raw_message(&raw));
        }

        match self.parser.parse_connection_message(&raw) {
            Ok(Some(message)) => {
                self.connection_established(message.connection_id);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                (self.on_error)(&Error::Parse(e), Operation::Parse);
                return;
            }
        }

        match self.parser.parse_message(&raw) {
            Ok(Some(message)) => self.manager.dispatch(&message.key, &message),
            Ok(None) => tracing::trace!("Unclassified frame ignored"),
            Err(e) => (self.on_error)(&Error::Parse(e), Operation::Parse),
        }
    }

    fn connection_established(&mut self, connection_id: String) {
        tracing::info!(%connection_id, "Connection established");
        self.manager.set_connection_id(Some(connection_id.clone()));
        self.store.set_connection_id(Some(connection_id.clone()));
        for listener in self.connection_listeners.snapshot() {
            run_listener("connection", Some(&self.on_error), || listener(&connection_id));
        }
        if self.manager.has_active_subscriptions() {
            self.manager.resubscribe_all(&connection_id);
        }
    }

    /// The server forgets a connection's subscriptions when it drops; changes
    /// made until the next connection id are carried by resubscription.
    fn forget_connection(&self) {
        self.manager.set_connection_id(None);
        self.store.set_connection_id(None);
    }

    fn record_error(&self, error: Error) {
        (self.on_error)(&error, Operation::Transport);
        self.store.set_error(Some(Arc::new(error)));
    }

    fn set_socket(&mut self, socket: Option<Arc<dyn Socket>>) {
        self.socket = socket.clone();
        *self.socket_slot.lock().unwrap_or_else(|e| e.into_inner()) = socket;
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<SocketEvent>>,
) -> Option<SocketEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
