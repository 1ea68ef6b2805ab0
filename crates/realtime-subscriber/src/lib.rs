//! Transport-agnostic real-time subscription client.
//!
//! Many logical subscriptions share one physical socket. Subscriptions are
//! reference-counted by `(channel, params)`, subscribe/unsubscribe calls made
//! within one scheduler tick are batched into single handler calls, and every
//! new connection resubscribes whatever is active.
//!
//! # Features
//! - Lazy connect on the first subscription, disconnect after the last
//! - Self-reconnecting WebSocket transport with jittered, growing backoff
//! - Pluggable transport, subscription handler, frame classifier and key function
//! - De-duplicated connection status notifications
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), realtime_subscriber::Error> {
//! use async_trait::async_trait;
//! use realtime_subscriber::{
//!     BatchSubscriptionHandler, BoxError, ClientConfig, ClientOptions, Handler,
//!     SubscribeRequest, SubscriptionClient,
//! };
//! use serde_json::Value;
//!
//! struct Api;
//!
//! #[async_trait]
//! impl BatchSubscriptionHandler<Value> for Api {
//!     async fn subscribe_batch(&self, _id: &str, _params: &[Value]) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//!     async fn unsubscribe_batch(&self, _id: &str, _params: &[Value]) -> Result<(), BoxError> {
//!         Ok(())
//!     }
//! }
//!
//! let config = ClientConfig::new("wss://stream.example.com/ws");
//! let client = SubscriptionClient::new(ClientOptions::new(config, Handler::batched(Api)))?;
//!
//! let _prices = client.subscribe(
//!     SubscribeRequest::new("prices", serde_json::json!({"id": "token-1"}))
//!         .on_message(|msg| {
//!             println!("{}: {}", msg.channel, msg.data);
//!             Ok(())
//!         }),
//! )?;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod client;
mod config;
mod handler;
mod listeners;
mod manager;
mod protocol;
mod status;
mod transport;
mod types;
mod websocket;

pub use backoff::{jittered_delay, reconnect_delay};
pub use client::{ClientOptions, SubscriptionClient};
pub use config::ClientConfig;
pub use handler::{BatchSubscriptionHandler, Handler, SessionRefresher, SubscriptionHandler};
pub use listeners::ListenerHandle;
pub use manager::{
    CountChangeCallback, KeyFn, ManagerConfig, SubscribeRequest, SubscriptionHandle,
    SubscriptionManager, SubscriptionParams,
};
pub use protocol::{JsonMessageParser, MessageParser, default_subscription_key};
pub use status::StatusStore;
pub use transport::{
    ReadyState, Socket, SocketConnection, SocketEvent, SocketOptions, TransportFactory,
};
pub use types::{
    ActiveSubscription, BoxError, ConnectionMessage, ConnectionStatus, Error, ErrorCallback,
    MessageCallback, Operation, RawMessageCallback, SubscriptionMessage,
};
pub use websocket::WebSocketTransport;
