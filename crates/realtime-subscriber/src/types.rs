//! Public types for the realtime-subscriber crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

/// A boxed error type for collaborator traits and callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked for every message routed to a subscription.
pub type MessageCallback = Arc<dyn Fn(&SubscriptionMessage) -> Result<(), BoxError> + Send + Sync>;

/// Callback receiving every error the client recovers from locally.
pub type ErrorCallback = Arc<dyn Fn(&Error, Operation) + Send + Sync>;

/// Callback receiving every inbound frame after JSON parsing, before classification.
pub type RawMessageCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Lifecycle state of the physical connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        })
    }
}

/// The operation an error reported through [`ErrorCallback`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Subscribe,
    Unsubscribe,
    SubscribeBatch,
    UnsubscribeBatch,
    ResubscribeAll,
    RefreshSession,
    Dispatch,
    Parse,
    Transport,
    /// A status, connection or raw-frame listener.
    Listener,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Subscribe => "subscribe",
            Operation::Unsubscribe => "unsubscribe",
            Operation::SubscribeBatch => "subscribe_batch",
            Operation::UnsubscribeBatch => "unsubscribe_batch",
            Operation::ResubscribeAll => "resubscribe_all",
            Operation::RefreshSession => "refresh_session",
            Operation::Dispatch => "dispatch",
            Operation::Parse => "parse",
            Operation::Transport => "transport",
            Operation::Listener => "listener",
        })
    }
}

/// A connection-established frame: the server assigned this connection an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMessage {
    pub connection_id: String,
}

/// A data frame routed to the subscription identified by `key`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMessage {
    /// Channel the message belongs to (e.g. `"prices"`).
    pub channel: String,
    /// Subscription key, as produced by the client's key function.
    pub key: String,
    /// Message payload.
    pub data: serde_json::Value,
}

/// Snapshot of one active logical subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSubscription<P> {
    pub key: String,
    pub channel: String,
    pub params: P,
    /// Number of live handles sharing this subscription.
    pub subscribers: usize,
}

/// Errors returned or reported by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid subscription params: {0}")]
    InvalidParams(#[source] serde_json::Error),

    #[error("subscription handler failed: {0}")]
    Handler(BoxError),

    #[error("message callback failed for {key}: {error}")]
    Callback { key: String, error: BoxError },

    #[error("message callback panicked for {key}")]
    CallbackPanicked { key: String },

    #[error("{0} listener panicked")]
    ListenerPanicked(&'static str),

    #[error("message classification failed: {0}")]
    Parse(BoxError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no Tokio runtime available")]
    NoRuntime,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionStatus::Reconnecting).unwrap();
        assert_eq!(json, r#""reconnecting""#);
        let parsed: ConnectionStatus = serde_json::from_str(r#""connecting""#).unwrap();
        assert_eq!(parsed, ConnectionStatus::Connecting);
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn operation_names() {
        assert_eq!(Operation::SubscribeBatch.to_string(), "subscribe_batch");
        assert_eq!(Operation::ResubscribeAll.to_string(), "resubscribe_all");
    }

    #[test]
    fn callback_error_message_names_key() {
        let err = Error::Callback {
            key: "prices:{}".to_string(),
            error: "boom".into(),
        };
        assert_eq!(err.to_string(), "message callback failed for prices:{}: boom");
    }
}
