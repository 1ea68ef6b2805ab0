//! Transport seam: how the client obtains a physical socket and its events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::types::Error;

/// Ready state of a socket, mirroring the WebSocket API's `readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ReadyState::Connecting => 0,
            ReadyState::Open => 1,
            ReadyState::Closing => 2,
            ReadyState::Closed => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Events emitted by a socket, in the order they occurred.
#[derive(Debug)]
pub enum SocketEvent {
    Open,
    Close { code: Option<u16>, reason: String },
    Error(Error),
    /// A text frame (or UTF-8 binary frame).
    Message(String),
}

/// Options handed to the transport for one connect.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketOptions {
    pub max_reconnection_delay: Duration,
    pub min_reconnection_delay: Duration,
    pub reconnection_delay_grow_factor: f64,
    pub connection_timeout: Duration,
    pub max_retries: u32,
    pub debug: bool,
}

/// A live (possibly self-reconnecting) socket.
pub trait Socket: Send + Sync {
    fn ready_state(&self) -> ReadyState;
    /// Close the socket and stop reconnecting. Idempotent.
    fn close(&self);
}

/// A socket plus the stream of its events. The stream ends once the socket has
/// closed for good (explicit close or retries exhausted).
pub struct SocketConnection {
    pub socket: Arc<dyn Socket>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Creates sockets. Implementations must not block: connecting happens in the
/// background and is reported through [`SocketEvent`]s.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, url: &str, options: &SocketOptions) -> Result<SocketConnection, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_state_round_trips_through_u8() {
        for state in [
            ReadyState::Connecting,
            ReadyState::Open,
            ReadyState::Closing,
            ReadyState::Closed,
        ] {
            assert_eq!(ReadyState::from_u8(state.to_u8()), state);
        }
        assert_eq!(ReadyState::from_u8(200), ReadyState::Closed);
    }
}
