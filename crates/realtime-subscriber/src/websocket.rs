//! Default transport: a self-reconnecting WebSocket on tokio-tungstenite.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite;

use crate::backoff::reconnect_delay;
use crate::transport::{
    ReadyState, Socket, SocketConnection, SocketEvent, SocketOptions, TransportFactory,
};
use crate::types::Error;

const NORMAL_CLOSURE: u16 = 1000;
const ABNORMAL_CLOSURE: u16 = 1006;

/// Connects with `tokio_tungstenite::connect_async` and keeps reconnecting
/// after drops, waiting [`reconnect_delay`] between attempts, until
/// `max_retries` consecutive attempts have failed or the socket is closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl TransportFactory for WebSocketTransport {
    fn connect(&self, url: &str, options: &SocketOptions) -> Result<SocketConnection, Error> {
        let parsed = url::Url::parse(url)?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::InvalidConfig(format!(
                "url scheme must be ws or wss, got {}",
                parsed.scheme()
            )));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let ready = Arc::new(AtomicU8::new(ReadyState::Connecting.to_u8()));

        runtime.spawn(run_socket(
            SocketLoop {
                url: parsed.to_string(),
                options: options.clone(),
                event_tx,
                ready: Arc::clone(&ready),
            },
            close_rx,
        ));

        Ok(SocketConnection {
            socket: Arc::new(WebSocketHandle {
                ready,
                close_tx: Mutex::new(Some(close_tx)),
            }),
            events: event_rx,
        })
    }
}

struct WebSocketHandle {
    ready: Arc<AtomicU8>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Socket for WebSocketHandle {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready.load(Ordering::Acquire))
    }

    fn close(&self) {
        let close_tx = self.close_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = close_tx {
            if self.ready_state() != ReadyState::Closed {
                self.ready.store(ReadyState::Closing.to_u8(), Ordering::Release);
            }
            let _ = tx.send(());
        }
    }
}

impl Drop for WebSocketHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Background socket loop
// ---------------------------------------------------------------------------

struct SocketLoop {
    url: String,
    options: SocketOptions,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
    ready: Arc<AtomicU8>,
}

impl SocketLoop {
    fn set_ready(&self, state: ReadyState) {
        self.ready.store(state.to_u8(), Ordering::Release);
    }

    /// Returns `false` once nobody is listening for events anymore.
    fn emit(&self, event: SocketEvent) -> bool {
        self.event_tx.send(event).is_ok()
    }

    fn delay_for(&self, attempt: u32) -> std::time::Duration {
        reconnect_delay(
            attempt,
            self.options.min_reconnection_delay,
            self.options.max_reconnection_delay,
            self.options.reconnection_delay_grow_factor,
        )
    }
}

/// Why a live connection ended.
enum Ended {
    /// Close was requested locally; stop for good.
    ByClient,
    /// The connection dropped; reconnect.
    Dropped { code: Option<u16>, reason: String },
    /// The event receiver is gone; stop silently.
    Abandoned,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_socket(p: SocketLoop, mut close_rx: oneshot::Receiver<()>) {
    // Index of the next attempt within the current outage; 0 is the initial connect.
    let mut attempt: u32 = 0;

    loop {
        if attempt > p.options.max_retries {
            tracing::warn!(
                url = %p.url,
                max_retries = p.options.max_retries,
                "Giving up reconnecting"
            );
            p.set_ready(ReadyState::Closed);
            p.emit(SocketEvent::Error(Error::RetriesExhausted(p.options.max_retries)));
            return;
        }

        let delay = p.delay_for(attempt);
        if !delay.is_zero() {
            tracing::debug!(attempt, ?delay, "Waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut close_rx => {
                    tracing::info!("Close requested during reconnect");
                    p.set_ready(ReadyState::Closed);
                    return;
                }
            }
        }

        p.set_ready(ReadyState::Connecting);
        let connect = tokio::time::timeout(
            p.options.connection_timeout,
            tokio_tungstenite::connect_async(p.url.as_str()),
        );
        let result = tokio::select! {
            result = connect => result,
            _ = &mut close_rx => {
                tracing::info!("Close requested while connecting");
                p.set_ready(ReadyState::Closed);
                return;
            }
        };

        let ws = match result {
            Ok(Ok((ws, _resp))) => ws,
            Ok(Err(e)) => {
                tracing::warn!(url = %p.url, attempt, "Connect failed: {e}");
                if !connect_failed(&p, Error::from(e)) {
                    return;
                }
                attempt += 1;
                continue;
            }
            Err(_) => {
                tracing::warn!(url = %p.url, attempt, "Connect timed out");
                if !connect_failed(&p, Error::ConnectionTimeout(p.options.connection_timeout)) {
                    return;
                }
                attempt += 1;
                continue;
            }
        };

        tracing::info!(url = %p.url, "WebSocket open");
        p.set_ready(ReadyState::Open);
        if !p.emit(SocketEvent::Open) {
            return;
        }

        match pump(&p, ws, &mut close_rx).await {
            Ended::ByClient => {
                p.set_ready(ReadyState::Closed);
                p.emit(SocketEvent::Close {
                    code: Some(NORMAL_CLOSURE),
                    reason: String::new(),
                });
                return;
            }
            Ended::Abandoned => return,
            Ended::Dropped { code, reason } => {
                tracing::info!(?code, %reason, "WebSocket closed, reconnecting");
                p.set_ready(ReadyState::Closed);
                if !p.emit(SocketEvent::Close { code, reason }) {
                    return;
                }
                attempt = 1;
            }
        }
    }
}

fn connect_failed(p: &SocketLoop, error: Error) -> bool {
    p.set_ready(ReadyState::Closed);
    p.emit(SocketEvent::Error(error))
        && p.emit(SocketEvent::Close {
            code: Some(ABNORMAL_CLOSURE),
            reason: String::new(),
        })
}

/// Forward frames from an open connection until it ends.
async fn pump(p: &SocketLoop, ws: WsStream, close_rx: &mut oneshot::Receiver<()>) -> Ended {
    let (mut ws_write, mut ws_read) = ws.split();
    loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if p.options.debug {
                            tracing::debug!(frame = %text.as_str(), "WebSocket frame");
                        }
                        if !p.emit(SocketEvent::Message(text.as_str().to_owned())) {
                            return Ended::Abandoned;
                        }
                    }
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        if !p.emit(binary_frame(p.options.debug, &data)) {
                            return Ended::Abandoned;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        return match frame {
                            Some(f) => Ended::Dropped {
                                code: Some(u16::from(f.code)),
                                reason: f.reason.as_str().to_owned(),
                            },
                            None => Ended::Dropped {
                                code: None,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {e}");
                        if !p.emit(SocketEvent::Error(Error::from(e))) {
                            return Ended::Abandoned;
                        }
                        return Ended::Dropped {
                            code: Some(ABNORMAL_CLOSURE),
                            reason: String::new(),
                        };
                    }
                    None => {
                        return Ended::Dropped {
                            code: Some(ABNORMAL_CLOSURE),
                            reason: "stream ended".to_string(),
                        };
                    }
                }
            }

            _ = &mut *close_rx => {
                tracing::info!("Close requested");
                p.set_ready(ReadyState::Closing);
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                return Ended::ByClient;
            }
        }
    }
}

/// Binary frames are accepted when they hold UTF-8 text.
fn binary_frame(debug: bool, data: &[u8]) -> SocketEvent {
    match std::str::from_utf8(data) {
        Ok(text) => {
            if debug {
                tracing::debug!(frame = %text, "WebSocket binary frame");
            }
            SocketEvent::Message(text.to_owned())
        }
        Err(_) => SocketEvent::Error(Error::Transport(
            "binary frame is not valid UTF-8".to_string(),
        )),
    }
}
