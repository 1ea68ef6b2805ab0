use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use realtime_subscriber::{
    Error, ReadyState, SocketEvent, SocketOptions, TransportFactory, WebSocketTransport,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn listen() -> std::io::Result<(TcpListener, String)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    Ok((listener, url))
}

async fn accept(listener: &TcpListener) -> Result<WsStream, Box<dyn std::error::Error>> {
    let (tcp, _) = listener.accept().await?;
    Ok(tokio_tungstenite::accept_async(tcp).await?)
}

fn options(max_retries: u32) -> SocketOptions {
    SocketOptions {
        max_reconnection_delay: Duration::from_millis(50),
        min_reconnection_delay: Duration::from_millis(10),
        reconnection_delay_grow_factor: 1.3,
        connection_timeout: Duration::from_secs(2),
        max_retries,
        debug: true,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SocketEvent>) -> Option<SocketEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap_or(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forwards_open_and_frames() {
    let (listener, url) = listen().await.unwrap();
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await.unwrap();
        ws.send(tungstenite::Message::Text(
            r#"{"type":"connected","connectionId":"conn-1"}"#.into(),
        ))
        .await
        .unwrap();
        ws.send(tungstenite::Message::Binary(br#"{"channel":"prices"}"#.to_vec().into()))
            .await
            .unwrap();
        ws.send(tungstenite::Message::Binary(vec![0xff, 0xfe].into()))
            .await
            .unwrap();
        // Keep the connection up until the client is done.
        let _ = ws.next().await;
    });

    let mut conn = WebSocketTransport.connect(&url, &options(2)).unwrap();

    assert!(matches!(next_event(&mut conn.events).await, Some(SocketEvent::Open)));
    assert_eq!(conn.socket.ready_state(), ReadyState::Open);
    match next_event(&mut conn.events).await {
        Some(SocketEvent::Message(text)) => {
            assert_eq!(text, r#"{"type":"connected","connectionId":"conn-1"}"#);
        }
        other => panic!("expected text frame, got {other:?}"),
    }
    match next_event(&mut conn.events).await {
        Some(SocketEvent::Message(text)) => assert_eq!(text, r#"{"channel":"prices"}"#),
        other => panic!("expected binary frame as text, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut conn.events).await,
        Some(SocketEvent::Error(Error::Transport(_)))
    ));

    conn.socket.close();
    server.await.unwrap();
}

#[tokio::test]
async fn reconnects_after_server_closes() {
    let (listener, url) = listen().await.unwrap();
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await.unwrap();
        first
            .close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "restarting".into(),
            }))
            .await
            .unwrap();

        let mut second = accept(&listener).await.unwrap();
        second
            .send(tungstenite::Message::Text("again".into()))
            .await
            .unwrap();
        let _ = second.next().await;
    });

    let mut conn = WebSocketTransport.connect(&url, &options(2)).unwrap();

    assert!(matches!(next_event(&mut conn.events).await, Some(SocketEvent::Open)));
    match next_event(&mut conn.events).await {
        Some(SocketEvent::Close { code, reason }) => {
            assert_eq!(code, Some(1001));
            assert_eq!(reason, "restarting");
        }
        other => panic!("expected close, got {other:?}"),
    }
    assert!(matches!(next_event(&mut conn.events).await, Some(SocketEvent::Open)));
    assert!(matches!(
        next_event(&mut conn.events).await,
        Some(SocketEvent::Message(text)) if text == "again"
    ));

    conn.socket.close();
    server.await.unwrap();
}

#[tokio::test]
async fn gives_up_after_max_retries() {
    // Bind then drop to get a port nobody listens on.
    let (listener, url) = listen().await.unwrap();
    drop(listener);

    let mut conn = WebSocketTransport.connect(&url, &options(2)).unwrap();

    let mut events = Vec::new();
    while let Some(event) = next_event(&mut conn.events).await {
        events.push(event);
    }

    let failures = events
        .iter()
        .filter(|e| matches!(e, SocketEvent::Close { code: Some(1006), .. }))
        .count();
    assert_eq!(failures, 3, "initial attempt plus two retries: {events:?}");
    assert!(!events.iter().any(|e| matches!(e, SocketEvent::Open)));
    assert!(matches!(
        events.last(),
        Some(SocketEvent::Error(Error::RetriesExhausted(2)))
    ));
    assert_eq!(conn.socket.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn close_sends_close_frame_and_stops() {
    let (listener, url) = listen().await.unwrap();
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await.unwrap();
        let frame = ws.next().await;
        assert!(
            matches!(frame, Some(Ok(tungstenite::Message::Close(_)))),
            "expected close frame, got {frame:?}"
        );
    });

    let mut conn = WebSocketTransport.connect(&url, &options(2)).unwrap();
    assert!(matches!(next_event(&mut conn.events).await, Some(SocketEvent::Open)));

    conn.socket.close();
    assert!(matches!(
        next_event(&mut conn.events).await,
        Some(SocketEvent::Close { code: Some(1000), .. })
    ));
    assert!(next_event(&mut conn.events).await.is_none());
    assert_eq!(conn.socket.ready_state(), ReadyState::Closed);

    server.await.unwrap();
}
