//! Subscribe to one channel and print every message.
//!
//! ```text
//! cargo run --example subscribe -- ws://127.0.0.1:8080/ws prices '{"id":"token-1"}'
//! ```
//!
//! The subscription handler here only logs; a real application would call its
//! backend's subscribe endpoint with the connection id.

use async_trait::async_trait;
use realtime_subscriber::{
    BatchSubscriptionHandler, BoxError, ClientConfig, ClientOptions, Handler, SubscribeRequest,
    SubscriptionClient,
};
use serde_json::Value;

struct LoggingHandler;

#[async_trait]
impl BatchSubscriptionHandler<Value> for LoggingHandler {
    async fn subscribe_batch(&self, connection_id: &str, params: &[Value]) -> Result<(), BoxError> {
        tracing::info!(%connection_id, ?params, "subscribe");
        Ok(())
    }

    async fn unsubscribe_batch(
        &self,
        connection_id: &str,
        params: &[Value],
    ) -> Result<(), BoxError> {
        tracing::info!(%connection_id, ?params, "unsubscribe");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let usage = "usage: subscribe <ws-url> <channel> [params-json]";
    let url = args.next().ok_or(usage)?;
    let channel = args.next().ok_or(usage)?;
    let params: Value = match args.next() {
        Some(json) => serde_json::from_str(&json)?,
        None => Value::Object(Default::default()),
    };

    let mut config = ClientConfig::new(url);
    config.debug = true;
    let client = SubscriptionClient::new(ClientOptions::new(
        config,
        Handler::batched(LoggingHandler),
    ))?;

    let _status = client.on_status_change(|status| tracing::info!(%status, "status"));
    let _subscription = client.subscribe(SubscribeRequest::new(channel, params).on_message(
        |msg| {
            println!("[{}] {}", msg.channel, msg.data);
            Ok(())
        },
    ))?;

    tokio::signal::ctrl_c().await?;
    client.close().await;
    Ok(())
}
