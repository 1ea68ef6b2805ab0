//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::jittered_delay;
use crate::transport::SocketOptions;
use crate::types::Error;

pub(crate) const DEFAULT_MAX_RECONNECTION_DELAY: Duration = Duration::from_millis(10_000);
pub(crate) const DEFAULT_MIN_RECONNECTION_DELAY: Duration = Duration::from_millis(1_000);
pub(crate) const DEFAULT_RECONNECTION_JITTER: Duration = Duration::from_millis(4_000);
pub(crate) const DEFAULT_RECONNECTION_DELAY_GROW_FACTOR: f64 = 1.3;
pub(crate) const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(4_000);
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 5;

/// Connection settings. Durations are milliseconds when (de)serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    #[serde(default = "default_max_reconnection_delay", with = "millis")]
    pub max_reconnection_delay: Duration,
    /// Lower bound of the retry delay; jittered once per connect.
    #[serde(default = "default_min_reconnection_delay", with = "millis")]
    pub min_reconnection_delay: Duration,
    /// Width of the random window added to `min_reconnection_delay`.
    #[serde(default = "default_reconnection_jitter", with = "millis")]
    pub reconnection_jitter: Duration,
    #[serde(default = "default_reconnection_delay_grow_factor")]
    pub reconnection_delay_grow_factor: f64,
    /// Per-attempt timeout for establishing the socket.
    #[serde(default = "default_connection_timeout", with = "millis")]
    pub connection_timeout: Duration,
    /// Consecutive failed attempts after which the transport gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Log every inbound frame at debug level.
    #[serde(default)]
    pub debug: bool,
}

fn default_max_reconnection_delay() -> Duration {
    DEFAULT_MAX_RECONNECTION_DELAY
}

fn default_min_reconnection_delay() -> Duration {
    DEFAULT_MIN_RECONNECTION_DELAY
}

fn default_reconnection_jitter() -> Duration {
    DEFAULT_RECONNECTION_JITTER
}

fn default_reconnection_delay_grow_factor() -> f64 {
    DEFAULT_RECONNECTION_DELAY_GROW_FACTOR
}

fn default_connection_timeout() -> Duration {
    DEFAULT_CONNECTION_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnection_delay: DEFAULT_MAX_RECONNECTION_DELAY,
            min_reconnection_delay: DEFAULT_MIN_RECONNECTION_DELAY,
            reconnection_jitter: DEFAULT_RECONNECTION_JITTER,
            reconnection_delay_grow_factor: DEFAULT_RECONNECTION_DELAY_GROW_FACTOR,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            debug: false,
        }
    }

    /// Parse a JSON config document and validate it.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let url = url::Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidConfig(format!(
                "url scheme must be ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.min_reconnection_delay > self.max_reconnection_delay {
            return Err(Error::InvalidConfig(format!(
                "minReconnectionDelay ({:?}) exceeds maxReconnectionDelay ({:?})",
                self.min_reconnection_delay, self.max_reconnection_delay
            )));
        }
        let factor = self.reconnection_delay_grow_factor;
        if factor.is_nan() || factor < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "reconnectionDelayGrowFactor must be >= 1, got {}",
                self.reconnection_delay_grow_factor
            )));
        }
        if self.connection_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "connectionTimeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket options for one connect, with a freshly jittered minimum delay.
    pub(crate) fn socket_options(&self) -> SocketOptions {
        let min_reconnection_delay =
            jittered_delay(self.min_reconnection_delay, self.reconnection_jitter)
                .min(self.max_reconnection_delay);
        SocketOptions {
            max_reconnection_delay: self.max_reconnection_delay,
            min_reconnection_delay,
            reconnection_delay_grow_factor: self.reconnection_delay_grow_factor,
            connection_timeout: self.connection_timeout,
            max_retries: self.max_retries,
            debug: self.debug,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_minimal_json() {
        let config = ClientConfig::from_json(r#"{"url": "wss://stream.example.com/ws"}"#).unwrap();
        assert_eq!(config, ClientConfig::new("wss://stream.example.com/ws"));
        assert_eq!(config.max_reconnection_delay, Duration::from_secs(10));
        assert_eq!(config.min_reconnection_delay, Duration::from_secs(1));
        assert_eq!(config.connection_timeout, Duration::from_secs(4));
        assert_eq!(config.max_retries, 5);
        assert!(!config.debug);
    }

    #[test]
    fn overrides_in_milliseconds() {
        let config = ClientConfig::from_json(
            r#"{
                "url": "ws://127.0.0.1:9000",
                "maxReconnectionDelay": 30000,
                "minReconnectionDelay": 500,
                "connectionTimeout": 2000,
                "maxRetries": 12,
                "debug": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_reconnection_delay, Duration::from_millis(30_000));
        assert_eq!(config.min_reconnection_delay, Duration::from_millis(500));
        assert_eq!(config.connection_timeout, Duration::from_millis(2000));
        assert_eq!(config.max_retries, 12);
        assert!(config.debug);
    }

    #[test]
    fn serializes_back_to_milliseconds() {
        let json = serde_json::to_value(ClientConfig::new("ws://localhost")).unwrap();
        assert_eq!(json["maxReconnectionDelay"], 10_000);
        assert_eq!(json["connectionTimeout"], 4_000);
    }

    #[test]
    fn url_is_required() {
        assert!(matches!(
            ClientConfig::from_json(r#"{"debug": true}"#),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        let err = ClientConfig::new("https://example.com").validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(matches!(
            ClientConfig::new("not a url").validate(),
            Err(Error::Url(_))
        ));
    }

    #[test]
    fn rejects_inverted_delays_and_bad_factor() {
        let mut config = ClientConfig::new("ws://localhost");
        config.min_reconnection_delay = Duration::from_secs(20);
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new("ws://localhost");
        config.reconnection_delay_grow_factor = 0.9;
        assert!(config.validate().is_err());

        config.reconnection_delay_grow_factor = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn socket_options_jitter_minimum_delay() {
        let config = ClientConfig::new("ws://localhost");
        for _ in 0..100 {
            let options = config.socket_options();
            assert!(options.min_reconnection_delay >= config.min_reconnection_delay);
            assert!(options.min_reconnection_delay <= config.max_reconnection_delay);
            assert_eq!(options.max_retries, config.max_retries);
        }
    }
}
