//! Inbound frame classification and subscription keys.

use serde::Serialize;
use serde_json::Value;

use crate::types::{BoxError, ConnectionMessage, Error, SubscriptionMessage};

/// Classifies parsed JSON frames into connection and data messages.
///
/// Both methods see every frame; returning `Ok(None)` means "not mine".
/// Errors are reported by the client and the frame is dropped.
pub trait MessageParser: Send + Sync {
    fn parse_connection_message(&self, raw: &Value) -> Result<Option<ConnectionMessage>, BoxError>;
    fn parse_message(&self, raw: &Value) -> Result<Option<SubscriptionMessage>, BoxError>;
}

const CONNECTED_TYPE: &str = "connected";

/// Default classifier.
///
/// - `{"type": "connected", "connectionId": "..."}` establishes a connection.
/// - `{"channel": "...", "key": "...", "data": ...}` is a data frame. A frame may
///   carry `"params"` instead of `"key"`; the key is then derived with
///   [`default_subscription_key`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageParser;

impl MessageParser for JsonMessageParser {
    fn parse_connection_message(&self, raw: &Value) -> Result<Option<ConnectionMessage>, BoxError> {
        if raw.get("type").and_then(Value::as_str) != Some(CONNECTED_TYPE) {
            return Ok(None);
        }
        let connection_id = raw
            .get("connectionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or("connected frame without connectionId")?;
        Ok(Some(ConnectionMessage {
            connection_id: connection_id.to_string(),
        }))
    }

    fn parse_message(&self, raw: &Value) -> Result<Option<SubscriptionMessage>, BoxError> {
        let Some(channel) = raw.get("channel").and_then(Value::as_str) else {
            return Ok(None);
        };
        let key = match (raw.get("key"), raw.get("params")) {
            (Some(Value::String(key)), _) => key.clone(),
            (Some(other), _) => {
                return Err(format!("subscription key must be a string, got {other}").into());
            }
            (None, Some(params)) => default_subscription_key(channel, params)?,
            (None, None) => return Ok(None),
        };
        Ok(Some(SubscriptionMessage {
            channel: channel.to_string(),
            key,
            data: raw.get("data").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Derive the subscription key for `(channel, params)`.
///
/// The params are rendered as JSON with object fields sorted recursively, so
/// structurally equal params map to the same key regardless of field order.
pub fn default_subscription_key<P: Serialize + ?Sized>(
    channel: &str,
    params: &P,
) -> Result<String, Error> {
    let value = serde_json::to_value(params).map_err(Error::InvalidParams)?;
    Ok(format!("{channel}:{}", canonicalize(value)))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(String, Value)> = map.into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    #[test]
    fn key_ignores_field_order() {
        let a = json!({"channel": "prices", "id": "token-1", "opts": {"x": 1, "y": 2}});
        let b = json!({"opts": {"y": 2, "x": 1}, "id": "token-1", "channel": "prices"});
        assert_eq!(
            default_subscription_key("prices", &a).unwrap(),
            default_subscription_key("prices", &b).unwrap()
        );
    }

    #[test]
    fn key_distinguishes_channel_and_values() {
        let params = json!({"id": "token-1"});
        let k1 = default_subscription_key("prices", &params).unwrap();
        let k2 = default_subscription_key("trades", &params).unwrap();
        let k3 = default_subscription_key("prices", &json!({"id": "token-2"})).unwrap();
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1, r#"prices:{"id":"token-1"}"#);
    }

    #[test]
    fn key_from_struct_matches_key_from_json() {
        #[derive(Serialize)]
        struct Params {
            id: String,
            channel: String,
        }
        let typed = Params {
            id: "token-1".into(),
            channel: "prices".into(),
        };
        let untyped = json!({"channel": "prices", "id": "token-1"});
        assert_eq!(
            default_subscription_key("prices", &typed).unwrap(),
            default_subscription_key("prices", &untyped).unwrap()
        );
    }

    #[test]
    fn key_rejects_unserializable_params() {
        let mut params = HashMap::new();
        params.insert((1, 2), "tuple keys are not valid JSON object keys");
        let err = default_subscription_key("prices", &params).unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[test]
    fn parses_connected_frame() {
        let parser = JsonMessageParser;
        let msg = parser
            .parse_connection_message(&json!({"type": "connected", "connectionId": "conn-123"}))
            .unwrap();
        assert_eq!(
            msg,
            Some(ConnectionMessage {
                connection_id: "conn-123".into()
            })
        );
        assert_eq!(
            parser
                .parse_connection_message(&json!({"type": "message"}))
                .unwrap(),
            None
        );
    }

    #[test]
    fn connected_frame_without_id_is_an_error() {
        let parser = JsonMessageParser;
        assert!(
            parser
                .parse_connection_message(&json!({"type": "connected"}))
                .is_err()
        );
    }

    #[test]
    fn parses_data_frame_with_key() {
        let parser = JsonMessageParser;
        let msg = parser
            .parse_message(&json!({"channel": "prices", "key": "k1", "data": {"p": 1.5}}))
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel, "prices");
        assert_eq!(msg.key, "k1");
        assert_eq!(msg.data, json!({"p": 1.5}));
    }

    #[test]
    fn data_frame_with_params_derives_key() {
        let parser = JsonMessageParser;
        let params = json!({"id": "token-1", "channel": "prices"});
        let msg = parser
            .parse_message(&json!({"channel": "prices", "params": params, "data": 1}))
            .unwrap()
            .unwrap();
        assert_eq!(msg.key, default_subscription_key("prices", &params).unwrap());
    }

    #[test]
    fn unrelated_frames_are_ignored() {
        let parser = JsonMessageParser;
        assert_eq!(parser.parse_message(&json!({"type": "pong"})).unwrap(), None);
        assert_eq!(parser.parse_message(&json!({"channel": "prices"})).unwrap(), None);
        assert!(parser.parse_message(&json!({"channel": "prices", "key": 5})).is_err());
    }
}
