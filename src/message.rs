use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ReverbError, Result};

/// Pusher protocol event names.
pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const MEMBER_REMOVED: &str = "pusher_internal:member_removed";
}

/// Prefix carried by client-originated events.
pub const CLIENT_EVENT_PREFIX: &str = "client-";

/// A decoded protocol envelope.
///
/// On the wire `data` is a JSON-encoded string even when it represents a
/// nested object; the codec hides that. Upper layers only ever see the
/// parsed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Deserialize)]
struct WireEnvelope {
    event: Option<String>,
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Message {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            channel: None,
            data,
        }
    }

    pub fn on_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    /// Decode a wire frame.
    ///
    /// A string `data` field is try-parsed as nested JSON; if the inner parse
    /// fails the raw string is preserved as-is. Malformed outer JSON or a
    /// missing `event` field is a protocol error.
    pub fn from_wire(raw: &str) -> Result<Self> {
        let envelope: WireEnvelope = serde_json::from_str(raw)
            .map_err(|e| ReverbError::Protocol(format!("malformed envelope: {e}")))?;

        let event = envelope
            .event
            .ok_or_else(|| ReverbError::Protocol("envelope is missing event".into()))?;

        let data = match envelope.data {
            Value::String(inner) => match serde_json::from_str::<Value>(&inner) {
                Ok(parsed) => parsed,
                Err(_) => Value::String(inner),
            },
            other => other,
        };

        Ok(Self {
            event,
            channel: envelope.channel,
            data,
        })
    }

    /// Encode for the wire.
    ///
    /// Structured `data` (object or array) is JSON-encoded and placed as a
    /// string value in the outer object, matching what the broker expects.
    pub fn to_wire(&self) -> Result<String> {
        let mut envelope = serde_json::Map::new();
        envelope.insert("event".into(), Value::String(self.event.clone()));
        if let Some(channel) = &self.channel {
            envelope.insert("channel".into(), Value::String(channel.clone()));
        }

        let data = match &self.data {
            Value::Object(_) | Value::Array(_) => Value::String(serde_json::to_string(&self.data)?),
            other => other.clone(),
        };
        envelope.insert("data".into(), data);

        Ok(serde_json::to_string(&Value::Object(envelope))?)
    }

    /// Whether this is a client-originated event name.
    pub fn is_client_event(event: &str) -> bool {
        event.starts_with(CLIENT_EVENT_PREFIX)
    }
}

/// Factories for the envelopes this client emits.
pub(crate) fn subscribe(channel: &str, auth: Option<String>, channel_data: Option<String>) -> Message {
    let mut data = serde_json::Map::new();
    data.insert("channel".into(), Value::String(channel.to_string()));
    if let Some(auth) = auth {
        data.insert("auth".into(), Value::String(auth));
    }
    if let Some(channel_data) = channel_data {
        data.insert("channel_data".into(), Value::String(channel_data));
    }
    Message::new(events::SUBSCRIBE, Value::Object(data))
}

pub(crate) fn unsubscribe(channel: &str) -> Message {
    Message::new(
        events::UNSUBSCRIBE,
        serde_json::json!({ "channel": channel }),
    )
}

pub(crate) fn ping() -> Message {
    Message::new(events::PING, serde_json::json!({}))
}

pub(crate) fn pong() -> Message {
    Message::new(events::PONG, serde_json::json!({}))
}

pub(crate) fn client_event(channel: &str, event: &str, data: Value) -> Message {
    let event = if Message::is_client_event(event) {
        event.to_string()
    } else {
        format!("{CLIENT_EVENT_PREFIX}{event}")
    };
    Message {
        event,
        channel: Some(channel.to_string()),
        data,
    }
}
