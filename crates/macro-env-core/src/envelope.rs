//! Protocol envelope exchanged over the bus.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Protocol operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Ask the holder for the value of a variable.
    Get,
    /// Holder reply to a `get`.
    GetResponse,
    /// Write (or, without a value, remove) a variable.
    Set,
    /// Missing or unknown operation.
    #[default]
    Unrecognized,
}

impl Operation {
    fn from_wire(name: &str) -> Self {
        match name {
            "get" => Self::Get,
            "get_response" => Self::GetResponse,
            "set" => Self::Set,
            _ => Self::Unrecognized,
        }
    }
}

// Foreign tools share the bus, so any operation value (even a non-string)
// must still yield an envelope the handlers can report on.
impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(raw.as_str().map_or(Self::Unrecognized, Self::from_wire))
    }
}

/// A single protocol message.
///
/// `value` and `id` are omitted from the wire when absent, so envelopes
/// stay readable by peers that only know the `env`/`operation`/`value` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Variable name.
    pub env: String,

    /// Operation requested.
    #[serde(default)]
    pub operation: Operation,

    /// Carried value (set payload, or get_response result).
    ///
    /// A missing field is `None`; an explicit `null` is `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,

    /// Correlation id of the originating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

// Only called when the field is present, so `null` must not collapse to `None`.
fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    /// Build a `get` request with a fresh correlation id.
    #[must_use]
    pub fn get(env: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            operation: Operation::Get,
            value: None,
            id: Some(Uuid::new_v4()),
        }
    }

    /// Build a `set` request.
    #[must_use]
    pub fn set(env: impl Into<String>, value: Value) -> Self {
        Self {
            env: env.into(),
            operation: Operation::Set,
            value: Some(value),
            id: Some(Uuid::new_v4()),
        }
    }

    /// Build a `set` request without a value, which removes the variable.
    #[must_use]
    pub fn unset(env: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            operation: Operation::Set,
            value: None,
            id: Some(Uuid::new_v4()),
        }
    }

    /// Build the reply to this request, echoing its name and correlation id.
    #[must_use]
    pub fn reply(&self, value: Option<Value>) -> Self {
        Self {
            env: self.env.clone(),
            operation: Operation::GetResponse,
            value,
            id: self.id,
        }
    }

    /// Whether this envelope answers the request `request`.
    ///
    /// Replies carrying an id must match the request id exactly; replies
    /// without one are matched on the variable name alone.
    #[must_use]
    pub fn answers(&self, request: &Self) -> bool {
        if self.operation != Operation::GetResponse {
            return false;
        }
        match self.id {
            Some(id) => request.id == Some(id),
            None => self.env == request.env,
        }
    }
}
