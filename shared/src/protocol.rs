//! Envelope types for RevTun tunnel communication.

use serde::{de, Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Maximum message size (1 GiB). Proxied bodies travel inside a single frame.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

/// Header map as carried inside request and response envelopes
pub type Headers = BTreeMap<String, HeaderValue>;

/// A header value: either a single string or a list for repeated headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    /// All values in the order they were given
    pub fn as_slice(&self) -> &[String] {
        match self {
            HeaderValue::Single(v) => std::slice::from_ref(v),
            HeaderValue::Multi(v) => v,
        }
    }

    pub(crate) fn to_json(&self) -> Value {
        match self {
            HeaderValue::Single(v) => Value::String(v.clone()),
            HeaderValue::Multi(v) => Value::Array(v.iter().cloned().map(Value::String).collect()),
        }
    }
}

// Numbers and booleans are accepted and stringified, alone or inside a list.
impl<'de> Deserialize<'de> for HeaderValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Array(items) => items
                .into_iter()
                .map(scalar_string::<D::Error>)
                .collect::<Result<Vec<_>, _>>()
                .map(HeaderValue::Multi),
            other => scalar_string(other).map(HeaderValue::Single),
        }
    }
}

fn scalar_string<E: de::Error>(value: Value) -> Result<String, E> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(E::custom(format!(
            "header value must be a string, number or boolean, got {}",
            other
        ))),
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Single(v)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(mut v: Vec<String>) -> Self {
        if v.len() == 1 {
            HeaderValue::Single(v.remove(0))
        } else {
            HeaderValue::Multi(v)
        }
    }
}

/// One discrete message exchanged over the tunnel connection
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEnvelope {
    /// Sent once per connection to announce the agent identity
    Register { id: String },
    /// Received from the broker
    Request(RequestEnvelope),
    /// Sent back for every request, correlated by `id`
    Response(ResponseEnvelope),
}

impl TunnelEnvelope {
    /// Wire discriminant of this envelope
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelEnvelope::Register { .. } => "register",
            TunnelEnvelope::Request(_) => "request",
            TunnelEnvelope::Response(_) => "response",
        }
    }
}

/// HTTP request description received from the broker
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<RequestBody>,
}

/// Local service response relayed back to the broker
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

/// Request body in whichever shape it arrived.
///
/// A binary body that went through a JSON serializer on the broker side shows
/// up as `{"type": "Buffer", "data": [..]}`. See [`crate::normalize_body`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Native binary buffer
    Bytes(Vec<u8>),
    /// Plain string
    Text(String),
    /// Tagged-buffer object, already reduced to its byte values
    TaggedBuffer(Vec<u8>),
    /// Any other JSON value
    Other(Value),
}

impl RequestBody {
    /// Classify a JSON value. The tagged-buffer check runs before the string
    /// check since the tagged form is an object, never a string.
    pub fn from_json(value: Value) -> Self {
        if let Some(bytes) = tagged_buffer_bytes(&value) {
            return RequestBody::TaggedBuffer(bytes);
        }
        match value {
            Value::String(s) => RequestBody::Text(s),
            other => RequestBody::Other(other),
        }
    }
}

impl<'de> Deserialize<'de> for RequestBody {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Value::deserialize(deserializer).map(RequestBody::from_json)
    }
}

/// Bytes of a `{"type":"Buffer","data":[..]}` object, if `value` is one.
/// Every entry of `data` must be an integer in `0..=255`.
fn tagged_buffer_bytes(value: &Value) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    if obj.get("type").and_then(Value::as_str) != Some("Buffer") {
        return None;
    }
    obj.get("data")?
        .as_array()?
        .iter()
        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}
