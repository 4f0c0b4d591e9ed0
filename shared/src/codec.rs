//! JSON text codec for tunnel envelopes.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::protocol::{Headers, RequestBody, TunnelEnvelope};

#[derive(Deserialize)]
struct RegisterFields {
    id: String,
}

/// Decode one inbound message.
///
/// A missing or unknown `type` yields [`DecodeError::MissingType`] or
/// [`DecodeError::UnknownType`]; callers treat those as "not a request".
pub fn decode(raw: &[u8]) -> Result<TunnelEnvelope, DecodeError> {
    let value: Value = serde_json::from_slice(raw).map_err(DecodeError::Malformed)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(DecodeError::MissingType),
    };

    match kind.as_str() {
        "register" => fields::<RegisterFields>("register", value)
            .map(|r| TunnelEnvelope::Register { id: r.id }),
        "request" => fields("request", value).map(TunnelEnvelope::Request),
        "response" => fields("response", value).map(TunnelEnvelope::Response),
        _ => Err(DecodeError::UnknownType(kind)),
    }
}

fn fields<T: DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidEnvelope { kind, source })
}

/// Encode an envelope as JSON text
pub fn encode(envelope: &TunnelEnvelope) -> String {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::from(envelope.kind()));

    match envelope {
        TunnelEnvelope::Register { id } => {
            obj.insert("id".into(), Value::from(id.as_str()));
        }
        TunnelEnvelope::Request(req) => {
            obj.insert("id".into(), Value::from(req.id.as_str()));
            obj.insert("method".into(), Value::from(req.method.as_str()));
            obj.insert("path".into(), Value::from(req.path.as_str()));
            obj.insert("headers".into(), headers_json(&req.headers));
            if let Some(body) = &req.body {
                obj.insert("body".into(), body_json(body));
            }
        }
        TunnelEnvelope::Response(resp) => {
            obj.insert("id".into(), Value::from(resp.id.as_str()));
            obj.insert("statusCode".into(), Value::from(resp.status_code));
            obj.insert("headers".into(), headers_json(&resp.headers));
            obj.insert("body".into(), Value::from(resp.body.as_str()));
        }
    }

    Value::Object(obj).to_string()
}

fn headers_json(headers: &Headers) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

// Binary bodies can only travel as tagged buffers in JSON.
fn body_json(body: &RequestBody) -> Value {
    match body {
        RequestBody::Text(s) => Value::from(s.as_str()),
        RequestBody::Other(v) => v.clone(),
        RequestBody::Bytes(b) | RequestBody::TaggedBuffer(b) => {
            let mut obj = Map::new();
            obj.insert("type".into(), Value::from("Buffer"));
            obj.insert("data".into(), Value::Array(b.iter().map(|&n| Value::from(n)).collect()));
            Value::Object(obj)
        }
    }
}

/// Reduce any body shape to the bytes sent to the local service.
///
/// Tagged buffers yield their byte values, strings their UTF-8 bytes, native
/// buffers pass through, anything else is rendered as text first
/// (scalars in their plain form, arrays and objects as compact JSON).
pub fn normalize_body(body: &RequestBody) -> Vec<u8> {
    match body {
        RequestBody::TaggedBuffer(bytes) => bytes.clone(),
        RequestBody::Text(s) => s.as_bytes().to_vec(),
        RequestBody::Bytes(bytes) => bytes.clone(),
        RequestBody::Other(value) => value.to_string().into_bytes(),
    }
}
