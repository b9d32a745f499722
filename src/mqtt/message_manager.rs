//! Payload handling for both directions.
//!
//! Inbound payloads are decoded leniently: JSON when it parses, raw text
//! otherwise. Outbound payloads are encoded by content type before they are
//! handed to the client.

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::trace;

/// Decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    /// Decodes raw bytes, falling back to (lossy) text when they are not JSON.
    pub fn decode(raw: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => Payload::Json(value),
            Err(e) => {
                trace!("Payload is not JSON, delivering raw text: {}", e);
                Payload::Text(String::from_utf8_lossy(raw).into_owned())
            }
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Json(_) => None,
        }
    }

    /// Deserializes into `T`. Text payloads are treated as a JSON string.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Payload::Json(value) => T::deserialize(value),
            Payload::Text(text) => T::deserialize(Value::String(text.clone())),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Json(value) => write!(f, "{}", value),
            Payload::Text(text) => f.write_str(text),
        }
    }
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Payload,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn from_raw(topic: impl Into<String>, raw: &[u8]) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: Payload::decode(raw),
            received_at: Local::now(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        self.payload.deserialize()
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload
        )
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = self.payload.to_string();
        let preview: String = content.chars().take(40).collect();
        write!(f, "{} - {}", self.received_at.format("%H:%M:%S"), preview)
    }
}

/// Outgoing payload, encoded by content type.
///
/// Binary passes through untouched, scalars are stringified and structured
/// values are JSON-encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundPayload {
    Binary(Vec<u8>),
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
    Json(Value),
}

impl OutboundPayload {
    /// JSON-encodes any serializable value; strings and scalars keep their
    /// stringified form.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(serde_json::to_value(value)?.into())
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            OutboundPayload::Binary(bytes) => Ok(bytes.clone()),
            OutboundPayload::Text(text) => Ok(text.as_bytes().to_vec()),
            OutboundPayload::Number(number) => Ok(number_text(number).into_bytes()),
            OutboundPayload::Bool(flag) => Ok(flag.to_string().into_bytes()),
            OutboundPayload::Json(value) => serde_json::to_vec(value),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            OutboundPayload::Binary(bytes) => Ok(bytes),
            OutboundPayload::Text(text) => Ok(text.into_bytes()),
            other => other.encode(),
        }
    }
}

impl From<Value> for OutboundPayload {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => OutboundPayload::Text(text),
            Value::Number(number) => OutboundPayload::Number(number),
            Value::Bool(flag) => OutboundPayload::Bool(flag),
            structured => OutboundPayload::Json(structured),
        }
    }
}

impl From<Vec<u8>> for OutboundPayload {
    fn from(bytes: Vec<u8>) -> Self {
        OutboundPayload::Binary(bytes)
    }
}

impl From<&[u8]> for OutboundPayload {
    fn from(bytes: &[u8]) -> Self {
        OutboundPayload::Binary(bytes.to_vec())
    }
}

impl From<String> for OutboundPayload {
    fn from(text: String) -> Self {
        OutboundPayload::Text(text)
    }
}

impl From<&str> for OutboundPayload {
    fn from(text: &str) -> Self {
        OutboundPayload::Text(text.to_string())
    }
}

impl From<bool> for OutboundPayload {
    fn from(flag: bool) -> Self {
        OutboundPayload::Bool(flag)
    }
}

macro_rules! number_payload {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for OutboundPayload {
                fn from(n: $ty) -> Self {
                    OutboundPayload::Number(n.into())
                }
            }
        )*
    };
}

number_payload!(i8, i16, i32, i64, u8, u16, u32, u64);

/// Shortest decimal form; integral floats drop the fraction (`1.0` -> `1`).
fn number_text(number: &serde_json::Number) -> String {
    match number.as_f64() {
        Some(n) if number.is_f64() => n.to_string(),
        _ => number.to_string(),
    }
}

fn non_finite_text(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n > 0.0 {
        "Infinity".to_string()
    } else {
        "-Infinity".to_string()
    }
}

impl From<f64> for OutboundPayload {
    fn from(n: f64) -> Self {
        match serde_json::Number::from_f64(n) {
            Some(number) => OutboundPayload::Number(number),
            // NaN and infinities have no JSON form
            None => OutboundPayload::Text(non_finite_text(n)),
        }
    }
}

impl From<f32> for OutboundPayload {
    fn from(n: f32) -> Self {
        // parse the f32's own shortest form so 0.1f32 stays 0.1
        match n.to_string().parse::<serde_json::Number>() {
            Ok(number) => OutboundPayload::Number(number),
            Err(_) => OutboundPayload::Text(non_finite_text(f64::from(n))),
        }
    }
}
