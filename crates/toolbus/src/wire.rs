//! Wire messages exchanged over the tool bus.
//!
//! Payloads travel as raw bytes. Handlers produce [`Reply`] values, which the
//! bus normalizes into the response and chunk messages defined here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_core::json::canonical_string;

/// Outcome of a tool bus call. Serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StatusCode {
    #[default]
    Ok,
    Error,
    NotFound,
    Unavailable,
    GuardRejected,
}

impl StatusCode {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::NotFound => 2,
            Self::Unavailable => 3,
            Self::GuardRejected => 4,
        }
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl From<StatusCode> for u8 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Error),
            2 => Ok(Self::NotFound),
            3 => Ok(Self::Unavailable),
            4 => Ok(Self::GuardRejected),
            other => Err(format!("unknown status code {other}")),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Unavailable => "UNAVAILABLE",
            Self::GuardRejected => "GUARD_REJECTED",
        };
        f.write_str(name)
    }
}

/// Addressing and metadata shared by every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub request_id: String,
    pub tool: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Header {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            tool: tool.into(),
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub header: Header,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl InvokeRequest {
    pub fn new(tool: impl Into<String>, payload: impl Into<PayloadValue>) -> Self {
        Self {
            header: Header::new(tool),
            payload: payload.into().encode(),
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.header.request_id = request_id.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub request_id: String,
    pub status: StatusCode,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub error: Option<String>,
}

impl InvokeResponse {
    /// Decode the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON.
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.payload)
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub header: Header,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl StreamRequest {
    pub fn new(tool: impl Into<String>, payload: impl Into<PayloadValue>) -> Self {
        Self {
            header: Header::new(tool),
            payload: payload.into().encode(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    pub end_of_stream: bool,
    pub status: StatusCode,
    #[serde(default)]
    pub error: Option<String>,
}

impl StreamChunk {
    /// Terminal chunk for a stream that finished cleanly.
    pub fn end(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            payload: Vec::new(),
            end_of_stream: true,
            status: StatusCode::Ok,
            error: None,
        }
    }

    /// Terminal chunk carrying a failure.
    pub fn failure(
        request_id: impl Into<String>,
        status: StatusCode,
        error: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            payload: Vec::new(),
            end_of_stream: true,
            status,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub header: Header,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl SubscribeRequest {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            header: Header::new(tool),
            topics: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }
}

/// A published message delivered to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub request_id: String,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: impl Into<PayloadValue>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into().encode(),
            metadata: BTreeMap::new(),
            request_id: String::new(),
        }
    }

    /// Decode the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON.
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.payload)
    }
}

/// A payload before encoding: raw bytes, UTF-8 text or JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
}

impl PayloadValue {
    /// Encode to wire bytes. JSON is written with sorted keys.
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.into_bytes(),
            Self::Json(value) => canonical_string(&value).into_bytes(),
        }
    }
}

impl From<Vec<u8>> for PayloadValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for PayloadValue {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<String> for PayloadValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for PayloadValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for PayloadValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// What a handler hands back for one response or chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub payload: Vec<u8>,
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(payload: impl Into<PayloadValue>) -> Self {
        Self {
            status: StatusCode::Ok,
            payload: payload.into().encode(),
            error: None,
        }
    }

    pub fn with_status(payload: impl Into<PayloadValue>, status: StatusCode) -> Self {
        Self {
            status,
            payload: payload.into().encode(),
            error: None,
        }
    }

    pub(crate) fn into_response(self, request_id: &str) -> InvokeResponse {
        InvokeResponse {
            request_id: request_id.to_string(),
            status: self.status,
            payload: self.payload,
            error: self.error,
        }
    }

    pub(crate) fn into_chunk(self, request_id: &str) -> StreamChunk {
        StreamChunk {
            request_id: request_id.to_string(),
            payload: self.payload,
            end_of_stream: false,
            status: self.status,
            error: self.error,
        }
    }
}

macro_rules! reply_from_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Reply {
                fn from(payload: $ty) -> Self {
                    Self::ok(payload)
                }
            }

            impl From<($ty, StatusCode)> for Reply {
                fn from((payload, status): ($ty, StatusCode)) -> Self {
                    Self::with_status(payload, status)
                }
            }
        )*
    };
}

reply_from_payload!(PayloadValue, Vec<u8>, String, &str, Value);

impl From<InvokeResponse> for Reply {
    fn from(response: InvokeResponse) -> Self {
        Self {
            status: response.status,
            payload: response.payload,
            error: response.error,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    #[test]
    fn should_serialize_status_as_integer() {
        let chunk = StreamChunk::failure("r1", StatusCode::GuardRejected, "nope");
        let encoded = serde_json::to_value(&chunk).unwrap();

        assert_eq!(encoded["status"], json!(4));
        let decoded: StreamChunk = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.status, StatusCode::GuardRejected);
    }

    #[test]
    fn should_reject_unknown_status_code() {
        let result: Result<StatusCode, _> = serde_json::from_value(json!(9));
        assert!(result.is_err());
    }

    #[test]
    fn should_encode_json_payload_with_sorted_keys() {
        let bytes = PayloadValue::from(json!({"b": 2, "a": 1})).encode();
        assert_eq!(bytes, br#"{"a":1,"b":2}"#.to_vec());
    }

    #[test]
    fn should_normalize_payload_status_pair() {
        let reply = Reply::from(("busy", StatusCode::Unavailable));
        assert_eq!(reply.status, StatusCode::Unavailable);
        assert_eq!(reply.payload, b"busy".to_vec());
    }

    #[test]
    fn should_default_bare_payload_to_ok() {
        let reply = Reply::from(b"raw".to_vec());
        assert_eq!(reply.status, StatusCode::Ok);
        assert!(reply.error.is_none());
    }
}
