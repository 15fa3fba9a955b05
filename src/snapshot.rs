//! Persisted request/response exchanges.
//!
//! A [`Snapshot`] is written once per fingerprint and never edited in place; re-recording
//! replaces the file wholesale. Buffered responses keep their decoded body in
//! [`SnapshotResponse::body`], streaming responses keep the ordered text chunks in
//! [`SnapshotResponse::chunks`] and leave `body` empty.

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response headers dropped from recordings unless sensitive headers are explicitly allowed.
pub const SENSITIVE_RESPONSE_HEADERS: &[&str] =
    &["set-cookie", "x-request-id", "cf-ray", "x-q-stat", "date"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: String,
    pub request: SnapshotRequest,
    pub response: SnapshotResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at_unix_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub method: String,
    pub url: String,
    pub body: Option<SnapshotBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<SnapshotBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<String>>,
}

/// A request or response payload: decoded JSON when it parses, raw bytes otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotBody {
    Json(Value),
    Bytes(Vec<u8>),
}

/// Which test produced a snapshot. Supplied by the caller; never discovered implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestContext {
    /// Shown in miss errors. When it is a harness path (`module::test_fn`) the record hint
    /// also suggests `-- --exact <name>`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl TestContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl SnapshotBody {
    /// Decodes a payload, returning `None` for an empty one.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        Some(match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Bytes(bytes.to_vec()),
        })
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Bytes(_) => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            // Serializing an in-memory `Value` cannot fail.
            Self::Json(value) => Bytes::from(serde_json::to_vec(value).unwrap_or_default()),
            Self::Bytes(bytes) => Bytes::copy_from_slice(bytes),
        }
    }

    /// A request declares itself streaming with a top-level `"stream": true`.
    pub fn requests_stream(&self) -> bool {
        self.as_json()
            .and_then(|value| value.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn model(&self) -> Option<&str> {
        self.as_json()
            .and_then(|value| value.get("model"))
            .and_then(Value::as_str)
    }
}

impl SnapshotResponse {
    pub fn buffered(status: u16, headers: BTreeMap<String, String>, body: Option<SnapshotBody>) -> Self {
        Self {
            status,
            headers,
            body,
            chunks: None,
        }
    }

    pub fn streamed(status: u16, headers: BTreeMap<String, String>, chunks: Vec<String>) -> Self {
        Self {
            status,
            headers,
            body: None,
            chunks: Some(chunks),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.chunks.is_some()
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_RESPONSE_HEADERS
        .iter()
        .any(|sensitive| sensitive.eq_ignore_ascii_case(name))
}

/// Flattens response headers into the persisted map. Repeated headers are joined with `, `
/// and names are lowercased; denylisted names are dropped unless `allow_sensitive` is set.
pub fn sanitize_headers(headers: &HeaderMap, allow_sensitive: bool) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if !allow_sensitive && is_sensitive_header(name) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes());
        out.entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    out
}
