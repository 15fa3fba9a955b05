use std::fmt::Write as _;

use hyper::Uri;
use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::snapshot::SnapshotBody;

/// Hex characters of the SHA-256 digest kept in a key.
pub const HASH_PREFIX_LEN: usize = 12;
const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug)]
pub enum FingerprintError {
    InvalidUrl {
        url: String,
        source: hyper::http::uri::InvalidUri,
    },
    Canonicalize(serde_json::Error),
}

impl std::fmt::Display for FingerprintError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl { url, .. } => write!(f, "parse request URL `{url}`"),
            Self::Canonicalize(_) => write!(f, "serialize request for fingerprinting"),
        }
    }
}

impl std::error::Error for FingerprintError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidUrl { source, .. } => Some(source),
            Self::Canonicalize(source) => Some(source),
        }
    }
}

#[derive(Serialize)]
struct CanonicalRequest<'a> {
    url: &'a str,
    body: Option<&'a SnapshotBody>,
}

/// Derives the snapshot key for a request as `{path}-{model}-{hash}`.
///
/// - `path`: the URL path with `/` replaced by `-` and the leading separator dropped
/// - `model`: the body's top-level `model` string with `/` and `:` replaced by `-`, or
///   `unknown`
/// - `hash`: the first 12 hex characters of SHA-256 over `{"url": .., "body": ..}` serialized
///   as JSON. Object keys serialize in sorted order, so key order in the request body does
///   not change the result.
///
/// Headers and the HTTP method are not part of the key.
pub fn fingerprint(url: &str, body: Option<&SnapshotBody>) -> Result<String, FingerprintError> {
    let uri: Uri = url.parse().map_err(|source| FingerprintError::InvalidUrl {
        url: url.to_owned(),
        source,
    })?;

    let canonical = serde_json::to_vec(&CanonicalRequest { url, body })
        .map_err(FingerprintError::Canonicalize)?;
    let digest = Sha256::digest(&canonical);

    let mut key = path_segment(&uri);
    key.push('-');
    key.push_str(&model_segment(body));
    key.push('-');
    for byte in &digest[..HASH_PREFIX_LEN / 2] {
        let _ = write!(key, "{byte:02x}");
    }
    Ok(key)
}

fn path_segment(uri: &Uri) -> String {
    let path = uri.path().replace('/', "-");
    path.strip_prefix('-').map(str::to_owned).unwrap_or(path)
}

fn model_segment(body: Option<&SnapshotBody>) -> String {
    body.and_then(SnapshotBody::model)
        .map(|model| model.replace(['/', ':'], "-"))
        .unwrap_or_else(|| UNKNOWN_MODEL.to_owned())
}
