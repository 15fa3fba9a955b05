//! The fetch substitute: fingerprint, then record or replay.
//!
//! [`SnapshotFetch::fetch`] takes the place of a live HTTP call. In record mode the request
//! goes to the network and the response is written to the store. In playback mode the
//! response is rebuilt from the store, and a missing snapshot is resolved by the configured
//! [`MissBehavior`]. Every key looked up is remembered for [`SnapshotFetch::persist_accessed_keys`].
//!
//! Overrides set through the `set_*_override` methods apply to the whole instance until
//! cleared. Callers sharing one instance across concurrently running tests must not overlap
//! override-dependent work; there is no per-task isolation.

use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;
use http_body_util::BodyExt as _;
use hyper::{
    HeaderMap, Request, Response, StatusCode,
    header::{self, HeaderName, HeaderValue},
};

use crate::{
    access::{AccessTracker, AccessedKeysError},
    config::{Config, MissBehavior, SnapshotConfig, SnapshotMode},
    fingerprint::{FingerprintError, fingerprint},
    hint::{self, Invocation},
    snapshot::{
        Snapshot, SnapshotBody, SnapshotRequest, SnapshotResponse, TestContext, now_unix_ms,
        sanitize_headers,
    },
    store::{SnapshotStore, StoreError},
    stream::{BoxError, FetchBody, boxed_chunks, boxed_full, capture_chunks},
    transport::{HyperTransport, Transport},
};

/// The request could not be answered from a snapshot and policy forbids going live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMissingError {
    pub key: String,
    pub test: Option<TestContext>,
    pub hints: Vec<String>,
}

impl std::fmt::Display for SnapshotMissingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot not found: {}", self.key)?;
        if let Some(test) = self.test.as_ref() {
            write!(f, " (test `{}`", test.name)?;
            if let Some(file) = test.file.as_deref() {
                write!(f, " in {file}")?;
            }
            f.write_str(")")?;
        }
        f.write_str("\n\nTo record it, re-run your test with:\n")?;
        for hint in &self.hints {
            writeln!(f, "  {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SnapshotMissingError {}

/// Failure of one fetch. Apart from [`FetchError::SnapshotMissing`], each variant displays
/// and chains exactly like the error it carries.
#[derive(Debug)]
pub enum FetchError {
    SnapshotMissing(SnapshotMissingError),
    Transport(BoxError),
    Store(StoreError),
    Fingerprint(FingerprintError),
}

impl FetchError {
    pub fn as_snapshot_missing(&self) -> Option<&SnapshotMissingError> {
        match self {
            Self::SnapshotMissing(missing) => Some(missing),
            _ => None,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SnapshotMissing(err) => std::fmt::Display::fmt(err, f),
            Self::Transport(err) => std::fmt::Display::fmt(err, f),
            Self::Store(err) => std::fmt::Display::fmt(err, f),
            Self::Fingerprint(err) => std::fmt::Display::fmt(err, f),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SnapshotMissing(_) => None,
            Self::Transport(err) => err.source(),
            Self::Store(err) => err.source(),
            Self::Fingerprint(err) => err.source(),
        }
    }
}

impl From<StoreError> for FetchError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<FingerprintError> for FetchError {
    fn from(err: FingerprintError) -> Self {
        Self::Fingerprint(err)
    }
}

/// Mode and miss behaviour in effect for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub mode: SnapshotMode,
    pub on_miss: MissBehavior,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyOverrides {
    pub mode: Option<SnapshotMode>,
    pub on_miss: Option<MissBehavior>,
}

/// Clears every override when dropped.
#[must_use = "overrides are cleared as soon as the scope is dropped"]
pub struct OverrideScope<'a> {
    overrides: &'a Mutex<PolicyOverrides>,
}

impl Drop for OverrideScope<'_> {
    fn drop(&mut self) {
        *lock(self.overrides) = PolicyOverrides::default();
    }
}

/// A decoded outbound request, shared by the record and playback paths.
struct PreparedRequest {
    request: Request<Bytes>,
    key: String,
    url: String,
    body: Option<SnapshotBody>,
    streaming: bool,
}

pub struct SnapshotFetch<T = HyperTransport> {
    config: SnapshotConfig,
    store: SnapshotStore,
    transport: T,
    accessed: AccessTracker,
    overrides: Mutex<PolicyOverrides>,
}

impl SnapshotFetch<HyperTransport> {
    /// Builds an instance from `./snapfetch.toml` (if present) and `SNAPFETCH_*` variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Config::load(None)?;
        Self::new(config.snapshots)
    }

    pub fn new(config: SnapshotConfig) -> anyhow::Result<Self> {
        Ok(Self::with_transport(config, HyperTransport::new()?))
    }
}

impl<T: Transport> SnapshotFetch<T> {
    pub fn with_transport(config: SnapshotConfig, transport: T) -> Self {
        let store = SnapshotStore::new(config.dir.clone());
        Self {
            config,
            store,
            transport,
            accessed: AccessTracker::new(),
            overrides: Mutex::new(PolicyOverrides::default()),
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The configured policy with any active overrides applied.
    pub fn policy(&self) -> Policy {
        let overrides = *lock(&self.overrides);
        Policy {
            mode: overrides.mode.unwrap_or(self.config.mode),
            on_miss: overrides.on_miss.unwrap_or(self.config.on_miss),
        }
    }

    pub fn set_mode_override(&self, mode: SnapshotMode) {
        lock(&self.overrides).mode = Some(mode);
    }

    pub fn clear_mode_override(&self) {
        lock(&self.overrides).mode = None;
    }

    pub fn set_miss_override(&self, on_miss: MissBehavior) {
        lock(&self.overrides).on_miss = Some(on_miss);
    }

    pub fn clear_miss_override(&self) {
        lock(&self.overrides).on_miss = None;
    }

    pub fn clear_all_overrides(&self) {
        *lock(&self.overrides) = PolicyOverrides::default();
    }

    /// Applies `overrides` until the returned scope is dropped.
    pub fn override_scope(&self, overrides: PolicyOverrides) -> OverrideScope<'_> {
        *lock(&self.overrides) = overrides;
        OverrideScope {
            overrides: &self.overrides,
        }
    }

    pub fn accessed_keys(&self) -> BTreeSet<String> {
        self.accessed.keys()
    }

    /// Merges the keys seen by this instance into the store's accessed-keys file.
    pub async fn persist_accessed_keys(&self) -> Result<usize, AccessedKeysError> {
        self.accessed.persist(self.store.dir()).await
    }

    pub async fn fetch(&self, request: Request<Bytes>) -> Result<Response<FetchBody>, FetchError> {
        self.fetch_with(request, None).await
    }

    /// Like [`Self::fetch`], attaching `test` to any snapshot written and to miss errors.
    pub async fn fetch_with(
        &self,
        request: Request<Bytes>,
        test: Option<&TestContext>,
    ) -> Result<Response<FetchBody>, FetchError> {
        let prepared = prepare(request)?;
        self.accessed.record(&prepared.key);

        let policy = self.policy();
        tracing::debug!(
            key = %prepared.key,
            mode = policy.mode.as_str(),
            on_miss = policy.on_miss.as_str(),
            streaming = prepared.streaming,
            "snapshot fetch"
        );

        match policy.mode {
            SnapshotMode::Record => self.record(prepared, test).await,
            SnapshotMode::Playback => self.playback(prepared, policy.on_miss, test).await,
        }
    }

    async fn record(
        &self,
        prepared: PreparedRequest,
        test: Option<&TestContext>,
    ) -> Result<Response<FetchBody>, FetchError> {
        let PreparedRequest {
            request,
            key,
            url,
            body: request_body,
            streaming,
        } = prepared;
        let method = request.method().to_string();

        let response = self
            .transport
            .send(request)
            .await
            .map_err(FetchError::Transport)?;
        let (mut parts, live_body) = response.into_parts();
        let headers = sanitize_headers(&parts.headers, self.config.allow_sensitive_headers);
        let status = parts.status.as_u16();

        let (snapshot_response, replay_body) = if streaming {
            let chunks = capture_chunks(live_body)
                .await
                .map_err(FetchError::Transport)?;
            (
                SnapshotResponse::streamed(status, headers, chunks.clone()),
                ReplayBody::Chunks(chunks),
            )
        } else {
            let bytes = live_body
                .collect()
                .await
                .map_err(FetchError::Transport)?
                .to_bytes();
            let body = SnapshotBody::from_bytes(&bytes);
            let replay = body.as_ref().map(SnapshotBody::to_bytes).unwrap_or_default();
            (
                SnapshotResponse::buffered(status, headers, body),
                ReplayBody::Buffered(replay),
            )
        };

        let snapshot = Snapshot {
            key,
            request: SnapshotRequest {
                method,
                url,
                body: request_body,
            },
            response: snapshot_response,
            test: test.cloned(),
            recorded_at_unix_ms: Some(now_unix_ms()),
        };
        let path = self.store.persist(&snapshot).await?;
        tracing::info!(
            key = %snapshot.key,
            status,
            streaming,
            path = %path.display(),
            "snapshot recorded"
        );

        let body = replay_body.finalize(&mut parts.headers);
        Ok(Response::from_parts(parts, body))
    }

    async fn playback(
        &self,
        prepared: PreparedRequest,
        on_miss: MissBehavior,
        test: Option<&TestContext>,
    ) -> Result<Response<FetchBody>, FetchError> {
        if let Some(snapshot) = self.store.load(&prepared.key).await? {
            tracing::debug!(key = %prepared.key, "snapshot hit");
            return Ok(response_from_snapshot(snapshot.response));
        }

        match on_miss {
            MissBehavior::Error => {
                let invocation = Invocation::current(test);
                Err(FetchError::SnapshotMissing(SnapshotMissingError {
                    key: prepared.key,
                    test: test.cloned(),
                    hints: hint::record_hints(&invocation),
                }))
            }
            MissBehavior::Warn => {
                tracing::warn!(key = %prepared.key, "snapshot not found; falling back to live call");
                self.passthrough(prepared.request).await
            }
            MissBehavior::Passthrough => {
                tracing::debug!(key = %prepared.key, "snapshot not found; passing through");
                self.passthrough(prepared.request).await
            }
            MissBehavior::Record => {
                tracing::debug!(key = %prepared.key, "snapshot not found; recording");
                self.record(prepared, test).await
            }
        }
    }

    async fn passthrough(&self, request: Request<Bytes>) -> Result<Response<FetchBody>, FetchError> {
        self.transport
            .send(request)
            .await
            .map_err(FetchError::Transport)
    }
}

fn prepare(request: Request<Bytes>) -> Result<PreparedRequest, FetchError> {
    let url = request.uri().to_string();
    let body = SnapshotBody::from_bytes(request.body());
    let key = fingerprint(&url, body.as_ref())?;
    let streaming = body.as_ref().is_some_and(SnapshotBody::requests_stream);
    Ok(PreparedRequest {
        request,
        key,
        url,
        body,
        streaming,
    })
}

enum ReplayBody {
    Buffered(Bytes),
    Chunks(Vec<String>),
}

impl ReplayBody {
    /// Converts to a response body, fixing framing headers to match it.
    fn finalize(self, headers: &mut HeaderMap) -> FetchBody {
        strip_hop_by_hop_headers(headers);
        match self {
            Self::Buffered(bytes) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
                boxed_full(bytes)
            }
            Self::Chunks(chunks) => {
                headers.remove(header::CONTENT_LENGTH);
                boxed_chunks(chunks)
            }
        }
    }
}

fn response_from_snapshot(stored: SnapshotResponse) -> Response<FetchBody> {
    let SnapshotResponse {
        status,
        headers: stored_headers,
        body,
        chunks,
    } = stored;

    let replay = match chunks {
        Some(chunks) => ReplayBody::Chunks(chunks),
        None => ReplayBody::Buffered(body.as_ref().map(SnapshotBody::to_bytes).unwrap_or_default()),
    };

    let mut headers = HeaderMap::with_capacity(stored_headers.len());
    for (name, value) in stored_headers {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!("invalid header name in snapshot");
            continue;
        };
        let Ok(header_value) = HeaderValue::from_str(&value) else {
            tracing::debug!("invalid header value in snapshot for {}", header_name.as_str());
            continue;
        };
        headers.append(header_name, header_value);
    }

    let body = replay.finalize(&mut headers);
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or_else(|_| {
        tracing::debug!(status, "invalid status in snapshot; replaying as 500");
        StatusCode::INTERNAL_SERVER_ERROR
    });
    *response.headers_mut() = headers;
    response
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let mut connection_listed = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            if let Ok(header_name) = HeaderName::from_bytes(name.trim().as_bytes()) {
                connection_listed.push(header_name);
            }
        }
    }
    for header_name in connection_listed {
        headers.remove(header_name);
    }

    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in HOP_BY_HOP {
        headers.remove(*header_name);
    }
}

fn lock(overrides: &Mutex<PolicyOverrides>) -> MutexGuard<'_, PolicyOverrides> {
    overrides
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
