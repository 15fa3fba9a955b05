use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
};

use crate::snapshot::Snapshot;

pub const SNAPSHOT_EXTENSION: &str = "json";

#[derive(Debug)]
pub enum StoreError {
    Io { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Serialize { key: String, source: serde_json::Error },
    Task(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "snapshot I/O on {}: {source}", path.display()),
            Self::Parse { path, source } => {
                write!(f, "parse snapshot {}: {source}", path.display())
            }
            Self::Serialize { key, source } => write!(f, "serialize snapshot `{key}`: {source}"),
            Self::Task(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } | Self::Serialize { source, .. } => Some(source),
            Self::Task(_) => None,
        }
    }
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }

    fn join(operation: &str, err: tokio::task::JoinError) -> Self {
        Self::Task(format!("join {operation} task: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub key: String,
    pub url: String,
    pub method: String,
    pub recorded_at_unix_ms: Option<i64>,
    pub is_streaming: bool,
}

impl From<&Snapshot> for SnapshotSummary {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            key: snapshot.key.clone(),
            url: snapshot.request.url.clone(),
            method: snapshot.request.method.clone(),
            recorded_at_unix_ms: snapshot.recorded_at_unix_ms,
            is_streaming: snapshot.response.is_streaming(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteFilter {
    All,
    Key(String),
    UrlContains(String),
}

/// A flat directory of `{key}.json` snapshot files.
///
/// Files whose names start with `.` (such as the accessed-keys sidecar) are never treated as
/// snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{SNAPSHOT_EXTENSION}"))
    }

    /// Writes the snapshot, replacing any previous file for the same key.
    pub async fn persist(&self, snapshot: &Snapshot) -> Result<PathBuf, StoreError> {
        let path = self.snapshot_path(&snapshot.key);
        let contents =
            serde_json::to_vec_pretty(snapshot).map_err(|source| StoreError::Serialize {
                key: snapshot.key.clone(),
                source,
            })?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_snapshot_blocking(&target, &contents))
            .await
            .map_err(|err| StoreError::join("persist snapshot", err))??;
        Ok(path)
    }

    /// Returns `Ok(None)` when no file exists for `key`; every other failure is an error.
    pub async fn load(&self, key: &str) -> Result<Option<Snapshot>, StoreError> {
        let path = self.snapshot_path(key);
        tokio::task::spawn_blocking(move || load_snapshot_blocking(&path))
            .await
            .map_err(|err| StoreError::join("load snapshot", err))?
    }

    pub async fn list(&self, url_contains: Option<&str>) -> Result<Vec<SnapshotSummary>, StoreError> {
        let snapshots = self.read_all().await?;
        Ok(snapshots
            .iter()
            .filter(|snapshot| url_matches(snapshot, url_contains))
            .map(SnapshotSummary::from)
            .collect())
    }

    /// Removes matching snapshot files and returns how many were deleted. Files that vanish
    /// concurrently are not counted and are not errors.
    pub async fn delete(&self, filter: DeleteFilter) -> Result<usize, StoreError> {
        let keys = match filter {
            // Only keys backed by a snapshot file in this directory can be removed.
            DeleteFilter::Key(key) => self
                .file_keys()
                .await?
                .into_iter()
                .filter(|existing| *existing == key)
                .collect(),
            DeleteFilter::All => self.file_keys().await?,
            DeleteFilter::UrlContains(substring) => self.read_keys(Some(&substring)).await?,
        };
        let deleted = self.remove_keys(keys).await?;
        Ok(deleted.len())
    }

    /// Keys present in the store but absent from `accessed_keys`, sorted. Keys come from file
    /// names, so unreadable snapshot files are reported too.
    pub async fn find_stale(&self, accessed_keys: &HashSet<String>) -> Result<Vec<String>, StoreError> {
        let mut stale: Vec<String> = self
            .file_keys()
            .await?
            .into_iter()
            .filter(|key| !accessed_keys.contains(key))
            .collect();
        stale.sort_unstable();
        Ok(stale)
    }

    /// Deletes the stale set computed by [`Self::find_stale`] and returns it.
    pub async fn prune(&self, accessed_keys: &HashSet<String>) -> Result<Vec<String>, StoreError> {
        let stale = self.find_stale(accessed_keys).await?;
        self.remove_keys(stale.clone()).await?;
        tracing::info!(
            dir = %self.dir.display(),
            pruned = stale.len(),
            "pruned stale snapshots"
        );
        Ok(stale)
    }

    async fn read_keys(&self, url_contains: Option<&str>) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|snapshot| url_matches(snapshot, url_contains))
            .map(|snapshot| snapshot.key)
            .collect())
    }

    async fn file_keys(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, StoreError> {
            Ok(snapshot_file_names_blocking(&dir)?
                .into_iter()
                .filter_map(|name| {
                    name.strip_suffix(&format!(".{SNAPSHOT_EXTENSION}"))
                        .map(str::to_owned)
                })
                .collect())
        })
        .await
        .map_err(|err| StoreError::join("list snapshot files", err))?
    }

    async fn read_all(&self) -> Result<Vec<Snapshot>, StoreError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || read_all_blocking(&dir))
            .await
            .map_err(|err| StoreError::join("list snapshots", err))?
    }

    async fn remove_keys(&self, keys: Vec<String>) -> Result<Vec<String>, StoreError> {
        let paths: Vec<(String, PathBuf)> = keys
            .into_iter()
            .map(|key| {
                let path = self.snapshot_path(&key);
                (key, path)
            })
            .collect();
        tokio::task::spawn_blocking(move || remove_files_blocking(paths))
            .await
            .map_err(|err| StoreError::join("delete snapshots", err))?
    }
}

fn url_matches(snapshot: &Snapshot, url_contains: Option<&str>) -> bool {
    url_contains.is_none_or(|substring| snapshot.request.url.contains(substring))
}

fn write_snapshot_blocking(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;
    }
    fs::write(path, contents).map_err(|err| StoreError::io(path, err))
}

fn load_snapshot_blocking(path: &Path) -> Result<Option<Snapshot>, StoreError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_owned(),
            source,
        })
}

fn is_snapshot_file_name(name: &str) -> bool {
    !name.starts_with('.')
        && Path::new(name)
            .extension()
            .is_some_and(|extension| extension == SNAPSHOT_EXTENSION)
}

fn snapshot_file_names_blocking(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(dir, err)),
    };

    let mut file_names = Vec::new();
    for entry_result in entries {
        let entry = entry_result.map_err(|err| StoreError::io(dir, err))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_snapshot_file_name(&name) {
            file_names.push(name);
        }
    }
    file_names.sort_unstable();
    Ok(file_names)
}

fn read_all_blocking(dir: &Path) -> Result<Vec<Snapshot>, StoreError> {
    let file_names = snapshot_file_names_blocking(dir)?;
    let mut snapshots = Vec::with_capacity(file_names.len());
    for name in file_names {
        let path = dir.join(&name);
        match load_snapshot_blocking(&path) {
            Ok(Some(snapshot)) => snapshots.push(snapshot),
            Ok(None) => {}
            Err(StoreError::Parse { path, source }) => {
                tracing::debug!(path = %path.display(), "skipping unreadable snapshot: {source}");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(snapshots)
}

fn remove_files_blocking(paths: Vec<(String, PathBuf)>) -> Result<Vec<String>, StoreError> {
    let mut removed = Vec::with_capacity(paths.len());
    for (key, path) in paths {
        match fs::remove_file(&path) {
            Ok(()) => removed.push(key),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::io(&path, err)),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use serde_json::json;

    use super::{DeleteFilter, SnapshotStore, StoreError};
    use crate::snapshot::{Snapshot, SnapshotBody, SnapshotRequest, SnapshotResponse};

    fn snapshot(key: &str, url: &str) -> Snapshot {
        Snapshot {
            key: key.to_owned(),
            request: SnapshotRequest {
                method: "POST".to_owned(),
                url: url.to_owned(),
                body: Some(SnapshotBody::Json(json!({"model": "m"}))),
            },
            response: SnapshotResponse::buffered(
                200,
                BTreeMap::from([("content-type".to_owned(), "application/json".to_owned())]),
                Some(SnapshotBody::Json(json!({"ok": true}))),
            ),
            test: None,
            recorded_at_unix_ms: Some(1_700_000_000_000),
        }
    }

    fn keys(values: &[&str]) -> HashSet<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path().join("nested").join("snapshots"));
        let original = snapshot("v1-responses-m-0123456789ab", "https://api.example.com/v1/responses");

        let path = store.persist(&original).await.unwrap();
        assert_eq!(path, store.snapshot_path("v1-responses-m-0123456789ab"));
        assert!(path.is_file());

        let loaded = store.load(&original.key).await.unwrap();
        assert_eq!(loaded, Some(original));
    }

    #[tokio::test]
    async fn persist_overwrites_existing_snapshot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        let mut first = snapshot("k", "https://a.example.com/one");
        store.persist(&first).await.unwrap();

        first.response.status = 500;
        store.persist(&first).await.unwrap();

        let loaded = store.load("k").await.unwrap().unwrap();
        assert_eq!(loaded.response.status, 500);
    }

    #[tokio::test]
    async fn load_missing_key_is_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path().join("does-not-exist"));
        assert_eq!(store.load("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn load_corrupt_snapshot_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        std::fs::write(store.snapshot_path("broken"), b"{ not json").unwrap();

        let err = store.load("broken").await.unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn load_unreadable_path_propagates_io_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        std::fs::create_dir(store.snapshot_path("is-a-dir")).unwrap();

        let err = store.load("is-a-dir").await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn list_skips_hidden_foreign_and_corrupt_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        store
            .persist(&snapshot("b-key", "https://api.example.com/v1/embeddings"))
            .await
            .unwrap();
        let mut streaming = snapshot("a-key", "https://api.example.com/v1/chat");
        streaming.response = SnapshotResponse::streamed(200, BTreeMap::new(), vec!["x".to_owned()]);
        store.persist(&streaming).await.unwrap();
        std::fs::write(temp_dir.path().join(".accessed-keys.json"), b"[\"a-key\"]").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(temp_dir.path().join("corrupt.json"), b"[1, 2").unwrap();

        let listed = store.list(None).await.unwrap();
        let listed_keys: Vec<&str> = listed.iter().map(|summary| summary.key.as_str()).collect();
        assert_eq!(listed_keys, vec!["a-key", "b-key"]);
        assert!(listed[0].is_streaming);
        assert!(!listed[1].is_streaming);
        assert_eq!(listed[1].method, "POST");
        assert_eq!(listed[1].recorded_at_unix_ms, Some(1_700_000_000_000));

        let filtered = store.list(Some("/v1/chat")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].url, "https://api.example.com/v1/chat");
    }

    #[tokio::test]
    async fn list_missing_dir_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path().join("missing"));
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_by_key_url_and_all() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        for (key, url) in [
            ("one", "https://api.example.com/v1/chat"),
            ("two", "https://api.example.com/v1/chat?stream=1"),
            ("three", "https://api.example.com/v1/embeddings"),
            ("four", "https://other.example.com/v1/models"),
        ] {
            store.persist(&snapshot(key, url)).await.unwrap();
        }

        assert_eq!(store.delete(DeleteFilter::Key("one".to_owned())).await.unwrap(), 1);
        assert_eq!(store.delete(DeleteFilter::Key("one".to_owned())).await.unwrap(), 0);
        assert_eq!(
            store
                .delete(DeleteFilter::UrlContains("/v1/chat".to_owned()))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.delete(DeleteFilter::All).await.unwrap(), 2);
        assert!(store.list(None).await.unwrap().is_empty());
        assert!(temp_dir.path().exists());
    }

    #[tokio::test]
    async fn find_stale_and_prune_remove_only_unaccessed_keys() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        for key in ["A", "B", "C"] {
            store
                .persist(&snapshot(key, "https://api.example.com/v1/responses"))
                .await
                .unwrap();
        }
        let accessed = keys(&["A", "B"]);

        assert_eq!(store.find_stale(&accessed).await.unwrap(), vec!["C".to_owned()]);
        assert_eq!(store.prune(&accessed).await.unwrap(), vec!["C".to_owned()]);

        assert!(store.load("C").await.unwrap().is_none());
        assert!(store.load("A").await.unwrap().is_some());
        assert!(store.load("B").await.unwrap().is_some());
        assert!(store.find_stale(&accessed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_by_key_stays_inside_snapshot_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let outside = temp_dir.path().join("precious.json");
        std::fs::write(&outside, b"{}").unwrap();
        let store = SnapshotStore::new(temp_dir.path().join("snaps"));
        store
            .persist(&snapshot("kept", "https://api.example.com/v1/chat"))
            .await
            .unwrap();
        let sidecar = store.dir().join(".accessed-keys.json");
        std::fs::write(&sidecar, b"[\"kept\"]").unwrap();

        for key in ["../precious", ".accessed-keys", "snaps/../../precious"] {
            assert_eq!(
                store.delete(DeleteFilter::Key(key.to_owned())).await.unwrap(),
                0,
                "{key}"
            );
        }
        assert!(outside.exists());
        assert!(sidecar.exists());
        assert!(store.load("kept").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn find_stale_reports_unreadable_snapshot_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(temp_dir.path());
        store
            .persist(&snapshot("A", "https://api.example.com/v1/responses"))
            .await
            .unwrap();
        std::fs::write(store.snapshot_path("garbled"), b"{").unwrap();

        assert_eq!(
            store.find_stale(&keys(&["A"])).await.unwrap(),
            vec!["garbled".to_owned()]
        );
    }
}
