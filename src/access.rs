//! Which snapshot keys a test run touched.
//!
//! Every lookup, hit or miss, is recorded in memory. [`AccessTracker::persist`] unions the
//! set into `{dir}/.accessed-keys.json` so partial runs accumulate. Staleness tooling reads
//! the sidecar back with [`load_accessed_keys`], which refuses a file older than the
//! configured window.

use std::{
    collections::{BTreeSet, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime},
};

pub const ACCESSED_KEYS_FILENAME: &str = ".accessed-keys.json";

#[derive(Debug)]
pub enum AccessedKeysError {
    Missing { path: PathBuf },
    Stale { age: Duration, max_age: Duration },
    Io { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Task(String),
}

impl std::fmt::Display for AccessedKeysError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing { path } => write!(
                f,
                "accessed keys file {} does not exist\nRun tests first: SNAPFETCH_MODE=playback cargo test",
                path.display()
            ),
            Self::Stale { age, max_age } => write!(
                f,
                "accessed keys file is {} minutes old (max: {} minutes)\nRun tests first: SNAPFETCH_MODE=playback cargo test",
                age.as_secs() / 60,
                max_age.as_secs() / 60
            ),
            Self::Io { path, source } => {
                write!(f, "accessed keys I/O on {}: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "parse accessed keys {}: {source}", path.display())
            }
            Self::Task(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for AccessedKeysError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::Missing { .. } | Self::Stale { .. } | Self::Task(_) => None,
        }
    }
}

pub fn accessed_keys_path(dir: &Path) -> PathBuf {
    dir.join(ACCESSED_KEYS_FILENAME)
}

#[derive(Debug, Default)]
pub struct AccessTracker {
    keys: Mutex<BTreeSet<String>>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str) {
        let mut keys = self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !keys.contains(key) {
            keys.insert(key.to_owned());
        }
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Merges this run's keys into the sidecar in `dir`. Does nothing when no key was
    /// recorded. Returns the number of keys in the merged file.
    pub async fn persist(&self, dir: &Path) -> Result<usize, AccessedKeysError> {
        let keys = self.keys();
        if keys.is_empty() {
            return Ok(0);
        }
        let path = accessed_keys_path(dir);
        let dir = dir.to_owned();
        tokio::task::spawn_blocking(move || merge_accessed_keys_blocking(&dir, &path, keys))
            .await
            .map_err(|err| AccessedKeysError::Task(format!("join persist accessed keys task: {err}")))?
    }
}

/// Reads the sidecar, rejecting it when its modification time is older than `max_age`.
pub async fn load_accessed_keys(
    dir: &Path,
    max_age: Duration,
) -> Result<HashSet<String>, AccessedKeysError> {
    let path = accessed_keys_path(dir);
    tokio::task::spawn_blocking(move || load_accessed_keys_blocking(&path, max_age, SystemTime::now()))
        .await
        .map_err(|err| AccessedKeysError::Task(format!("join load accessed keys task: {err}")))?
}

fn read_keys_file(path: &Path) -> Result<Option<Vec<String>>, AccessedKeysError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(AccessedKeysError::Io {
                path: path.to_owned(),
                source,
            });
        }
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|source| AccessedKeysError::Parse {
            path: path.to_owned(),
            source,
        })
}

fn merge_accessed_keys_blocking(
    dir: &Path,
    path: &Path,
    keys: BTreeSet<String>,
) -> Result<usize, AccessedKeysError> {
    // An unreadable previous file is replaced rather than blocking this run's coverage.
    let existing = match read_keys_file(path) {
        Ok(existing) => existing.unwrap_or_default(),
        Err(AccessedKeysError::Parse { path, source }) => {
            tracing::warn!(path = %path.display(), "replacing unreadable accessed keys file: {source}");
            Vec::new()
        }
        Err(err) => return Err(err),
    };

    let mut merged: BTreeSet<String> = existing.into_iter().collect();
    merged.extend(keys);

    fs::create_dir_all(dir).map_err(|source| AccessedKeysError::Io {
        path: dir.to_owned(),
        source,
    })?;
    let contents = serde_json::to_vec_pretty(&merged).map_err(|source| AccessedKeysError::Parse {
        path: path.to_owned(),
        source,
    })?;
    fs::write(path, contents).map_err(|source| AccessedKeysError::Io {
        path: path.to_owned(),
        source,
    })?;

    tracing::debug!(path = %path.display(), keys = merged.len(), "persisted accessed keys");
    Ok(merged.len())
}

fn load_accessed_keys_blocking(
    path: &Path,
    max_age: Duration,
    now: SystemTime,
) -> Result<HashSet<String>, AccessedKeysError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(AccessedKeysError::Missing {
                path: path.to_owned(),
            });
        }
        Err(source) => {
            return Err(AccessedKeysError::Io {
                path: path.to_owned(),
                source,
            });
        }
    };
    let modified = metadata.modified().map_err(|source| AccessedKeysError::Io {
        path: path.to_owned(),
        source,
    })?;
    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
    if age > max_age {
        return Err(AccessedKeysError::Stale { age, max_age });
    }

    let keys = read_keys_file(path)?.ok_or_else(|| AccessedKeysError::Missing {
        path: path.to_owned(),
    })?;
    Ok(keys.into_iter().collect())
}
