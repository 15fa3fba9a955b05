use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context as _;
use serde::Deserialize;

pub const DEFAULT_SNAPSHOT_DIR: &str = "__snapshots__";
pub const DEFAULT_CONFIG_FILENAME: &str = "snapfetch.toml";
pub const DEFAULT_ACCESSED_KEYS_MAX_AGE: Duration = Duration::from_secs(10 * 60);

pub const ENV_DIR: &str = "SNAPFETCH_DIR";
pub const ENV_MODE: &str = "SNAPFETCH_MODE";
pub const ENV_MISS: &str = "SNAPFETCH_MISS";
pub const ENV_ALLOW_SENSITIVE_HEADERS: &str = "SNAPFETCH_ALLOW_SENSITIVE_HEADERS";
pub const ENV_ACCESSED_KEYS_MAX_AGE_SECS: &str = "SNAPFETCH_ACCESSED_KEYS_MAX_AGE_SECS";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    pub logging: Option<LoggingConfig>,
}

/// Whether calls go straight to the network (and are persisted) or are served from disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    Record,
    #[default]
    Playback,
}

/// What playback does when no snapshot exists for a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissBehavior {
    #[default]
    Error,
    Warn,
    Passthrough,
    Record,
}

impl SnapshotMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Playback => "playback",
        }
    }

    fn parse_lenient(value: &str) -> Option<Self> {
        match value.trim() {
            "record" => Some(Self::Record),
            "playback" => Some(Self::Playback),
            _ => None,
        }
    }
}

impl MissBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Passthrough => "passthrough",
            Self::Record => "record",
        }
    }

    fn parse_lenient(value: &str) -> Option<Self> {
        match value.trim() {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "passthrough" => Some(Self::Passthrough),
            "record" => Some(Self::Record),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub mode: SnapshotMode,
    #[serde(default)]
    pub on_miss: MissBehavior,
    /// Keep cookie/request-id/date headers in recorded snapshots.
    #[serde(default)]
    pub allow_sensitive_headers: bool,
    #[serde(default = "default_accessed_keys_max_age_secs")]
    pub accessed_keys_max_age_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
            mode: SnapshotMode::default(),
            on_miss: MissBehavior::default(),
            allow_sensitive_headers: false,
            accessed_keys_max_age_secs: default_accessed_keys_max_age_secs(),
        }
    }
}

impl SnapshotConfig {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn accessed_keys_max_age(&self) -> Duration {
        Duration::from_secs(self.accessed_keys_max_age_secs)
    }
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SNAPSHOT_DIR)
}

fn default_accessed_keys_max_age_secs() -> u64 {
    DEFAULT_ACCESSED_KEYS_MAX_AGE.as_secs()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    /// Loads the config file (explicit path, else `./snapfetch.toml` when present, else
    /// defaults) and overlays `SNAPFETCH_*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => {
                let discovered = Path::new(DEFAULT_CONFIG_FILENAME);
                if discovered.is_file() {
                    Self::from_path(discovered)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Overlays environment values read through `lookup`. Unrecognised mode or miss values
    /// are ignored rather than rejected.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let snapshots = &mut self.snapshots;

        if let Some(dir) = lookup(ENV_DIR) {
            let dir = dir.trim();
            if !dir.is_empty() {
                snapshots.dir = PathBuf::from(dir);
            }
        }
        if let Some(mode) = lookup(ENV_MODE).as_deref().and_then(SnapshotMode::parse_lenient) {
            snapshots.mode = mode;
        }
        if let Some(on_miss) = lookup(ENV_MISS)
            .as_deref()
            .and_then(MissBehavior::parse_lenient)
        {
            snapshots.on_miss = on_miss;
        }
        if let Some(value) = lookup(ENV_ALLOW_SENSITIVE_HEADERS) {
            snapshots.allow_sensitive_headers = env_truthy(&value);
        }
        if let Some(value) = lookup(ENV_ACCESSED_KEYS_MAX_AGE_SECS) {
            snapshots.accessed_keys_max_age_secs = value.trim().parse().with_context(|| {
                format!("parse {ENV_ACCESSED_KEYS_MAX_AGE_SECS}=`{value}` as seconds")
            })?;
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

fn env_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::Path, time::Duration};

    use super::{Config, LogFormat, MissBehavior, SnapshotMode};

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").expect("empty config should parse");
        assert_eq!(config.snapshots.dir, Path::new("__snapshots__"));
        assert_eq!(config.snapshots.mode, SnapshotMode::Playback);
        assert_eq!(config.snapshots.on_miss, MissBehavior::Error);
        assert!(!config.snapshots.allow_sensitive_headers);
        assert_eq!(
            config.snapshots.accessed_keys_max_age(),
            Duration::from_secs(600)
        );
        assert!(config.logging.is_none());
    }

    #[test]
    fn parses_full_config() {
        let config = Config::from_toml_str(
            r#"
[snapshots]
dir = "fixtures/http"
mode = "record"
on_miss = "passthrough"
allow_sensitive_headers = true
accessed_keys_max_age_secs = 30

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.snapshots.dir, Path::new("fixtures/http"));
        assert_eq!(config.snapshots.mode, SnapshotMode::Record);
        assert_eq!(config.snapshots.on_miss, MissBehavior::Passthrough);
        assert!(config.snapshots.allow_sensitive_headers);
        assert_eq!(config.snapshots.accessed_keys_max_age_secs, 30);
        let logging = config.logging.expect("logging section should be present");
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = Config::from_toml_str(
            r#"
[snapshots]
directory = "typo"
"#,
        )
        .unwrap_err();
        assert!(
            format!("{err:#}").contains("unknown field"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::from_toml_str(
            r#"
[snapshots]
dir = "from-file"
mode = "playback"
"#,
        )
        .unwrap();

        config
            .apply_env_with(lookup_from(&[
                ("SNAPFETCH_DIR", " from-env "),
                ("SNAPFETCH_MODE", "record"),
                ("SNAPFETCH_MISS", "record"),
                ("SNAPFETCH_ALLOW_SENSITIVE_HEADERS", "TRUE"),
                ("SNAPFETCH_ACCESSED_KEYS_MAX_AGE_SECS", "120"),
            ]))
            .expect("env overlay should succeed");

        assert_eq!(config.snapshots.dir, Path::new("from-env"));
        assert_eq!(config.snapshots.mode, SnapshotMode::Record);
        assert_eq!(config.snapshots.on_miss, MissBehavior::Record);
        assert!(config.snapshots.allow_sensitive_headers);
        assert_eq!(config.snapshots.accessed_keys_max_age_secs, 120);
    }

    #[test]
    fn env_ignores_unrecognised_mode_and_blank_dir() {
        let mut config = Config::default();
        config
            .apply_env_with(lookup_from(&[
                ("SNAPFETCH_DIR", "   "),
                ("SNAPFETCH_MODE", "replay"),
                ("SNAPFETCH_MISS", "explode"),
            ]))
            .unwrap();

        assert_eq!(config.snapshots.dir, Path::new("__snapshots__"));
        assert_eq!(config.snapshots.mode, SnapshotMode::Playback);
        assert_eq!(config.snapshots.on_miss, MissBehavior::Error);
    }

    #[test]
    fn env_rejects_non_numeric_max_age() {
        let mut config = Config::default();
        let err = config
            .apply_env_with(lookup_from(&[(
                "SNAPFETCH_ACCESSED_KEYS_MAX_AGE_SECS",
                "ten minutes",
            )]))
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("SNAPFETCH_ACCESSED_KEYS_MAX_AGE_SECS"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn from_path_reports_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = Config::from_path(temp_dir.path().join("absent.toml")).unwrap_err();
        assert!(
            err.to_string().starts_with("read config"),
            "unexpected error: {err}"
        );
    }
}
