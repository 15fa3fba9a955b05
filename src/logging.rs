use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global subscriber. Logs go to stderr so CLI listings on stdout stay parseable.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let log_level = resolve_log_level(config, cli_level_override)?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr);

    match resolve_log_format(config) {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or(DEFAULT_LOG_LEVEL);

    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use super::{resolve_log_format, resolve_log_level};
    use crate::config::{Config, LogFormat};
    use serde_json::Value;
    use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

    fn configured_logging() -> Config {
        Config::from_toml_str(
            r#"
[logging]
level = " WARN "
format = "pretty"
"#,
        )
        .expect("config should parse")
    }

    #[test]
    fn log_level_defaults_to_info() {
        assert_eq!(
            resolve_log_level(&Config::default(), None).unwrap(),
            LevelFilter::INFO
        );
    }

    #[test]
    fn log_level_is_trimmed_and_case_insensitive() {
        assert_eq!(
            resolve_log_level(&configured_logging(), None).unwrap(),
            LevelFilter::WARN
        );
    }

    #[test]
    fn cli_level_wins_over_config() {
        assert_eq!(
            resolve_log_level(&configured_logging(), Some("trace")).unwrap(),
            LevelFilter::TRACE
        );
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let err = resolve_log_level(&Config::default(), Some("chatty")).unwrap_err();
        assert!(
            err.to_string().contains("invalid log level `chatty`"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn log_format_defaults_to_json() {
        assert_eq!(resolve_log_format(&Config::default()), LogFormat::Json);
        assert_eq!(resolve_log_format(&configured_logging()), LogFormat::Pretty);
    }

    #[test]
    fn json_lines_carry_snapshot_fields() {
        let writer = CaptureWriter::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::DEBUG)
            .with_target(true)
            .json()
            .with_writer(writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "snapfetch::fetch", key = "v1-models-unknown-0123456789ab", "snapshot recorded");
        });

        let output = writer.contents();
        let line = output.lines().next().expect("expected one JSON log line");
        let log: Value = serde_json::from_str(line).expect("log line should be valid JSON");

        assert_eq!(log.get("level").and_then(Value::as_str), Some("INFO"));
        assert_eq!(
            log.get("target").and_then(Value::as_str),
            Some("snapfetch::fetch")
        );
        assert_eq!(
            log.pointer("/fields/key").and_then(Value::as_str),
            Some("v1-models-unknown-0123456789ab")
        );
        assert_eq!(
            log.pointer("/fields/message").and_then(Value::as_str),
            Some("snapshot recorded")
        );
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    pub(crate) struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        pub(crate) fn contents(&self) -> String {
            let bytes = self.buffer.lock().expect("buffer lock poisoned").clone();
            String::from_utf8(bytes).expect("log output should be UTF-8")
        }
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl std::io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer
                .lock()
                .expect("buffer lock poisoned")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
