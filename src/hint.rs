//! Rebuilds a "re-run in record mode" command for the snapshot-missing error.
//!
//! Everything here is best effort: when the inputs do not identify a cargo package the
//! helpers return `None` and the caller falls back to a generic instruction.

use std::path::Path;

use crate::{config::ENV_MODE, snapshot::TestContext};

const CARGO_HASH_LEN: usize = 16;

/// What is known about the running test process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Cargo package under test (`CARGO_PKG_NAME`).
    pub package: Option<String>,
    /// `argv[0]` of the test binary.
    pub program: Option<String>,
    /// Arguments passed to the test harness.
    pub args: Vec<String>,
    pub test: Option<TestContext>,
}

impl Invocation {
    pub fn current(test: Option<&TestContext>) -> Self {
        let mut argv = std::env::args();
        let program = argv.next();
        Self {
            package: std::env::var("CARGO_PKG_NAME").ok(),
            program,
            args: argv.collect(),
            test: test.cloned(),
        }
    }
}

/// The cargo command that reproduces this invocation, e.g.
/// `cargo test -p snapfetch --test playback -- streams`.
pub fn record_command(invocation: &Invocation) -> Option<String> {
    let package = invocation
        .package
        .as_deref()
        .map(str::trim)
        .filter(|package| !package.is_empty())?;

    let mut parts = vec!["cargo".to_owned(), "test".to_owned(), "-p".to_owned(), package.to_owned()];
    if let Some(target) = test_target(invocation, package) {
        parts.extend(target);
    }
    let args: Vec<&String> = invocation.args.iter().filter(|arg| !arg.is_empty()).collect();
    if !args.is_empty() {
        parts.push("--".to_owned());
        parts.extend(args.into_iter().cloned());
    }
    Some(shell_join(&parts))
}

/// Remediation lines for the snapshot-missing error, most specific first.
pub fn record_hints(invocation: &Invocation) -> Vec<String> {
    let Some(command) = record_command(invocation) else {
        return vec![format!("{ENV_MODE}=record <your current test command>")];
    };

    let mut hints = vec![format!("{ENV_MODE}=record {command}")];
    if invocation.args.is_empty()
        && let Some(test) = invocation.test.as_ref()
        && is_test_path(&test.name)
    {
        hints.push(format!(
            "{ENV_MODE}=record {command} -- --exact {}",
            shell_quote(&test.name)
        ));
    }
    hints
}

/// `--exact` only selects a test by its harness path, such as `chat::records_reply`.
fn is_test_path(name: &str) -> bool {
    name.split("::").all(|segment| {
        let mut chars = segment.chars();
        chars
            .next()
            .is_some_and(|first| first == '_' || first.is_ascii_alphabetic())
            && chars.all(|rest| rest == '_' || rest.is_ascii_alphanumeric())
    })
}

fn test_target(invocation: &Invocation, package: &str) -> Option<[String; 2]> {
    if let Some(binary) = invocation.program.as_deref().and_then(cargo_test_binary_name) {
        if binary == package.replace('-', "_") {
            return None;
        }
        return Some(["--test".to_owned(), binary.to_owned()]);
    }

    let file = invocation.test.as_ref()?.file.as_deref()?;
    let path = Path::new(file);
    let parent = path.parent()?.file_name()?;
    if parent != "tests" || path.extension()? != "rs" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    Some(["--test".to_owned(), stem.to_owned()])
}

/// `target/debug/deps/playback-0f1e2d3c4b5a6978` -> `playback`.
fn cargo_test_binary_name(program: &str) -> Option<&str> {
    let file_name = Path::new(program).file_name()?.to_str()?;
    let stem = file_name.strip_suffix(".exe").unwrap_or(file_name);
    let (name, hash) = stem.rsplit_once('-')?;
    let is_cargo_hash =
        hash.len() == CARGO_HASH_LEN && hash.bytes().all(|byte| byte.is_ascii_hexdigit());
    (is_cargo_hash && !name.is_empty()).then_some(name)
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| shell_quote(part))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(value: &str) -> String {
    let is_plain = !value.is_empty()
        && value.bytes().all(|byte| {
            byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'.' | b'/' | b':' | b'@' | b'=' | b'-')
        });
    if is_plain {
        return value.to_owned();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
