pub mod access;
pub mod config;
pub mod fetch;
pub mod fingerprint;
pub mod hint;
pub mod logging;
pub mod snapshot;
pub mod store;
pub mod stream;
pub mod transport;

pub use config::{MissBehavior, SnapshotConfig, SnapshotMode};
pub use fetch::{FetchError, PolicyOverrides, SnapshotFetch, SnapshotMissingError};
pub use snapshot::TestContext;
