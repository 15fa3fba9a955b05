use std::path::PathBuf;

use clap::{Parser, Subcommand};
use snapfetch::{
    access::load_accessed_keys,
    config::Config,
    logging,
    store::{DeleteFilter, SnapshotStore, SnapshotSummary},
};

#[derive(Debug, Parser)]
#[command(name = "snapfetch", about = "Inspect and clean up recorded HTTP snapshots")]
struct Cli {
    /// Optional path to config TOML. If omitted, `./snapfetch.toml` is used when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the snapshot directory.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: SnapshotCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum SnapshotCommand {
    /// List recorded snapshots.
    List {
        /// Only list snapshots whose URL contains this substring.
        #[arg(long)]
        url: Option<String>,
    },
    /// List snapshots not accessed by the last test run.
    ListStale,
    /// Delete snapshots; deletes everything when no filter is given.
    Delete {
        /// Delete the snapshot with this exact key.
        #[arg(long, conflicts_with = "url")]
        key: Option<String>,
        /// Delete snapshots whose URL contains this substring.
        #[arg(long)]
        url: Option<String>,
    },
    /// Delete snapshots not accessed by the last test run.
    DeleteStale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SnapshotCommandOutcome {
    Listed { snapshots: Vec<SnapshotSummary> },
    ListedStale { keys: Vec<String> },
    Deleted { count: usize },
}

async fn run_snapshot_command(
    config: &Config,
    command: SnapshotCommand,
) -> anyhow::Result<SnapshotCommandOutcome> {
    let store = SnapshotStore::new(&config.snapshots.dir);

    match command {
        SnapshotCommand::List { url } => {
            let snapshots = store
                .list(url.as_deref())
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(SnapshotCommandOutcome::Listed { snapshots })
        }
        SnapshotCommand::ListStale => {
            let accessed =
                load_accessed_keys(store.dir(), config.snapshots.accessed_keys_max_age())
                    .await
                    .map_err(|err| anyhow::anyhow!("{err}"))?;
            let keys = store
                .find_stale(&accessed)
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(SnapshotCommandOutcome::ListedStale { keys })
        }
        SnapshotCommand::Delete { key, url } => {
            let filter = match (key, url) {
                (Some(key), _) => DeleteFilter::Key(key),
                (None, Some(url)) => DeleteFilter::UrlContains(url),
                (None, None) => DeleteFilter::All,
            };
            let count = store
                .delete(filter)
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(SnapshotCommandOutcome::Deleted { count })
        }
        SnapshotCommand::DeleteStale => {
            let accessed =
                load_accessed_keys(store.dir(), config.snapshots.accessed_keys_max_age())
                    .await
                    .map_err(|err| anyhow::anyhow!("{err}"))?;
            let pruned = store
                .prune(&accessed)
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(SnapshotCommandOutcome::Deleted {
                count: pruned.len(),
            })
        }
    }
}

fn format_summary(summary: &SnapshotSummary) -> String {
    let mut line = format!("{} | {} {}", summary.key, summary.method, summary.url);
    if summary.is_streaming {
        line.push_str(" [stream]");
    }
    line
}

fn print_snapshot_command_outcome(outcome: SnapshotCommandOutcome) {
    match outcome {
        SnapshotCommandOutcome::Listed { snapshots } => {
            if snapshots.is_empty() {
                println!("No snapshots found.");
            }
            for summary in &snapshots {
                println!("{}", format_summary(summary));
            }
        }
        SnapshotCommandOutcome::ListedStale { keys } => {
            if keys.is_empty() {
                println!("No stale snapshots.");
            }
            for key in keys {
                println!("{key}");
            }
        }
        SnapshotCommandOutcome::Deleted { count } => {
            println!("Deleted {count} snapshot(s).");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.dir {
        config.snapshots.dir = dir;
    }
    logging::init(&config, cli.log_level.as_deref())?;

    let outcome = run_snapshot_command(&config, cli.command).await?;
    print_snapshot_command_outcome(outcome);
    Ok(())
}
