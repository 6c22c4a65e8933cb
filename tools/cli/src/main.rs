//! DraftSync CLI - Command line interface to the sync engine.
//!
//! Reads and writes records in the local replica, shows the mutation queue,
//! and runs reconciliation passes against the configured remote.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use draftsync_common::{Record, Timestamp};
use draftsync_storage::{
    ConnectivityMonitor, HttpRemoteStore, MemoryRemoteStore, RemoteConfig, RemoteStore,
    SqliteLocalStore,
};
use draftsync_sync::{ConflictStrategy, MutationQueue, SyncEngine, SyncReport, WriteOutcome};

use crate::config::ClientConfig;

type Engine = SyncEngine<SqliteLocalStore, dyn RemoteStore>;

#[derive(Parser)]
#[command(name = "draftsync")]
#[command(about = "DraftSync - Offline-first key-value sync")]
#[command(version)]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Treat the remote as unreachable; writes are queued.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the value stored under a key.
    Get {
        /// Record key.
        key: String,
    },

    /// Store a JSON value under a key.
    Put {
        /// Record key.
        key: String,

        /// Value as JSON, e.g. '{"headline": "Hello"}' or '"text"'.
        value: String,
    },

    /// Delete a key.
    Delete {
        /// Record key.
        key: String,
    },

    /// List stored records.
    List {
        /// Only keys starting with this prefix.
        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Replay queued writes and reconcile with the remote.
    Sync,

    /// Resolve a conflict on a key.
    Resolve {
        /// Conflicting key.
        key: String,

        /// "local", "remote", or "merge".
        #[arg(short, long)]
        strategy: ConflictStrategy,
    },

    /// Show writes waiting for the remote.
    Queue,

    /// Write a config file pointing at a remote data API.
    InitConfig {
        /// Base URL of the data API.
        #[arg(long)]
        api_url: String,

        /// Bearer token.
        #[arg(long)]
        api_key: String,

        /// User whose data set is addressed.
        #[arg(long)]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides --verbose.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => ClientConfig::default_path()?,
    };

    if let Commands::InitConfig {
        api_url,
        api_key,
        user_id,
    } = &cli.command
    {
        return cmd_init_config(&config_path, api_url, api_key, user_id);
    }

    let config = ClientConfig::load(&config_path)?;
    let engine = open_engine(&config, cli.offline).await?;

    match cli.command {
        Commands::Get { key } => cmd_get(&engine, &key),
        Commands::Put { key, value } => cmd_put(&engine, &key, &value).await,
        Commands::Delete { key } => cmd_delete(&engine, &key).await,
        Commands::List { prefix } => cmd_list(&engine, &prefix),
        Commands::Sync => cmd_sync(&engine).await,
        Commands::Resolve { key, strategy } => cmd_resolve(&engine, &key, strategy).await,
        Commands::Queue => cmd_queue(&engine).await,
        Commands::InitConfig { .. } => Ok(()),
    }
}

/// Build the engine over the on-disk replica and the configured remote.
async fn open_engine(config: &ClientConfig, offline: bool) -> Result<Engine> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    let local = SqliteLocalStore::open(data_dir.join("records.db"), &config.sync.namespace)
        .context("Failed to open local store")?;
    let queue = MutationQueue::open(data_dir.join("queue.json"))
        .await
        .context("Failed to open mutation queue")?;

    let (remote, monitor) = match &config.remote {
        Some(remote) => {
            let monitor = ConnectivityMonitor::new(!offline);
            let client = HttpRemoteStore::new(remote.clone(), monitor.clone())
                .context("Invalid remote configuration")?;
            (Arc::new(client) as Arc<dyn RemoteStore>, monitor)
        }
        None => {
            // Without a remote the engine never goes online.
            warn!("No remote configured; writes stay queued until `init-config` is run");
            (
                Arc::new(MemoryRemoteStore::new()) as Arc<dyn RemoteStore>,
                ConnectivityMonitor::new(false),
            )
        }
    };

    Ok(SyncEngine::new(
        Arc::new(local),
        remote,
        queue,
        monitor,
        config.sync.clone(),
    ))
}

/// Write a config file with the given remote.
fn cmd_init_config(path: &Path, api_url: &str, api_key: &str, user_id: &str) -> Result<()> {
    let remote = RemoteConfig {
        api_url: api_url.to_string(),
        api_key: api_key.to_string(),
        user_id: user_id.to_string(),
    };
    remote.validate().context("Invalid remote configuration")?;

    let mut config = ClientConfig::load(path)?;
    config.remote = Some(remote);
    config.save(path)?;

    println!("Config written to {}", path.display());
    Ok(())
}

fn cmd_get(engine: &Engine, key: &str) -> Result<()> {
    let record = engine
        .get(key)?
        .with_context(|| format!("No value stored for {}", key))?;
    println!("{}", serde_json::to_string_pretty(&record.value)?);
    Ok(())
}

async fn cmd_put(engine: &Engine, key: &str, value: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(value).context("Value must be valid JSON")?;
    let outcome = engine.put(key, value).await?;
    println!("Saved {} ({})", key, describe(outcome));
    Ok(())
}

async fn cmd_delete(engine: &Engine, key: &str) -> Result<()> {
    let outcome = engine.delete(key).await?;
    println!("Deleted {} ({})", key, describe(outcome));
    Ok(())
}

fn cmd_list(engine: &Engine, prefix: &str) -> Result<()> {
    let records = engine.list(prefix)?;
    if records.is_empty() {
        println!("No records.");
        return Ok(());
    }

    for record in records.values() {
        print_record(record);
    }
    Ok(())
}

async fn cmd_sync(engine: &Engine) -> Result<()> {
    info!("Starting sync");
    let report = engine.reconcile().await;
    print_report(&report);

    if !report.success {
        anyhow::bail!(
            "Sync failed: {}",
            report.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_resolve(engine: &Engine, key: &str, strategy: ConflictStrategy) -> Result<()> {
    let outcome = engine
        .resolve(key, strategy)
        .await
        .with_context(|| format!("Failed to resolve {}", key))?;

    println!("Resolved {} with {} strategy", key, strategy);
    print_record(&outcome.record);
    if outcome.remote_deferred {
        println!("Remote unreachable; the resolution is queued for the next sync.");
    }
    Ok(())
}

async fn cmd_queue(engine: &Engine) -> Result<()> {
    let pending = engine.pending_mutations().await;
    if pending.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{} pending mutations:", pending.len());
    for mutation in pending {
        println!(
            "  {:<6} {} (modified {}, queued {})",
            format!("{:?}", mutation.action).to_lowercase(),
            mutation.key,
            format_timestamp(mutation.last_modified),
            mutation.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn describe(outcome: WriteOutcome) -> &'static str {
    match outcome {
        WriteOutcome::Pushed => "pushed",
        WriteOutcome::Queued => "queued",
    }
}

fn print_record(record: &Record) {
    let value = if record.deleted {
        "<deleted>".to_string()
    } else {
        record.value.to_string()
    };
    println!(
        "  {}  [{}]  {}",
        record.key,
        format_timestamp(record.last_modified),
        value
    );
}

fn print_report(report: &SyncReport) {
    println!("Sync Report:");
    println!("  Success: {}", report.success);
    println!("  Items processed: {}", report.items_processed);
    println!(
        "    Replayed: {}  Pushed: {}  Pulled: {}  Failed: {}",
        report.replayed, report.pushed, report.pulled, report.failed
    );
    println!("  Duration: {:?}", report.duration);

    if !report.conflicts.is_empty() {
        println!("  Conflicts:");
        for conflict in &report.conflicts {
            println!(
                "    {}: local {} / remote {}",
                conflict.key, conflict.local_value, conflict.remote_value
            );
        }
        println!("  Run `draftsync resolve KEY --strategy local|remote|merge` to settle them.");
    }
}

fn format_timestamp(ts: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_resolve() {
        let cli = Cli::parse_from(["draftsync", "resolve", "k2", "--strategy", "merge"]);
        assert!(matches!(
            cli.command,
            Commands::Resolve {
                strategy: ConflictStrategy::Merge,
                ..
            }
        ));
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli = Cli::parse_from(["draftsync", "list", "--offline", "--prefix", "drafts/"]);
        assert!(cli.offline);
        assert!(matches!(cli.command, Commands::List { ref prefix } if prefix == "drafts/"));
    }

    #[tokio::test]
    async fn test_local_only_engine_queues_writes() {
        let temp = TempDir::new().unwrap();
        let config = ClientConfig {
            data_dir: Some(temp.path().to_path_buf()),
            ..ClientConfig::default()
        };

        {
            let engine = open_engine(&config, false).await.unwrap();
            assert_eq!(
                engine.put("k1", serde_json::json!("A")).await.unwrap(),
                WriteOutcome::Queued
            );
            assert!(engine.reconcile().await.is_offline());
        }

        let engine = open_engine(&config, false).await.unwrap();
        assert_eq!(engine.get("k1").unwrap().unwrap().value, serde_json::json!("A"));
        assert_eq!(engine.pending_mutations().await.len(), 1);
    }
}
