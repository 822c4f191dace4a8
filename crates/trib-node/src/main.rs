use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tokio::sync::watch;

use trib_engine::{DeliveryConfig, DeliveryLoop, FailurePolicy, GroupConsumer, Publisher, Reconciler};
use trib_storage::{DocumentStore, FjallDocumentStore, FjallMessageLog, FjallStore};
use trib_types::{Envelope, Operation, PartitionId, Product};

#[derive(clap::Parser, Debug)]
#[command(name = "trib-node", about = "Tributary log-to-document reconciliation node")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Consume the log and reconcile envelopes into the document store (default).
    Run {
        /// Overrides `consumer.group_id`.
        #[arg(long)]
        group_id: Option<String>,
        /// Partition to consume, repeatable. Overrides `consumer.partitions`.
        #[arg(long = "partition")]
        partitions: Vec<PartitionId>,
    },
    /// Append one envelope to the log. The node must not be running.
    Publish {
        /// CREATE, UPDATE or DELETE. Other labels are published as-is.
        #[arg(long)]
        operation: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        expired: String,
        #[arg(long, default_value = "")]
        brand: String,
    },
    /// Print every stored document as one JSON object per line.
    Documents,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
    partitions: u32,
}

#[derive(Debug, Deserialize)]
struct ConsumerConfig {
    group_id: String,
    partitions: Vec<PartitionId>,
    poll_interval_ms: u64,
    fetch_retry_backoff_ms: u64,
    on_failure: FailurePolicy,
    rewind_backoff_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    consumer: ConsumerConfig,
    observability: ObservabilityConfig,
}

impl ConsumerConfig {
    fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            on_failure: self.on_failure,
            fetch_retry_backoff: Duration::from_millis(self.fetch_retry_backoff_ms),
            rewind_backoff: Duration::from_millis(self.rewind_backoff_ms),
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(config_path) = path {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    figment
        .merge(Env::prefixed("TRIBUTARY_").split("__"))
        .extract()
        .context("failed to load configuration")
}

fn init_tracing(config: &ObservabilityConfig) {
    // stderr keeps stdout free for `documents` output.
    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

/// Open the node's storage. Any failure here aborts startup.
fn init(config: &StorageConfig) -> anyhow::Result<Arc<FjallStore>> {
    FjallStore::open(&config.data_dir, config.partitions).with_context(|| {
        format!("failed to open storage at {}", config.data_dir.display())
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run(
    store: Arc<FjallStore>,
    config: &ConsumerConfig,
    group_id: String,
    partitions: Vec<PartitionId>,
) -> anyhow::Result<()> {
    let log = Arc::new(FjallMessageLog(store.clone()));
    let documents = Arc::new(FjallDocumentStore::new(store));

    let consumer = GroupConsumer::subscribe(
        log,
        group_id,
        partitions,
        Duration::from_millis(config.poll_interval_ms),
    )
    .await
    .context("failed to subscribe to the log")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let delivery = DeliveryLoop::new(consumer, Reconciler::new(documents), config.delivery());
    let mut worker = tokio::spawn(delivery.run(shutdown_rx));

    let stats = tokio::select! {
        joined = &mut worker => joined.context("delivery loop panicked")?,
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested");
            // A send error means the loop already exited.
            let _ = shutdown_tx.send(true);
            worker.await.context("delivery loop panicked")?
        }
    };
    tracing::info!(
        applied = stats.applied,
        skipped = stats.skipped,
        failed = stats.failed,
        decode_failures = stats.decode_failures,
        "node stopped"
    );
    Ok(())
}

async fn publish(store: Arc<FjallStore>, envelope: Envelope) -> anyhow::Result<()> {
    let publisher = Publisher::new(Arc::new(FjallMessageLog(store)));
    let (partition, offset) = publisher.publish(&envelope).await.context("failed to publish")?;
    println!("{partition}\t{offset}");
    Ok(())
}

async fn documents(store: Arc<FjallStore>) -> anyhow::Result<()> {
    let docs = FjallDocumentStore::new(store).list().await.context("failed to list documents")?;
    for doc in docs {
        println!("{}", serde_json::to_string(&doc)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    init_tracing(&config.observability);

    let command = cli.command.unwrap_or(Command::Run { group_id: None, partitions: Vec::new() });
    let store = init(&config.storage)?;

    match command {
        Command::Run { group_id, partitions } => {
            let group_id = group_id.unwrap_or_else(|| config.consumer.group_id.clone());
            let partitions =
                if partitions.is_empty() { config.consumer.partitions.clone() } else { partitions };
            tracing::info!(
                data_dir = %config.storage.data_dir.display(),
                partitions = config.storage.partitions,
                group_id = %group_id,
                on_failure = ?config.consumer.on_failure,
                "node starting"
            );
            run(store, &config.consumer, group_id, partitions).await
        }
        Command::Publish { operation, name, expired, brand } => {
            let envelope = Envelope::new(Operation::parse(&operation), Product::new(name, expired, brand));
            publish(store, envelope).await
        }
        Command::Documents => documents(store).await,
    }
}
