use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

// Added for tracing file logging
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use wearlink::core::TransferStatus;
use wearlink::utils::format_size;
use wearlink::{
    AppConfig, ChannelConsumer, EventKind, LoggingConsumer, Node, SimNetwork, StatusCode, WearConsumer, WearEvent,
    WearService,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file from a simulated phone to a simulated watch
    Transfer {
        /// Path to the file to send
        #[arg(short, long)]
        file: PathBuf,

        /// Name announced to the receiver instead of the file's own name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Broadcast /ping to the nearby nodes of a three-node network
    Ping {
        #[arg(short, long, default_value_t = 1)]
        count: u32,
    },
    /// Sync a string value and show the change seen by the peer
    Sync {
        #[arg(short, long)]
        path: String,

        #[arg(short, long)]
        key: String,

        #[arg(short, long)]
        value: String,

        /// Ask the transport to deliver the record with priority
        #[arg(short, long)]
        urgent: bool,
    },
}

// Returns a WorkerGuard that must be kept alive for logs to be written
fn init_logging(log_dir: &str, log_file_prefix: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir).with_context(|| format!("creating log directory {}", log_dir))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_prefix);
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_appender)
        .with_ansi(false); // Don't use ANSI codes in files

    let console_layer = fmt::layer().with_writer(std::io::stderr);

    // Use RUST_LOG env var, default to info with debug for this crate
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,wearlink=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

/// One simulated device running its own service
struct DemoNode {
    service: Arc<WearService>,
    // Registry holds consumers weakly
    _logger: Arc<dyn WearConsumer>,
}

async fn start_node(network: &SimNetwork, node: Node, config: &AppConfig) -> Result<DemoNode> {
    let node_dir = Path::new(&config.data_directory).join("demo").join(node.id.as_str());
    let node_config = AppConfig {
        log_directory: config.log_directory.clone(),
        initial_capabilities: config.initial_capabilities.clone(),
        max_message_bytes: config.max_message_bytes,
        blocking_timeout_ms: config.blocking_timeout_ms,
        copy_buffer_bytes: config.copy_buffer_bytes,
        ..AppConfig::with_data_dir(node_dir)
    };

    let (endpoint, events) = network.add_node(node.clone());
    let service = WearService::new(node_config, endpoint, events).map_err(|e| anyhow!(e))?;
    service.start();

    let logger: Arc<dyn WearConsumer> = Arc::new(LoggingConsumer);
    service.add_consumer(logger.clone());

    let status = service.connect().await;
    if status != StatusCode::Success {
        bail!("{} failed to connect: {}", node.id, status);
    }
    Ok(DemoNode {
        service,
        _logger: logger,
    })
}

/// Wait until `service` sees `count` peers
async fn wait_for_peers(service: &WearService, count: usize) -> Result<()> {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while service.connected_nodes().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("timed out waiting for peers")
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<WearEvent>) -> Result<WearEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .context("timed out waiting for an event")?
        .context("event channel closed")
}

async fn run_transfer(config: &AppConfig, file: PathBuf, name: Option<String>) -> Result<()> {
    if !file.exists() {
        bail!("File does not exist: {}", file.display());
    }

    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true), config).await?;
    let watch = start_node(&network, Node::new("watch", "Watch", true), config).await?;
    wait_for_peers(&phone.service, 1).await?;

    let (finished, mut finished_rx) = ChannelConsumer::with_kinds(&[EventKind::TransferFinished]);
    watch.service.add_consumer(finished.clone());

    let watch_id = watch.service.local_node().id;
    let request_id = phone
        .service
        .send_file(&watch_id, &file, name.as_deref(), None)
        .await
        .context("sending file")?;
    println!("Sent {} as request {}", file.display(), request_id);

    if let WearEvent::TransferFinished(outcome) = next_event(&mut finished_rx).await? {
        println!(
            "Transfer {:?}: {} of {} bytes",
            outcome.status,
            format_size(outcome.received_bytes),
            outcome.declared_bytes.map(format_size).unwrap_or_default()
        );
        if let Some(path) = &outcome.file {
            println!("Stored at {}", path.display());
        }
        if outcome.status != TransferStatus::Completed {
            bail!("transfer {} failed", outcome.request_id);
        }
    }
    Ok(())
}

async fn run_ping(config: &AppConfig, count: u32) -> Result<()> {
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true), config).await?;
    let _watch = start_node(&network, Node::new("watch", "Watch", true), config).await?;
    let _tablet = start_node(&network, Node::new("tablet", "Tablet (cloud)", false), config).await?;
    wait_for_peers(&phone.service, 2).await?;

    for round in 1..=count {
        let results = phone.service.broadcast_message("/ping", format!("ping {}", round).as_bytes()).await;
        println!("Round {}: {} nearby nodes", round, results.len());
        for (node_id, result) in results {
            match result.request_id {
                Some(id) => println!("  {} -> {} (request {})", node_id, result.status, id),
                None => println!("  {} -> {}", node_id, result.status),
            }
        }
    }
    Ok(())
}

async fn run_sync(config: &AppConfig, path: &str, key: &str, value: &str, urgent: bool) -> Result<()> {
    let network = SimNetwork::new();
    let phone = start_node(&network, Node::new("phone", "Phone", true), config).await?;
    let watch = start_node(&network, Node::new("watch", "Watch", true), config).await?;

    let (changes, mut changes_rx) = ChannelConsumer::with_kinds(&[EventKind::DataChanged]);
    watch.service.add_consumer(changes.clone());

    let status = phone.service.sync(path, key, value, urgent).await;
    println!("Sync of {} finished with {}", path, status);
    if !status.is_success() {
        bail!("sync failed: {}", status);
    }

    if let WearEvent::DataChanged(item) = next_event(&mut changes_rx).await? {
        println!(
            "Watch saw {} from {}: {} = {:?}",
            item.path,
            item.source_node_id,
            key,
            item.data.get_string(key)
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref());

    // This guard needs to stay in scope, otherwise logs stop writing.
    let _guard = init_logging(&config.log_directory, "wearlink")?;
    info!("wearlink {}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Commands::Transfer { file, name } => run_transfer(&config, file, name).await,
        Commands::Ping { count } => run_ping(&config, count).await,
        Commands::Sync {
            path,
            key,
            value,
            urgent,
        } => run_sync(&config, &path, &key, &value, urgent).await,
    };

    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}
