//! WolfPack - Leader-Coordinated Write Routing
//!
//! Runs a cluster node or the coordination service it joins.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfpack::api::HttpServer;
use wolfpack::config::WolfPackConfig;
use wolfpack::coordination::{CoordinationBackend, CoordinatorServer, Ensemble, RemoteEnsemble};
use wolfpack::error::{Error, Result};
use wolfpack::network::{HttpTransport, Transport};
use wolfpack::store::{RecordStore, VolatileStore};
use wolfpack::Node;

/// WolfPack - Leader-Coordinated Write Routing
#[derive(Parser)]
#[command(name = "wolfpack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfpack.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a WolfPack node
    Start {
        /// Override the node address from the config file
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Run the coordination service
    Coordinator {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:2181")]
        listen: String,

        /// How often expired sessions are swept, in milliseconds
        #[arg(long, default_value = "200")]
        reap_interval_ms: u64,
    },

    /// Check node status
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:8081")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfpack.toml")]
        output: PathBuf,

        /// Node address (a port or host:port)
        #[arg(long, default_value = "8081")]
        address: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config-driven logging only applies to commands that read the config
    let file_logging = match cli.command {
        Commands::Start { .. } => WolfPackConfig::from_file(&cli.config).ok().map(|c| c.logging),
        _ => None,
    };
    let level = cli
        .log_level
        .clone()
        .or_else(|| file_logging.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = file_logging
        .as_ref()
        .map(|l| l.format.clone())
        .unwrap_or_else(|| "pretty".to_string());
    init_logging(&level, &format);

    match cli.command {
        Commands::Start { address } => run_start(cli.config, address).await,
        Commands::Coordinator {
            listen,
            reap_interval_ms,
        } => run_coordinator(listen, reap_interval_ms).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, address } => run_init(output, address),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start a WolfPack node
async fn run_start(config_path: PathBuf, address: Option<String>) -> Result<()> {
    tracing::info!("Starting WolfPack node...");

    let mut config = match WolfPackConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    if let Some(address) = address {
        config.node.address = address;
        config.validate()?;
    }
    tracing::info!("Loaded configuration for node: {}", config.node.address);

    // Listen before joining so fan-out to this node works once it is registered
    let bind_address = config.api_bind_address()?;
    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind HTTP API on {}: {}", bind_address, e);
            return Err(e.into());
        }
    };

    let backend: Arc<dyn CoordinationBackend> = Arc::new(RemoteEnsemble::new(
        &config.coordination.endpoint,
        config.request_timeout(),
    )?);
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        config.replication.peer_host.clone(),
        config.request_timeout(),
    )?);
    let store: Arc<dyn RecordStore> = Arc::new(VolatileStore::new());

    tracing::info!("Connecting to coordination service at {}", config.coordination.endpoint);
    let node = Node::start(config.clone(), backend, transport, store).await?;

    let server = HttpServer::new(config.api.cors_enabled, node.app_state());
    let shutdown = node.shutdown_token();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server
            .serve(listener, async move { shutdown.cancelled().await })
            .await
        {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    node.close().await;
    let _ = server_handle.await;

    tracing::info!("WolfPack shutdown complete");
    Ok(())
}

/// Run the coordination service
async fn run_coordinator(listen: String, reap_interval_ms: u64) -> Result<()> {
    tracing::info!("Starting WolfPack coordinator...");

    let server = CoordinatorServer::new(
        listen,
        Arc::new(Ensemble::new()),
        Duration::from_millis(reap_interval_ms.max(1)),
    );

    server
        .start(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal");
        })
        .await?;

    tracing::info!("Coordinator shutdown complete");
    Ok(())
}

/// Check node status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

fn run_init(output: PathBuf, address: String) -> Result<()> {
    let config_content = format!(r#"# WolfPack Configuration
# Generated configuration file

[node]
# Address other nodes reach this node at: a port or host:port
address = "{address}"

[coordination]
endpoint = "http://127.0.0.1:2181"
session_timeout_ms = 5000
base_sleep_ms = 1000
max_retries = 5
max_sleep_ms = 30000
election_path = "/leader-election"
leader_path = "/leader-port"
members_path = "/workers"

[replication]
peer_host = "127.0.0.1"
request_timeout_ms = 5000

[api]
# bind_address = "0.0.0.0:8081"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nStart a coordinator with: wolfpack coordinator --listen 0.0.0.0:2181");
    println!("Then start nodes with: wolfpack --config {} start", output.display());

    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfPackConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node Address: {}", config.node.address);
            println!("  Coordinator: {}", config.coordination.endpoint);
            println!("  Session Timeout: {} ms", config.coordination.session_timeout_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfPackConfig::from_file(&config_path)?;

    println!("WolfPack Node Information");
    println!("=========================");
    println!();
    println!("Node Address:     {}", config.node.address);
    match config.api_bind_address() {
        Ok(bind) => println!("HTTP API:         {}", bind),
        Err(e) => println!("HTTP API:         ({})", e),
    }
    println!("CORS:             {}", config.api.cors_enabled);
    println!();
    println!("Coordination:");
    println!("  Endpoint:       {}", config.coordination.endpoint);
    println!("  Session:        {} ms", config.coordination.session_timeout_ms);
    println!(
        "  Retry:          {} ms base, {} retries, {} ms cap",
        config.coordination.base_sleep_ms,
        config.coordination.max_retries,
        config.coordination.max_sleep_ms
    );
    println!("  Election Path:  {}", config.coordination.election_path);
    println!("  Leader Path:    {}", config.coordination.leader_path);
    println!("  Members Path:   {}", config.coordination.members_path);
    println!();
    println!("Replication:");
    println!("  Peer Host:      {}", config.replication.peer_host);
    println!("  Timeout:        {} ms", config.replication.request_timeout_ms);

    Ok(())
}
