//! WolfPackCtl - Command line tool for WolfPack clusters
//!
//! Usage:
//!   wolfpackctl status              - Show node status
//!   wolfpackctl records             - List records held by the node
//!   wolfpackctl write <id> <name>   - Submit a write
//!   wolfpackctl members             - List live cluster members

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use wolfpack::api::{ErrorResponse, StatusResponse};
use wolfpack::config::WolfPackConfig;
use wolfpack::replication::WriteResponse;
use wolfpack::state::MemberInfo;
use wolfpack::store::WriteRecord;

/// WolfPack Cluster Control Tool
#[derive(Parser)]
#[command(name = "wolfpackctl")]
#[command(about = "Control and monitor WolfPack clusters", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "wolfpack.toml")]
    config: PathBuf,

    /// Node API endpoint (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the node
    Status,
    /// List the records stored on the node, in insertion order
    Records,
    /// Submit a write to the node
    Write {
        id: i64,
        name: String,
        /// Send as if forwarded by this node address
        #[arg(long)]
        from: Option<String>,
    },
    /// List live cluster members
    Members,
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = resolve_endpoint(&cli);

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Records => list_records(&endpoint).await,
        Commands::Write { id, name, from } => write(&endpoint, *id, name, from.as_deref()).await,
        Commands::Members => list_members(&endpoint).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Endpoint from the flag, else from the config file's API address
fn resolve_endpoint(cli: &Cli) -> String {
    if let Some(endpoint) = &cli.endpoint {
        return if endpoint.starts_with("http") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint)
        };
    }

    let bind = WolfPackConfig::from_file(&cli.config)
        .and_then(|config| config.api_bind_address())
        .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

    // Convert a wildcard bind address to localhost
    match bind.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => format!("http://{}", bind),
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(url: &str) -> anyhow::Result<T> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("failed to reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }
    Ok(response.json().await?)
}

// ============ Commands ============

async fn show_status(endpoint: &str) -> anyhow::Result<()> {
    let status: StatusResponse = get_json(&format!("{}/status", endpoint)).await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Address:      {}", status.address);
    println!("State:        {}", status.state);
    println!("Role:         {}", if status.is_leader { "LEADER" } else { "Follower" });
    println!("Leader:       {}", status.leader.as_deref().unwrap_or("NONE"));
    println!("Terms Won:    {}", status.term);
    println!("Members:      {}", status.members);
    println!("Fan-out:      {} pending", status.pending_deliveries);
    println!();

    Ok(())
}

async fn list_records(endpoint: &str) -> anyhow::Result<()> {
    let records: Vec<WriteRecord> = get_json(&format!("{}/students", endpoint)).await?;

    println!("{:<12} {}", "ID", "NAME");
    println!("{}", "-".repeat(40));
    for record in &records {
        println!("{:<12} {}", record.id, record.name);
    }
    println!("\n{} record(s)", records.len());

    Ok(())
}

async fn write(endpoint: &str, id: i64, name: &str, from: Option<&str>) -> anyhow::Result<()> {
    let mut url = reqwest::Url::parse(endpoint).context("invalid endpoint")?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("endpoint cannot carry a path"))?
        .pop_if_empty()
        .extend(["student", &id.to_string(), name]);

    let client = reqwest::Client::new();
    let mut request = client.post(url);
    if let Some(from) = from {
        request = request.header(wolfpack::network::REQUEST_FROM_HEADER, from);
    }
    let response = request.send().await.context("failed to send write")?;

    if !response.status().is_success() {
        let status = response.status();
        match response.json::<ErrorResponse>().await {
            Ok(error) => bail!("{} ({}): {}", status, error.code, error.error),
            Err(_) => bail!("API error: {}", status),
        }
    }

    let result: WriteResponse = response.json().await?;
    println!("✓ {}", result.message);
    if let Some(leader) = result.leader {
        println!("  Leader: {}", leader);
    }
    Ok(())
}

async fn list_members(endpoint: &str) -> anyhow::Result<()> {
    let members: Vec<MemberInfo> = get_json(&format!("{}/cluster/members", endpoint)).await?;

    println!();
    println!("{:<25} {:<12} {}", "ADDRESS", "CANDIDATE", "REGISTERED");
    println!("{}", "-".repeat(65));
    for member in &members {
        println!(
            "{:<25} {:<12} {}",
            member.address,
            member.identity,
            member.registered_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!();

    Ok(())
}

fn check_config(path: &PathBuf) -> anyhow::Result<()> {
    let config = WolfPackConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    println!("✓ Configuration is valid: {}", path.display());
    println!("  Node Address: {}", config.node.address);
    println!("  API:          {}", config.api_bind_address()?);
    println!("  Coordinator:  {}", config.coordination.endpoint);
    Ok(())
}
