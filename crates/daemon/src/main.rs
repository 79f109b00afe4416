/// relaymesh - reverse-proxy mesh daemon
///
/// `serve` runs the relay server: the QUIC tunnel listener exit nodes
/// attach to, the SOCKS5 and HTTP CONNECT proxies end users connect to, and
/// the stats API. `exit` turns this machine into an exit node.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use relaymesh_common::ServerConfig;
use relaymesh_core::{collect_stats, ExitAgent, FleetStats, RelayServer};
use relaymesh_daemon::proxy::verifier_from_config;
use relaymesh_daemon::{ApiServer, ProxyManager};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "relaymesh.toml";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "relaymesh", version, about = "Multiplexed reverse-proxy mesh")]
struct Cli {
    /// Log filter, e.g. `info` or `relaymesh_core=debug`. Overrides RUST_LOG.
    #[arg(long, global = true, env = "RELAYMESH_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server and its proxy listeners
    Serve {
        /// Configuration file, created with defaults if missing
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Run an exit node attached to a relay server
    Exit {
        /// QUIC address of the relay server
        #[arg(short, long)]
        server: SocketAddr,

        /// Reward address announced to the server
        #[arg(short, long)]
        address: Option<String>,
    },
    /// Write a configuration file with every default spelled out
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG)]
        file: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    info!("relaymesh v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve { config } => run_server(&config).await,
        Command::Exit { server, address } => run_exit_node(server, address).await,
        Command::InitConfig { file, force } => init_config(&file, force),
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load the config file, or save and use the defaults if it does not exist
fn load_config(path: &Path) -> Result<ServerConfig> {
    if path.exists() {
        info!("Loading configuration from {:?}", path);
        return Ok(ServerConfig::from_file(path)?);
    }

    info!("No configuration file found, using defaults");
    let config = ServerConfig::default();
    if let Err(e) = config.to_file(path) {
        warn!("Failed to save default config: {}", e);
    } else {
        info!("Saved default configuration to {:?}", path);
    }
    Ok(config)
}

async fn run_server(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let socks_addr = config.socks_listen;
    let http_addr = config.http_listen;
    let api_addr = config.api_listen;
    let verifier = verifier_from_config(&config);

    let server = Arc::new(RelayServer::new(config)?);
    let tunnel_addr = server.start().await?;

    info!("Exit nodes attach via QUIC on {} or WebSocket on ws://{}/ws", tunnel_addr, api_addr);
    info!("SOCKS5 proxy on {}, HTTP proxy on {}", socks_addr, http_addr);

    let api = ApiServer::new(api_addr, server.clone());
    tokio::spawn(async move {
        if let Err(e) = api.start().await {
            error!("API server error: {}", e);
        }
    });

    let proxies = ProxyManager::new(socks_addr, http_addr, server.engine().clone(), verifier);

    let result = tokio::select! {
        result = proxies.start() => result,
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            signal.map_err(Into::into)
        }
    };

    print_fleet_stats(&collect_stats(server.registry(), None).await);
    server.shutdown().await;
    info!("Relay server stopped");
    result
}

async fn run_exit_node(server: SocketAddr, address: Option<String>) -> Result<()> {
    let agent = ExitAgent::new().with_reward_address(address);
    info!("Exit node connecting to {}", server);

    // Reconnect until interrupted
    loop {
        tokio::select! {
            result = agent.connect_quic(server) => match result {
                Ok(()) => warn!("Tunnel to {} closed, reconnecting in {:?}", server, RECONNECT_DELAY),
                Err(e) => warn!("Tunnel to {} failed: {}, retrying in {:?}", server, e, RECONNECT_DELAY),
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Exit node stopped");
                return Ok(());
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!("{:?} already exists, pass --force to overwrite", path));
    }
    ServerConfig::default().to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn print_fleet_stats(stats: &FleetStats) {
    println!("\n========================================");
    println!("         relaymesh Fleet Status");
    println!("========================================");
    println!("Exit nodes:       {}", stats.node_count);
    println!("Active streams:   {}", stats.active_conns);
    println!("Traffic:          {}", stats.total_traffic);
    println!("Est. rewards:     ${:.4}", stats.estimated_reward_usd);
    for node in &stats.nodes {
        println!(
            "  {:<24} {:<8} score {:>6.2}  {}",
            node.id, node.region, node.score, node.total_traffic
        );
    }
    println!("========================================\n");
}
