use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use porthole::api::{issue_tunnel_id, tunnel_status};
use porthole::config::normalize_target;
use porthole::{ClientEvent, Forwarder, PortholeConfig, RelayAddr, TunnelClient};
use porthole_shared::protocol::validate_tunnel_id;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "porthole")]
#[command(author = "Porthole Team")]
#[command(version = "0.1.0")]
#[command(about = "Expose a local HTTP service through a porthole relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay WebSocket URL (default ws://localhost:8080)
    #[arg(short, long, global = true)]
    relay: Option<String>,

    /// Path to a porthole.yml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a local HTTP service
    Http {
        /// Local base URL or port (e.g. 3000 or http://localhost:3000)
        target: Option<String>,

        /// Tunnel id to claim; one is issued by the relay if omitted
        #[arg(short, long)]
        tunnel_id: Option<String>,
    },
    /// Show whether a tunnel is connected
    Status {
        tunnel_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let config = load_config(cli.config.as_deref())?;
    let relay_url = cli.relay.clone().unwrap_or_else(|| config.relay.clone());
    let relay = RelayAddr::parse(&relay_url)?;

    match cli.command {
        Commands::Http { target, tunnel_id } => {
            let target = target
                .or_else(|| config.target.clone())
                .context("No local target given; pass one or set `target` in porthole.yml")?;
            let tunnel_id = tunnel_id.or_else(|| config.tunnel_id.clone());
            run_http_tunnel(&relay, &config, &normalize_target(&target), tunnel_id).await?;
        }
        Commands::Status { tunnel_id } => {
            show_status(&relay, &tunnel_id).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PortholeConfig> {
    match path.map(Path::to_path_buf).or_else(PortholeConfig::find_config) {
        Some(path) => {
            debug!("Using config file {}", path.display());
            PortholeConfig::load(&path)
        }
        None => Ok(PortholeConfig::default()),
    }
}

/// Run the tunnel until Ctrl+C
async fn run_http_tunnel(
    relay: &RelayAddr,
    config: &PortholeConfig,
    target: &str,
    tunnel_id: Option<String>,
) -> Result<()> {
    let forwarder = Forwarder::new(target).with_context(|| format!("Invalid local target: {}", target))?;

    let tunnel_id = match tunnel_id {
        Some(id) => validate_tunnel_id(&id)?.to_string(),
        None => {
            let http = reqwest::Client::new();
            let id = issue_tunnel_id(&http, relay).await?;
            info!("Relay issued tunnel id {}", id);
            id
        }
    };

    let mut client = TunnelClient::new(relay, tunnel_id, forwarder, config.reconnect.backoff());
    let mut events = client.subscribe();

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(client.run(stop_rx));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });

    while let Some(event) = events.recv().await {
        if let ClientEvent::Connected { tunnel_id } = event {
            print_banner(&relay.public_url(&tunnel_id), target);
        }
    }

    handle.await.context("Tunnel task failed")?;
    println!("\n✓ Tunnel stopped.");
    Ok(())
}

fn print_banner(public_url: &str, target: &str) {
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  🚀 Porthole Active                                          ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", public_url);
    println!("║  Local:      {:<47} ║", target);
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");
}

async fn show_status(relay: &RelayAddr, tunnel_id: &str) -> Result<()> {
    validate_tunnel_id(tunnel_id)?;
    let http = reqwest::Client::new();
    let status = tunnel_status(&http, relay, tunnel_id).await?;

    if status.connected {
        println!("✓ Tunnel {} is online", status.tunnel_id);
        if let Some(since) = status.connected_at {
            println!("  Connected since: {}", since);
        }
        println!("  In-flight requests: {}", status.pending);
        println!("  Public URL: {}", relay.public_url(&status.tunnel_id));
    } else {
        println!("✗ Tunnel {} is offline", status.tunnel_id);
    }
    Ok(())
}
