//! Relaycast - real-time WebSocket relay server

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use relaycast::config::Config;
use relaycast::hub::Hub;
use relaycast::server::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(about = "Real-time WebSocket relay: every connection is a channel")]
#[command(version)]
struct Args {
    /// HTTP service address (overrides RELAYCAST_ADDR)
    #[arg(short, long)]
    addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("Relaycast v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(addr) = args.addr {
        config.listen_addr = addr;
    }

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(
        addr = %listener.local_addr()?,
        home_page = %config.home_page.display(),
        queue_capacity = config.queue_capacity,
        ping_period = ?config.ping_period(),
        "Starting Relaycast"
    );

    let hub = Hub::spawn(config.hub_capacity);
    let state = AppState::new(hub, config);

    server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    info!("Relaycast shutdown");
    Ok(())
}
