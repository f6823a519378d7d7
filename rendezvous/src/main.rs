//! Distributed Worker Bus Rendezvous Service
//!
//! Standalone host for the rendezvous endpoint workers use to discover each
//! other, for deployments where rank 0 should not host it in-process.
//!
//! # Usage
//!
//! ```bash
//! # Rendezvous for a 4-rank world on the default port
//! dwb-rendezvous --world-size 4
//!
//! # Custom bind address and port
//! dwb-rendezvous --world-size 4 --address 10.0.0.1 --port 29501
//! ```

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bus_core::RendezvousHost;

/// Distributed Worker Bus rendezvous
#[derive(Parser, Debug)]
#[command(name = "dwb-rendezvous")]
#[command(about = "Rendezvous service for the distributed worker bus")]
struct Args {
    /// Number of ranks expected to join
    #[arg(short, long)]
    world_size: u32,

    /// Port to listen on
    #[arg(short, long, default_value = "29500")]
    port: u16,

    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting DWB rendezvous");
    tracing::info!("  World size: {}", args.world_size);

    let host =
        RendezvousHost::bind(&format!("{}:{}", args.address, args.port), args.world_size).await?;

    tracing::info!("Listening on {}", host.addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down rendezvous...");
    host.shutdown().await;

    Ok(())
}
