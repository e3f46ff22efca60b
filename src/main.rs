//! peerdrop-relay - rendezvous relay for peerdrop peers

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peerdrop::config::{Args, LogFormat};
use peerdrop::relay::RelayServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("peerdrop={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Peerdrop Relay");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Max peers: {}", args.max_peers);
    info!("Max message: {} bytes", args.max_message_bytes);
    info!("======================================");

    let server = RelayServer::bind(args.listen, args.relay_config()).await?;
    server.serve().await?;

    Ok(())
}
