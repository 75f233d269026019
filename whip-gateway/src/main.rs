//! whip-gateway - WHIP ingestion gateway in front of a Janus server.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use whip_gateway::endpoint::{EndpointDescriptor, Token};
use whip_gateway::{AppState, EndpointRegistry, GatewayConfig, IngestController, JanusClient};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "whip-gateway")]
#[command(version)]
#[command(about = "WHIP (RFC 9725) ingestion gateway for the Janus VideoRoom plugin")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "whip-gateway.toml")]
    config: PathBuf,

    /// HTTP bind address (overrides the config file)
    #[arg(short, long)]
    address: Option<String>,

    /// Base path for the HTTP surface (overrides the config file)
    #[arg(short, long)]
    base_path: Option<String>,

    /// Janus WebSocket URL (overrides the config file)
    #[arg(short = 'j', long)]
    janus_url: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let mut config = GatewayConfig::load(&args.config)?;
    if let Some(address) = args.address {
        config.http.address = address;
    }
    if let Some(base_path) = args.base_path {
        config.http.base_path = base_path;
    }
    if let Some(url) = args.janus_url {
        config.backend.url = url;
    }
    config.validate()?;

    let registry = Arc::new(EndpointRegistry::new());
    for declared in &config.endpoints {
        let endpoint = registry.create(EndpointDescriptor {
            id: declared.id.clone(),
            room: declared.room,
            label: declared.label.clone(),
            pin: declared.pin.clone(),
            secret: declared.secret.clone(),
            admin_key: declared.admin_key.clone(),
            token: declared.token.clone().map(Token::Static),
            ice_servers: declared.ice_servers.clone(),
            recipient: declared.recipient.clone(),
        })?;
        info!(endpoint = %endpoint.id, room = endpoint.room, "endpoint declared");
    }

    let (janus, backend_events) = JanusClient::new(config.backend.clone());
    let controller = IngestController::new(registry, janus.clone(), &config);

    // Backend connectivity is recoverable and must not gate startup:
    // publishes answer 503 and the healthcheck reports the outage until
    // the connection is up.
    tokio::spawn({
        let controller = controller.clone();
        async move {
            controller.connect_with_retry().await;
            controller.run(backend_events).await;
        }
    });

    let app = whip_gateway::http::router(AppState::new(controller, &config));
    // Failing to bind is the one startup error worth dying for.
    let listener = tokio::net::TcpListener::bind(&config.http.address).await?;
    info!(
        address = %config.http.address,
        base_path = %config.http.base_path,
        backend = %config.backend.url,
        "gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    janus.close().await;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("shutdown requested");
}
