#![forbid(unsafe_code)]

mod client;
mod config;
mod engine;
mod metrics;
mod registry;
mod signaling;

use anyhow::Result;
use config::ServerConfig;
use engine::LocalMediaEngine;
use metrics::ServerMetrics;
use registry::RoomRegistry;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vibecall=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("VibeCall - Starting server");

    let config = ServerConfig::from_env();
    let metrics = ServerMetrics::new();

    let engine = Arc::new(LocalMediaEngine::new(config.codecs.clone()));
    let registry = Arc::new(RoomRegistry::new(engine, metrics.clone()));

    info!("Room registry and media engine initialized");

    let signaling_server = SignalingServer::new(registry.clone(), metrics, &config);
    let port = config.port;

    info!("Starting signaling server on port {}", port);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            registry.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
