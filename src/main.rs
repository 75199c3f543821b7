#![forbid(unsafe_code)]

use anyhow::Result;
use roomcast::admin::AdminServer;
use roomcast::clients::ClientRegistry;
use roomcast::config::AppConfig;
use roomcast::events::EventBridge;
use roomcast::media::{MediaAdapter, MediaSettings};
use roomcast::metrics::ServerMetrics;
use roomcast::recorder::RecorderClient;
use roomcast::rooms::RoomRegistry;
use roomcast::signaling::{SharedState, SignalingServer};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Roomcast - starting signaling control plane");

    let config = Arc::new(AppConfig::from_env());
    let metrics = ServerMetrics::new();

    let clients = Arc::new(ClientRegistry::new());
    let rooms = Arc::new(RoomRegistry::new());
    let bridge = Arc::new(EventBridge::new(clients.clone(), rooms.clone()));

    // Adapter construction is cheap; workers spawn on first use.
    let (media, engine_events) = MediaAdapter::new(MediaSettings::from_app_config(&config));
    let media = Arc::new(media);
    tokio::spawn(bridge.clone().run(engine_events));

    let recorder = config
        .recorder
        .clone()
        .map(|rc| Arc::new(RecorderClient::new(rc)));
    if let Some(rc) = &config.recorder {
        info!("Recorder RPC configured at {}", rc.api_url);
    }

    let state = Arc::new(SharedState {
        clients,
        rooms,
        media: Some(media),
        bridge,
        recorder,
        metrics,
        config: config.clone(),
    });

    let signaling = SignalingServer::new(state.clone());
    let admin = AdminServer::new(state);

    // Run both surfaces until one fails or Ctrl+C arrives
    tokio::select! {
        result = signaling.serve(config.port) => {
            if let Err(e) = result {
                error!("Signaling server error: {}", e);
            }
        }
        result = admin.serve(config.admin_port) => {
            if let Err(e) = result {
                error!("Admin server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
