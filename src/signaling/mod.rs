#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;

use crate::auth;
use crate::clients::ClientRegistry;
use crate::config::AppConfig;
use crate::events::EventBridge;
use crate::media::MediaAdapter;
use crate::metrics::ServerMetrics;
use crate::recorder::RecorderClient;
use crate::rooms::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Everything the message handlers need. Registries are process-wide and
/// constructed once at startup; tests build fresh instances per case.
pub struct SharedState {
    pub clients: Arc<ClientRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub media: Option<Arc<MediaAdapter>>,
    pub bridge: Arc<EventBridge>,
    pub recorder: Option<Arc<RecorderClient>>,
    pub metrics: ServerMetrics,
    pub config: Arc<AppConfig>,
}

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    state: Arc<SharedState>,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(state: Arc<SharedState>) -> Self {
        let max_connections = state.config.max_connections;
        info!("Max connections: {}", max_connections);
        if state.config.enable_auth {
            info!("Authentication required (ENABLE_AUTH=1)");
        } else {
            info!("Authentication optional — tokens attach a principal when present");
        }

        Self {
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            state,
        }
    }

    pub fn state(&self) -> Arc<SharedState> {
        self.state.clone()
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// WebSocket upgrade handler. Token validation happens here so the session
/// either starts authenticated or is told "unauthorized" and closed.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(server): State<SignalingServer>,
) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let user = params
        .get("token")
        .and_then(|t| auth::validate_token(t, server.state.config.jwt_secret.as_deref()));
    let auth_ok = !server.state.config.enable_auth || user.is_some();

    let state = server.state();
    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, state, user, auth_ok, permit)
        })
}
