#![forbid(unsafe_code)]

// Read-only admin HTTP surface, served on its own port. Every route except
// /admin/health requires an admin token, via Authorization: Bearer or ?token=.

use crate::auth;
use crate::signaling::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Clone)]
pub struct AdminServer {
    state: Arc<SharedState>,
}

impl AdminServer {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self { state }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/admin/health", get(health_handler))
            .route("/admin/rooms", get(rooms_handler))
            .route("/admin/room/{name}", get(room_info_handler))
            .route("/admin/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the admin server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting admin server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

/// Bearer or ?token= with an admin principal.
fn authorize(
    state: &SharedState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<(), Response> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| params.get("token").cloned());

    let user = token
        .as_deref()
        .and_then(|t| auth::validate_token(t, state.config.jwt_secret.as_deref()));

    match user {
        Some(user) if user.is_admin() => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, "admin access required").into_response()),
    }
}

/// Health check handler
async fn health_handler(State(server): State<AdminServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.state.rooms.count(),
        "clients": server.state.clients.count(),
    }))
}

/// GET /admin/rooms — control-plane overview plus the engine's view
async fn rooms_handler(
    State(server): State<AdminServer>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authorize(&server.state, &headers, &params) {
        return denied;
    }

    let mut body = serde_json::json!({
        "rooms": server.state.rooms.overview(),
    });
    if let Some(media) = &server.state.media {
        if let Ok(engine) = serde_json::to_value(media.rooms_overview()) {
            body["engine"] = engine;
        }
    }
    Json(body).into_response()
}

/// GET /admin/room/{name}
async fn room_info_handler(
    State(server): State<AdminServer>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authorize(&server.state, &headers, &params) {
        return denied;
    }

    match server.state.rooms.info(&name) {
        Some(info) => Json(info).into_response(),
        None => (StatusCode::NOT_FOUND, "room not found").into_response(),
    }
}

/// GET /admin/metrics — Prometheus text exposition format
async fn metrics_handler(
    State(server): State<AdminServer>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(denied) = authorize(&server.state, &headers, &params) {
        return denied;
    }

    let state = &server.state;
    let mut body = state
        .metrics
        .render_prometheus(state.rooms.count(), state.clients.count());

    if let Some(media) = &state.media {
        let engine = media.metrics();
        for (name, help, value) in [
            ("roomcast_engine_workers", "Media workers running", engine.workers as u64),
            ("roomcast_engine_transports_active", "Active engine transports", engine.transports as u64),
            ("roomcast_engine_producers_active", "Active engine producers", engine.producers as u64),
            ("roomcast_engine_consumers_active", "Active engine consumers", engine.consumers as u64),
        ] {
            let _ = writeln!(body, "# HELP {name} {help}");
            let _ = writeln!(body, "# TYPE {name} gauge");
            let _ = writeln!(body, "{name} {value}");
        }
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{create_token, UserRole};
    use crate::clients::ClientRegistry;
    use crate::config::AppConfig;
    use crate::events::EventBridge;
    use crate::metrics::ServerMetrics;
    use crate::rooms::RoomRegistry;

    fn make_state(secret: Option<&str>) -> Arc<SharedState> {
        let clients = Arc::new(ClientRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let bridge = Arc::new(EventBridge::new(clients.clone(), rooms.clone()));
        let config = AppConfig {
            jwt_secret: secret.map(str::to_string),
            ..AppConfig::default()
        };
        Arc::new(SharedState {
            clients,
            rooms,
            media: None,
            bridge,
            recorder: None,
            metrics: ServerMetrics::new(),
            config: Arc::new(config),
        })
    }

    #[test]
    fn test_authorize_accepts_admin_bearer_only() {
        let secret = "test-secret-at-least-32-bytes-long!!";
        let state = make_state(Some(secret));

        let admin_token = create_token("root", "Root", UserRole::Admin, secret).unwrap();
        let user_token = create_token("joe", "Joe", UserRole::User, secret).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {admin_token}").parse().unwrap(),
        );
        assert!(authorize(&state, &headers, &HashMap::new()).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {user_token}").parse().unwrap(),
        );
        assert!(authorize(&state, &headers, &HashMap::new()).is_err());

        assert!(authorize(&state, &HeaderMap::new(), &HashMap::new()).is_err());
    }

    #[test]
    fn test_authorize_accepts_query_token() {
        let secret = "test-secret-at-least-32-bytes-long!!";
        let state = make_state(Some(secret));
        let admin_token = create_token("root", "Root", UserRole::Admin, secret).unwrap();

        let mut params = HashMap::new();
        params.insert("token".to_string(), admin_token);
        assert!(authorize(&state, &HeaderMap::new(), &params).is_ok());
    }

    #[test]
    fn test_authorize_rejects_without_secret() {
        let state = make_state(None);
        let token = create_token("root", "Root", UserRole::Admin, "whatever").unwrap();
        let mut params = HashMap::new();
        params.insert("token".to_string(), token);
        assert!(authorize(&state, &HeaderMap::new(), &params).is_err());
    }
}
