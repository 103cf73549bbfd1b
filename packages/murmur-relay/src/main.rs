//! Murmur Relay Server
//!
//! The real-time layer of a two-party messenger:
//!
//! 1. **Presence**: one live session per identity; online/offline changes
//!    are broadcast to every connected client and written through to the
//!    user store.
//!
//! 2. **Typing indicators**: debounced per conversation, expiring after
//!    three seconds without renewal.
//!
//! 3. **Message fan-out**: new messages, deletions, read receipts and
//!    reaction changes reach the other participant when it is online.
//!
//! 4. **Call signaling**: call control and WebRTC offer/answer/ICE frames
//!    are forwarded between identities. The relay keeps no call state.
//!
//! Connections are authorised at upgrade time; see [`auth`].

mod auth;
mod error;
mod handler;
mod presence;
mod reactions;
mod registry;
mod relay;
mod signaling;
mod state;
mod store;
mod typing;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use auth::{DevVerifier, IdentityVerifier, JwtVerifier};
use state::{RelayConfig, RelayState};
use store::MemoryStore;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "murmur-relay", version, about = "Murmur real-time relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = state::DEFAULT_PORT, env = "RELAY_PORT")]
    port: u16,

    /// HS256 secret for verifying connection tokens. Without one every
    /// announced identity is trusted (development only).
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Directory for persisted messages and presence records.
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<String>,

    /// Typing indicator expiry in milliseconds
    #[arg(long, default_value_t = 3000, env = "TYPING_TIMEOUT_MS")]
    typing_timeout_ms: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "murmur_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RelayConfig {
        port: args.port,
        typing_timeout: Duration::from_millis(args.typing_timeout_ms),
        data_dir: args.data_dir,
    };

    let store = Arc::new(MemoryStore::new(config.data_dir.as_deref()));
    store.load_from_disk();

    let verifier: Arc<dyn IdentityVerifier> = match args.jwt_secret.as_deref() {
        Some(secret) if !secret.is_empty() => Arc::new(JwtVerifier::new(secret)),
        _ => {
            tracing::warn!("No JWT secret configured, trusting announced identities");
            Arc::new(DevVerifier)
        }
    };

    let port = config.port;
    let state = RelayState::new(config, store.clone(), store, verifier);
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Murmur relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/presence/:identity", get(presence_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// WebSocket upgrade handler. The upgrade is refused before any relay event
/// runs if the credentials do not verify.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<RelayState>,
) -> Response {
    let token = auth::extract_token(&headers, params.token.as_deref());
    match state.verifier.verify(token) {
        Ok(verified) => {
            ws.on_upgrade(move |socket| handler::handle_websocket(socket, state, verified))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rejected WebSocket upgrade");
            (StatusCode::UNAUTHORIZED, e.to_string()).into_response()
        }
    }
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "murmur-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_sessions": state.online_count(),
        "typing_indicators": state.typing.armed_count(),
        "pending_reaction_edits": state.messages.pending_edits(),
    }))
}

async fn presence_handler(
    Path(identity): Path<String>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    Json(state.presence.query(&identity).await)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use murmur_core::protocol::PresenceInfo;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn test_state() -> RelayState {
        let store = Arc::new(MemoryStore::new(None));
        RelayState::new(
            RelayConfig::default(),
            store.clone(),
            store,
            Arc::new(DevVerifier),
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(router(test_state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "murmur-relay");
    }

    #[tokio::test]
    async fn test_stats_counts_sessions() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.presence.connect("alice", tx);

        let (status, body) = get_json(router(state), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["online_sessions"], 1);
        assert_eq!(body["typing_indicators"], 0);
    }

    #[tokio::test]
    async fn test_presence_endpoint() {
        let state = test_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.presence.connect("alice", tx);
        let app = router(state);

        let (_, body) = get_json(app.clone(), "/presence/alice").await;
        let info: PresenceInfo = serde_json::from_value(body).unwrap();
        assert!(info.is_online);

        let (_, body) = get_json(app, "/presence/bob").await;
        let info: PresenceInfo = serde_json::from_value(body).unwrap();
        assert!(!info.is_online);
        assert!(info.last_seen_at.is_none());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["murmur-relay"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.typing_timeout_ms, 3000);
        assert!(!args.log_json);
    }
}
