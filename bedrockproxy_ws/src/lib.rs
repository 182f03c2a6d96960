//! WebSocket/JSON control plane (component G, §4.4).
//!
//! One `axum::Router` exposing the WebSocket endpoint, a `/health` snapshot,
//! and permissive CORS for the loopback front end. Grounded on the
//! teacher's `trakt_http_api::start` (an `axum::Router` built from
//! `Router::new().route(..)`, bound and served with
//! `axum::Server::bind(..).serve(..)`); we drop the teacher's
//! `utoipa`/Swagger machinery (no OpenAPI surface for a loopback-only,
//! single-consumer control plane) and use `try_bind` rather than `bind` so
//! a taken port surfaces as a `Result` instead of a panic (§7's bind
//! failure is fatal, but a clean one, caught by the daemon entry point).

mod connection_manager;
mod router;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bedrockproxy_core::{DataStore, ServerManager};
use futures::{SinkExt, StreamExt};
use bedrockproxy_api::envelope::ResponseEnvelope;
use serde_json::Value;
use time::OffsetDateTime;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

pub use connection_manager::{ConnectionManager, HealthSnapshot};

pub struct AppState {
    pub manager: Arc<ServerManager>,
    pub store: Arc<DataStore>,
    pub connections: Arc<ConnectionManager>,
}

/// Binds the control-plane listen socket and serves until `shutdown_signal`
/// resolves. A bind failure is the only fatal error here (§4.4, §7).
pub async fn start(
    bind_address: SocketAddr,
    manager: Arc<ServerManager>,
    store: Arc<DataStore>,
    connections: Arc<ConnectionManager>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    connections.clone().start_heartbeat();

    let state = Arc::new(AppState {
        manager,
        store,
        connections,
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .fallback(preflight_fallback)
        .layer(CorsLayer::permissive())
        .with_state(state);

    log::info!("WebSocket control plane listening on {}", bind_address);
    axum::Server::try_bind(&bind_address)
        .with_context(|| format!("failed to bind control plane on {}", bind_address))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("control plane server error")?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthSnapshot> {
    Json(state.connections.health_snapshot().await)
}

/// Catch-all for any path not otherwise routed. An `OPTIONS` request is a
/// CORS preflight (§6) — `CorsLayer::permissive()` already injected the
/// headers, so the body just needs to be an empty success. Anything else
/// unmatched is a plain 404.
async fn preflight_fallback(method: Method) -> impl IntoResponse {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let client_id = state.connections.register(tx).await;
    log::debug!("client {} connected", client_id);

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => handle_incoming(&recv_state, client_id, &text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    state.connections.unregister(client_id).await;
    log::debug!("client {} disconnected", client_id);
}

/// Parses one incoming frame and either updates heartbeat bookkeeping
/// (`pong`, no response) or dispatches it as a request and replies.
async fn handle_incoming(state: &Arc<AppState>, client_id: Uuid, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            log::debug!("dropping malformed frame from {}: {}", client_id, err);
            let response = ResponseEnvelope::err(
                String::new(),
                now_millis(),
                format!("INVALID_REQUEST: {}", err),
            );
            state.connections.send_to(client_id, response).await;
            return;
        }
    };
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    if kind == "pong" {
        state.connections.record_pong(client_id).await;
        return;
    }

    // The control plane always replies, even to a frame that parses as
    // JSON but fails to fit `RequestEnvelope` (e.g. a missing `id`); recover
    // whatever id is present in the raw value so the client can still
    // correlate the error response.
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_default();
    let req = match serde_json::from_value::<bedrockproxy_api::envelope::RequestEnvelope>(value) {
        Ok(req) => req,
        Err(err) => {
            log::debug!("dropping unparseable request from {}: {}", client_id, err);
            let response =
                ResponseEnvelope::err(id, now_millis(), format!("INVALID_REQUEST: {}", err));
            state.connections.send_to(client_id, response).await;
            return;
        }
    };
    let response = router::dispatch(state, client_id, req).await;
    state.connections.send_to(client_id, response).await;
}

fn now_millis() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp() * 1000
}
