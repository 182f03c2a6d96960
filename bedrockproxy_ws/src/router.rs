//! Message Router (component G, §4.4).
//!
//! Decodes a [`RequestEnvelope`], dispatches to the Server Manager / Data
//! Store / Detector, and serializes the result back into a
//! [`ResponseEnvelope`]. Grounded on the teacher's `resources.rs` handlers
//! (one function per route, extracting path/body then calling into
//! `TraktApi`) generalized from axum extractors to a single `type`-keyed
//! `match`, since every request here arrives over one WebSocket frame
//! rather than one HTTP route per operation.

use std::sync::Arc;

use bedrockproxy_api::envelope::{normalize_topics, RequestEnvelope, ResponseEnvelope};
use bedrockproxy_api::error::ErrorCode;
use bedrockproxy_api::model::{
    AddFromDetectionRequest, AddServerRequest, AppConfig, UpdateServerRequest,
};
use bedrockproxy_core::detector;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
struct IdRequest {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    id: Uuid,
    action: String,
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetectRequest {
    executable_path: String,
}

#[derive(Debug, Deserialize)]
struct GetConsoleRequest {
    id: Uuid,
    #[serde(default)]
    n: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ConsoleCommandRequest {
    id: Uuid,
    command: String,
}

/// Dispatches one decoded request. `client_id` is only used by
/// `subscribe`/`unsubscribe`, which mutate this connection's own
/// subscription set rather than any server-side record.
pub async fn dispatch(state: &Arc<AppState>, client_id: Uuid, req: RequestEnvelope) -> ResponseEnvelope {
    let ts = now_millis();
    let id = req.id.clone();
    let data = req.data.clone();

    match req.kind.as_str() {
        "servers.getAll" => {
            let servers = state.manager.get_all().await;
            ResponseEnvelope::ok(id, ts, json!({ "servers": servers }))
        }
        "servers.getDetails" => match require_id(&data).and_then(|_| parse::<IdRequest>(&data)) {
            Ok(r) => match state.manager.get_details(r.id).await {
                Some(record) => ResponseEnvelope::ok(id, ts, json!({ "server": record })),
                None => ResponseEnvelope::err(id, ts, ErrorCode::ServerNotFound.with_detail(r.id)),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "servers.add" => match parse::<AddServerRequest>(&data) {
            Ok(add_req) => match state.manager.add(add_req).await {
                Ok(record) => ResponseEnvelope::ok(id, ts, json!({ "server": record })),
                Err(err) => ResponseEnvelope::err(id, ts, err),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "servers.update" => match require_id(&data).and_then(|_| parse::<IdRequest>(&data)) {
            Ok(id_req) => match parse::<UpdateServerRequest>(&data) {
                Ok(patch) => match state.manager.update(id_req.id, patch).await {
                    Ok((record, changes)) => {
                        ResponseEnvelope::ok(id, ts, json!({ "server": record, "changes": changes.0 }))
                    }
                    Err(err) => ResponseEnvelope::err(id, ts, err),
                },
                Err(msg) => ResponseEnvelope::err(id, ts, msg),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "servers.delete" => match require_id(&data).and_then(|_| parse::<IdRequest>(&data)) {
            Ok(r) => match state.manager.delete(r.id).await {
                Ok(()) => ResponseEnvelope::ok(id, ts, Value::Null),
                Err(err) => ResponseEnvelope::err(id, ts, err),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "servers.action" => match require_id(&data).and_then(|_| parse::<ActionRequest>(&data)) {
            Ok(r) => match state.manager.action(r.id, &r.action, r.ip).await {
                Ok(()) => ResponseEnvelope::ok(id, ts, Value::Null),
                Err(err) => ResponseEnvelope::err(id, ts, err),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "servers.detect" => match parse::<DetectRequest>(&data) {
            Ok(r) => match detector::detect(&r.executable_path) {
                Ok(result) => ResponseEnvelope::ok(id, ts, json!({ "detection": result })),
                Err(err) => ResponseEnvelope::err(id, ts, ErrorCode::InvalidExecutable.with_detail(err)),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "servers.addFromDetection" => match parse::<AddFromDetectionRequest>(&data) {
            Ok(r) => match state.manager.add_from_detection(r).await {
                Ok(record) => ResponseEnvelope::ok(id, ts, json!({ "server": record })),
                Err(err) => ResponseEnvelope::err(id, ts, err),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "servers.getConsole" => match require_id(&data).and_then(|_| parse::<GetConsoleRequest>(&data)) {
            Ok(r) => match state.manager.get_console(r.id, r.n).await {
                Ok(lines) => ResponseEnvelope::ok(id, ts, json!({ "lines": lines })),
                Err(err) => ResponseEnvelope::err(id, ts, err),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "servers.consoleCommand" => match require_id(&data).and_then(|_| parse::<ConsoleCommandRequest>(&data)) {
            Ok(r) => match state.manager.console_command(r.id, &r.command).await {
                Ok(()) => ResponseEnvelope::ok(id, ts, Value::Null),
                Err(message) => ResponseEnvelope::err(id, ts, message),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "config.get" => match state.store.load_config().await {
            Ok(config) => ResponseEnvelope::ok(id, ts, json!({ "config": config })),
            Err(err) => ResponseEnvelope::err(id, ts, err.to_string()),
        },
        "config.save" => match parse::<AppConfig>(&data) {
            Ok(config) => match state.store.save_config(&config).await {
                Ok(()) => ResponseEnvelope::ok(id, ts, json!({ "config": config })),
                Err(err) => ResponseEnvelope::err(id, ts, err.to_string()),
            },
            Err(msg) => ResponseEnvelope::err(id, ts, msg),
        },
        "subscribe" => {
            let topics = normalize_topics(&data);
            state.connections.subscribe(client_id, topics.clone()).await;
            ResponseEnvelope::ok(id, ts, json!({ "subscriptions": topics }))
        }
        "unsubscribe" => {
            let topics = normalize_topics(&data);
            state.connections.unsubscribe(client_id, topics.clone()).await;
            ResponseEnvelope::ok(id, ts, json!({ "subscriptions": topics }))
        }
        "ping" => ResponseEnvelope::ok(id, ts, json!({ "type": "pong" })),
        other => ResponseEnvelope::err(
            id,
            ts,
            ErrorCode::InvalidAction.with_detail(format!("unknown request type '{}'", other)),
        ),
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, String> {
    serde_json::from_value(data.clone()).map_err(|err| format!("INVALID_REQUEST: {}", err))
}

/// Checks for a present, non-null `id` field before the rest of a request
/// is parsed, so a missing id is reported as `MISSING_SERVER_ID` (§7) rather
/// than a generic `INVALID_REQUEST` deserialize failure.
fn require_id(data: &Value) -> Result<(), String> {
    match data.get("id") {
        Some(Value::Null) | None => {
            Err(ErrorCode::MissingServerId.with_detail("request requires an 'id' field"))
        }
        Some(_) => Ok(()),
    }
}

fn now_millis() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp() * 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedrockproxy_core::{DataStore, ProcessSupervisor, ServerManager};

    async fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::new(dir.path().to_path_buf()));
        store.ensure_directories().await.unwrap();
        let supervisor = ProcessSupervisor::new();
        let manager = ServerManager::new(store.clone(), supervisor, Arc::new(|_event| {}));
        manager.install_supervisor_bridge().await;
        manager.load().await.unwrap();
        let connections = crate::ConnectionManager::new();
        let state = Arc::new(AppState {
            manager,
            store,
            connections,
        });
        (state, dir)
    }

    fn envelope(kind: &str, data: Value) -> RequestEnvelope {
        RequestEnvelope {
            kind: kind.to_owned(),
            id: "req-1".to_owned(),
            data,
        }
    }

    #[tokio::test]
    async fn get_all_on_empty_catalogue_returns_empty_list() {
        let (state, _dir) = test_state().await;
        let resp = dispatch(&state, Uuid::new_v4(), envelope("servers.getAll", Value::Null)).await;
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["servers"], json!([]));
    }

    #[tokio::test]
    async fn add_then_get_details_round_trips() {
        let (state, _dir) = test_state().await;
        let add_req = json!({
            "name": "survival",
            "listenAddress": "127.0.0.1:19200",
            "destinationAddress": "127.0.0.1:19132",
        });
        let added = dispatch(&state, Uuid::new_v4(), envelope("servers.add", add_req)).await;
        assert!(added.success, "add failed: {:?}", added.error);
        let id = added.data.unwrap()["server"]["id"].as_str().unwrap().to_owned();

        let details = dispatch(
            &state,
            Uuid::new_v4(),
            envelope("servers.getDetails", json!({ "id": id })),
        )
        .await;
        assert!(details.success);
        assert_eq!(details.data.unwrap()["server"]["name"], "survival");
    }

    #[tokio::test]
    async fn get_details_for_unknown_id_is_server_not_found() {
        let (state, _dir) = test_state().await;
        let resp = dispatch(
            &state,
            Uuid::new_v4(),
            envelope("servers.getDetails", json!({ "id": Uuid::new_v4() })),
        )
        .await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().starts_with("SERVER_NOT_FOUND"));
    }

    #[tokio::test]
    async fn get_details_without_id_is_missing_server_id() {
        let (state, _dir) = test_state().await;
        let resp = dispatch(&state, Uuid::new_v4(), envelope("servers.getDetails", json!({}))).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().starts_with("MISSING_SERVER_ID"));
    }

    #[tokio::test]
    async fn malformed_request_body_is_invalid_request() {
        let (state, _dir) = test_state().await;
        let resp = dispatch(
            &state,
            Uuid::new_v4(),
            envelope("servers.add", json!({ "name": "missing required fields" })),
        )
        .await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().starts_with("INVALID_REQUEST"));
    }

    #[tokio::test]
    async fn unknown_request_type_is_invalid_action() {
        let (state, _dir) = test_state().await;
        let resp = dispatch(&state, Uuid::new_v4(), envelope("bogus.request", Value::Null)).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().starts_with("INVALID_ACTION"));
    }

    #[tokio::test]
    async fn subscribe_accepts_bare_string_topic() {
        let (state, _dir) = test_state().await;
        let client_id = Uuid::new_v4();
        let resp = dispatch(&state, client_id, envelope("subscribe", json!("server.deleted"))).await;
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["subscriptions"], json!(["server.deleted"]));
    }

    #[tokio::test]
    async fn ping_replies_with_pong() {
        let (state, _dir) = test_state().await;
        let resp = dispatch(&state, Uuid::new_v4(), envelope("ping", Value::Null)).await;
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["type"], "pong");
    }
}
