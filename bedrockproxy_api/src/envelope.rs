//! WebSocket message envelopes (§4.4) and the closed set of event
//! variants broadcast over the control plane.
//!
//! The source (distilled spec) uses ad-hoc string-keyed emitters; per
//! DESIGN NOTES §9 we instead define a closed `DaemonEvent` enum with
//! structured payloads and keep the wire encoding as `{event, data}` JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{AppConfig, ConsoleStreamKind, PlayerSession, ServerRecord};

/// Raw incoming frame, before the `data` payload is interpreted per
/// request type. Mirrors DESIGN NOTES §9's "parse then normalise" rule for
/// dynamic subscription payloads: we keep the envelope generic and let each
/// request handler pick apart `data` itself.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub timestamp: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(id: String, timestamp: i64, data: Value) -> Self {
        Self {
            kind: "response",
            id,
            timestamp,
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn err(id: String, timestamp: i64, error: String) -> Self {
        Self {
            kind: "response",
            id,
            timestamp,
            success: false,
            data: None,
            error: Some(error.clone()),
            message: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: i64,
    pub event: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleOutputPayload {
    pub server_id: Uuid,
    #[serde(rename = "type")]
    pub stream: ConsoleStreamKind,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatsPayload {
    pub server_id: Uuid,
    pub active_connections: usize,
    pub client_ip: String,
    pub client_port: u16,
    pub bytes: usize,
}

/// The closed set of events the daemon emits. `topic()` is the wire
/// `event` string a client subscribes to (§4.4's topic list); `payload()`
/// is the JSON `data` attached to the envelope.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    ServerCreated(ServerRecord),
    ServerUpdated {
        record: ServerRecord,
        changes: Vec<String>,
    },
    ServerDeleted {
        id: Uuid,
    },
    ServerStatusChanged {
        id: Uuid,
        status: crate::model::ServerStatus,
    },
    ServerAction {
        id: Uuid,
        action: String,
        success: bool,
        message: Option<String>,
    },
    ServerPropertiesUpdated {
        id: Uuid,
    },
    ServerPropertiesUpdateFailed {
        id: Uuid,
        reason: String,
    },
    PlayerJoined {
        server_id: Uuid,
        player: PlayerSession,
    },
    PlayerLeft {
        server_id: Uuid,
        player: PlayerSession,
    },
    ConsoleOutput(ConsoleOutputPayload),
    NetworkStats(NetworkStatsPayload),
    ServerShutdown,
}

impl DaemonEvent {
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::ServerCreated(_) => "server.created",
            Self::ServerUpdated { .. } => "server.updated",
            Self::ServerDeleted { .. } => "server.deleted",
            Self::ServerStatusChanged { .. } => "server.statusChanged",
            Self::ServerAction { .. } => "server.action",
            Self::ServerPropertiesUpdated { .. } => "server.properties.updated",
            Self::ServerPropertiesUpdateFailed { .. } => "server.properties.updateFailed",
            Self::PlayerJoined { .. } => "player.joined",
            Self::PlayerLeft { .. } => "player.left",
            Self::ConsoleOutput(_) => "console.output",
            Self::NetworkStats(_) => "networkStats",
            Self::ServerShutdown => "server.shutdown",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::ServerCreated(record) => serde_json::to_value(record),
            Self::ServerUpdated { record, changes } => serde_json::to_value(serde_json::json!({
                "server": record,
                "changes": changes,
            })),
            Self::ServerDeleted { id } => serde_json::to_value(serde_json::json!({ "id": id })),
            Self::ServerStatusChanged { id, status } => {
                serde_json::to_value(serde_json::json!({ "id": id, "status": status }))
            }
            Self::ServerAction {
                id,
                action,
                success,
                message,
            } => serde_json::to_value(serde_json::json!({
                "id": id,
                "action": action,
                "success": success,
                "message": message,
            })),
            Self::ServerPropertiesUpdated { id } => {
                serde_json::to_value(serde_json::json!({ "id": id }))
            }
            Self::ServerPropertiesUpdateFailed { id, reason } => {
                serde_json::to_value(serde_json::json!({ "id": id, "reason": reason }))
            }
            Self::PlayerJoined { server_id, player } => {
                serde_json::to_value(serde_json::json!({ "serverId": server_id, "player": player }))
            }
            Self::PlayerLeft { server_id, player } => {
                serde_json::to_value(serde_json::json!({ "serverId": server_id, "player": player }))
            }
            Self::ConsoleOutput(payload) => serde_json::to_value(payload),
            Self::NetworkStats(payload) => serde_json::to_value(payload),
            Self::ServerShutdown => Ok(Value::Null),
        }
        .unwrap_or(Value::Null)
    }
}

/// Normalizes the several shapes `subscribe`/`unsubscribe` payloads may
/// take into a flat, deduplicated list of topic strings (DESIGN NOTES §9).
///
/// Accepts: `{events: string[]}`, a bare string, or `{data: {events: [...]}}`.
pub fn normalize_topics(data: &Value) -> Vec<String> {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => {
                for item in items {
                    collect(item, out);
                }
            }
            Value::Object(map) => {
                if let Some(events) = map.get("events") {
                    collect(events, out);
                } else if let Some(nested) = map.get("data") {
                    collect(nested, out);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    collect(data, &mut out);
    out.sort();
    out.dedup();
    out
}

/// AppConfig is re-exported here purely so callers that only need the
/// envelope module don't also need to reach into `model`.
pub type ConfigPayload = AppConfig;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_bare_string() {
        assert_eq!(normalize_topics(&json!("server.created")), vec!["server.created"]);
    }

    #[test]
    fn normalizes_events_array() {
        let topics = normalize_topics(&json!({"events": ["b", "a", "a"]}));
        assert_eq!(topics, vec!["a", "b"]);
    }

    #[test]
    fn normalizes_nested_data() {
        let topics = normalize_topics(&json!({"data": {"events": ["x"]}}));
        assert_eq!(topics, vec!["x"]);
    }
}
