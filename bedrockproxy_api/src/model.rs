//! Persistent and transient data model: [`ServerRecord`], [`PlayerSession`],
//! [`AppConfig`].

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Status of a managed server, derived from its live components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Offline,
    Starting,
    Online,
    Stopping,
    Error,
}

impl Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::Starting => "starting",
            Self::Online => "online",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self::Offline
    }
}

/// Record of the last time a supervised process exited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastExit {
    pub code: Option<i32>,
    pub signal: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

/// A transient player entry attached to a [`ServerRecord`].
///
/// Created when the supervisor reports a connect log line; removed when it
/// reports a disconnect, or when the owning process stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSession {
    /// Derived from `xuid` when present, otherwise from `name`.
    pub id: String,
    pub name: String,
    pub xuid: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub join_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub leave_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

impl PlayerSession {
    /// Derives the stable identity used to match join/leave log lines.
    pub fn derive_id(name: &str, xuid: Option<&str>) -> String {
        match xuid {
            Some(xuid) if !xuid.is_empty() => xuid.to_owned(),
            _ => name.to_owned(),
        }
    }
}

/// Persistent record of a managed Bedrock server.
///
/// Couples a UDP listen/destination pair to an optional local executable.
/// See `bedrockproxy_core::manager` for the state machine that drives
/// `status`/`players` from the supervisor and proxy.
///
/// `playersOnline` (§3: "derived") is not a stored field — it is computed
/// from `players` at serialization time (see the hand-written `Serialize`
/// impl below) so the invariant `playersOnline == len(players)` can never
/// drift out from under a call site that forgets to update a counter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: Uuid,
    pub name: String,
    pub listen_address: String,
    pub destination_address: String,
    pub max_players: u32,

    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default)]
    pub players: Vec<PlayerSession>,

    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_url: Option<String>,

    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub block_same_ip: bool,
    #[serde(default)]
    pub proxy_protocol_v2_enabled: bool,
    /// Reserved backup destination. Parsed and persisted but not yet acted
    /// on (see DESIGN.md's Open Question resolution).
    #[serde(default)]
    pub forward_address: Option<String>,

    #[serde(default)]
    pub executable_path: Option<String>,
    #[serde(default)]
    pub server_directory: Option<String>,

    #[serde(default)]
    pub last_exit: Option<LastExit>,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ServerRecord {
    pub fn players_online(&self) -> usize {
        self.players.len()
    }
}

impl Serialize for ServerRecord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire<'a> {
            id: Uuid,
            name: &'a str,
            listen_address: &'a str,
            destination_address: &'a str,
            max_players: u32,
            status: ServerStatus,
            players_online: usize,
            players: &'a [PlayerSession],
            tags: &'a [String],
            description: &'a str,
            icon_url: &'a Option<String>,
            auto_start: bool,
            auto_restart: bool,
            block_same_ip: bool,
            proxy_protocol_v2_enabled: bool,
            forward_address: &'a Option<String>,
            executable_path: &'a Option<String>,
            server_directory: &'a Option<String>,
            last_exit: &'a Option<LastExit>,
            #[serde(with = "time::serde::rfc3339")]
            created_at: OffsetDateTime,
            #[serde(with = "time::serde::rfc3339")]
            updated_at: OffsetDateTime,
        }

        Wire {
            id: self.id,
            name: &self.name,
            listen_address: &self.listen_address,
            destination_address: &self.destination_address,
            max_players: self.max_players,
            status: self.status,
            players_online: self.players_online(),
            players: &self.players,
            tags: &self.tags,
            description: &self.description,
            icon_url: &self.icon_url,
            auto_start: self.auto_start,
            auto_restart: self.auto_restart,
            block_same_ip: self.block_same_ip,
            proxy_protocol_v2_enabled: self.proxy_protocol_v2_enabled,
            forward_address: &self.forward_address,
            executable_path: &self.executable_path,
            server_directory: &self.server_directory,
            last_exit: &self.last_exit,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
        .serialize(serializer)
    }
}

/// Fields accepted by `servers.add`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddServerRequest {
    pub name: String,
    pub listen_address: String,
    pub destination_address: String,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub block_same_ip: bool,
    #[serde(default)]
    pub proxy_protocol_v2_enabled: bool,
    #[serde(default)]
    pub forward_address: Option<String>,
    #[serde(default)]
    pub executable_path: Option<String>,
    #[serde(default)]
    pub server_directory: Option<String>,
}

fn default_max_players() -> u32 {
    10
}

/// Shallow-merge patch accepted by `servers.update`. Every field absent
/// (`None`) from the incoming JSON is left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServerRequest {
    pub name: Option<String>,
    pub listen_address: Option<String>,
    pub destination_address: Option<String>,
    pub max_players: Option<u32>,
    pub tags: Option<Vec<String>>,
    pub description: Option<String>,
    pub icon_url: Option<String>,
    pub auto_start: Option<bool>,
    pub auto_restart: Option<bool>,
    pub block_same_ip: Option<bool>,
    pub proxy_protocol_v2_enabled: Option<bool>,
    pub forward_address: Option<String>,
    pub executable_path: Option<String>,
    pub server_directory: Option<String>,
}

/// Result of applying an [`UpdateServerRequest`]: which top-level fields
/// actually changed value. Used both to decide whether to emit
/// `server.updated` and to decide whether to resync `server.properties`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerChanges(pub Vec<String>);

impl ServerChanges {
    pub fn contains(&self, field: &str) -> bool {
        self.0.iter().any(|f| f == field)
    }
}

/// Application-level configuration, persisted at `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_true")]
    pub check_updates: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            theme: default_theme(),
            auto_start: false,
            check_updates: true,
            log_level: default_log_level(),
        }
    }
}

fn default_language() -> String {
    "en".to_owned()
}

fn default_theme() -> String {
    "system".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// Stream a captured console line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStreamKind {
    Stdout,
    Stderr,
    Stdin,
}

/// One entry in a supervised process's console ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleLine {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub text: String,
    pub stream: ConsoleStreamKind,
}

/// Fields accepted by `servers.addFromDetection`: a detected executable
/// plus whatever the front end chose to override from the detection
/// result (§4.4 request type table).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFromDetectionRequest {
    pub executable_path: String,
    pub name: Option<String>,
    pub listen_address: Option<String>,
    pub destination_address: Option<String>,
    pub max_players: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub block_same_ip: bool,
    #[serde(default)]
    pub proxy_protocol_v2_enabled: bool,
    #[serde(default)]
    pub forward_address: Option<String>,
}

/// Result of probing an executable/directory for `servers.detect`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub executable_path: String,
    pub server_directory: String,
    pub suggested_name: Option<String>,
    pub suggested_destination_port: Option<u16>,
    pub suggested_proxy_port: u16,
    pub max_players: Option<u32>,
    pub properties: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(players: Vec<PlayerSession>) -> ServerRecord {
        let now = OffsetDateTime::now_utc();
        ServerRecord {
            id: Uuid::new_v4(),
            name: "test".to_owned(),
            listen_address: "127.0.0.1:19132".to_owned(),
            destination_address: "127.0.0.1:19133".to_owned(),
            max_players: 10,
            status: ServerStatus::Online,
            players,
            tags: Vec::new(),
            description: String::new(),
            icon_url: None,
            auto_start: false,
            auto_restart: false,
            block_same_ip: false,
            proxy_protocol_v2_enabled: false,
            forward_address: None,
            executable_path: None,
            server_directory: None,
            last_exit: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn players_online_matches_players_length_on_the_wire() {
        let player = PlayerSession {
            id: "1234".to_owned(),
            name: "Steve".to_owned(),
            xuid: Some("1234".to_owned()),
            join_time: OffsetDateTime::now_utc(),
            leave_time: None,
            ip_address: None,
        };
        let record = sample_record(vec![player]);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["playersOnline"], 1);
        assert_eq!(value["players"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn players_online_is_zero_with_no_players() {
        let record = sample_record(Vec::new());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["playersOnline"], 0);
    }
}
