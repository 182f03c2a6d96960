//! Server Manager (component E, §4.3).
//!
//! Couples a persisted [`ServerRecord`] to at most one [`UdpProxy`] and one
//! supervised process, and emits a stable event stream through an injected
//! broadcast callback. Grounded on the teacher's `Backend`/`BackendState`
//! shape: a single `Arc<RwLock<..>>` of authoritative state handed down to
//! collaborators (`HealthController`, here `ProcessSupervisor`) without a
//! back-reference, and a `broadcast` closure threaded through construction
//! instead of the router holding a pointer back into this type.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use bedrockproxy_api::error::ErrorCode;
use bedrockproxy_api::model::{
    AddFromDetectionRequest, AddServerRequest, ConsoleLine, ConsoleStreamKind, LastExit,
    PlayerSession, ServerChanges, ServerRecord, ServerStatus, UpdateServerRequest,
};
use bedrockproxy_api::envelope::{ConsoleOutputPayload, DaemonEvent};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::detector;
use crate::store::DataStore;
use crate::supervisor::{ProcessState, ProcessSupervisor, SupervisorEvent};
use crate::udp_proxy::{UdpProxy, UdpProxyOptions};

pub type BroadcastFn = Arc<dyn Fn(DaemonEvent) + Send + Sync>;

pub struct ServerManager {
    store: Arc<DataStore>,
    supervisor: Arc<ProcessSupervisor>,
    records: RwLock<HashMap<Uuid, ServerRecord>>,
    proxies: RwLock<HashMap<Uuid, Arc<UdpProxy>>>,
    broadcast: BroadcastFn,
}

impl ServerManager {
    pub fn new(
        store: Arc<DataStore>,
        supervisor: Arc<ProcessSupervisor>,
        broadcast: BroadcastFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            supervisor,
            records: RwLock::new(HashMap::new()),
            proxies: RwLock::new(HashMap::new()),
            broadcast,
        })
    }

    /// Wires the supervisor's event callback back into this manager. Must
    /// be called once, after construction, with the manager's own `Arc` —
    /// kept separate from `new` so the callback can hold a `Weak` rather
    /// than create a reference cycle.
    pub async fn install_supervisor_bridge(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.supervisor
            .set_event_callback(Arc::new(move |event| {
                let weak = weak.clone();
                tokio::spawn(async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.handle_supervisor_event(event).await;
                    }
                });
            }))
            .await;
    }

    /// Loads the catalogue from disk and starts every `autoStart` record.
    pub async fn load(self: &Arc<Self>) -> anyhow::Result<()> {
        let records = self.store.load_servers().await?;
        let auto_start_ids: Vec<Uuid> = records
            .iter()
            .filter(|r| r.auto_start)
            .map(|r| r.id)
            .collect();
        {
            let mut map = self.records.write().await;
            for record in records {
                map.insert(record.id, record);
            }
        }
        for id in auto_start_ids {
            if let Err(err) = self.action(id, "start", None).await {
                log::warn!("autoStart failed for {}: {}", id, err);
            }
        }
        Ok(())
    }

    pub async fn get_all(&self) -> Vec<ServerRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn get_details(&self, id: Uuid) -> Option<ServerRecord> {
        self.records.read().await.get(&id).cloned()
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let records: Vec<ServerRecord> = self.records.read().await.values().cloned().collect();
        self.store.save_servers(&records).await
    }

    async fn listen_address_taken(&self, listen_address: &str, excluding: Option<Uuid>) -> bool {
        self.records
            .read()
            .await
            .values()
            .any(|r| r.listen_address == listen_address && Some(r.id) != excluding)
    }

    pub async fn add(&self, req: AddServerRequest) -> Result<ServerRecord, String> {
        if req.name.trim().is_empty() {
            return Err(ErrorCode::InvalidAddress.with_detail("name must not be empty"));
        }
        validate_host_port(&req.listen_address)?;
        validate_host_port(&req.destination_address)?;
        if self
            .listen_address_taken(&req.listen_address, None)
            .await
        {
            return Err(ErrorCode::DuplicateAddress.with_detail(&req.listen_address));
        }

        let now = OffsetDateTime::now_utc();
        let record = ServerRecord {
            id: Uuid::new_v4(),
            name: req.name,
            listen_address: req.listen_address,
            destination_address: req.destination_address,
            max_players: req.max_players.clamp(1, 1000),
            status: ServerStatus::Offline,
            players: Vec::new(),
            tags: req.tags,
            description: req.description,
            icon_url: req.icon_url,
            auto_start: req.auto_start,
            auto_restart: req.auto_restart,
            block_same_ip: req.block_same_ip,
            proxy_protocol_v2_enabled: req.proxy_protocol_v2_enabled,
            forward_address: req.forward_address,
            executable_path: req.executable_path,
            server_directory: req.server_directory,
            last_exit: None,
            created_at: now,
            updated_at: now,
        };

        self.records.write().await.insert(record.id, record.clone());
        self.persist()
            .await
            .map_err(|e| format!("failed to persist catalogue: {}", e))?;
        self.broadcast(DaemonEvent::ServerCreated(record.clone()));
        Ok(record)
    }

    pub async fn update(
        &self,
        id: Uuid,
        patch: UpdateServerRequest,
    ) -> Result<(ServerRecord, ServerChanges), String> {
        if let Some(listen_address) = &patch.listen_address {
            validate_host_port(listen_address)?;
            if self.listen_address_taken(listen_address, Some(id)).await {
                return Err(ErrorCode::DuplicateAddress.with_detail(listen_address));
            }
        }
        if let Some(destination_address) = &patch.destination_address {
            validate_host_port(destination_address)?;
        }

        let mut changes = Vec::new();
        let updated_record = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(&id)
                .ok_or_else(|| ErrorCode::ServerNotFound.with_detail(id))?;

            macro_rules! apply_plain {
                ($field:ident, $name:literal) => {
                    if let Some(value) = patch.$field.clone() {
                        if record.$field != value {
                            record.$field = value;
                            changes.push($name.to_owned());
                        }
                    }
                };
            }
            // `Option<String>`-typed record fields: a `Some(value)` patch
            // sets the field to `Some(value)`; there is no way to clear it
            // back to `None` through this shallow-merge shape.
            macro_rules! apply_optional {
                ($field:ident, $name:literal) => {
                    if let Some(value) = patch.$field.clone() {
                        if record.$field.as_deref() != Some(value.as_str()) {
                            record.$field = Some(value);
                            changes.push($name.to_owned());
                        }
                    }
                };
            }
            apply_plain!(name, "name");
            apply_plain!(listen_address, "listenAddress");
            apply_plain!(destination_address, "destinationAddress");
            apply_plain!(max_players, "maxPlayers");
            apply_plain!(tags, "tags");
            apply_plain!(description, "description");
            apply_plain!(auto_start, "autoStart");
            apply_plain!(auto_restart, "autoRestart");
            apply_plain!(block_same_ip, "blockSameIP");
            apply_plain!(proxy_protocol_v2_enabled, "proxyProtocolV2Enabled");
            apply_optional!(icon_url, "iconUrl");
            apply_optional!(forward_address, "forwardAddress");
            apply_optional!(executable_path, "executablePath");
            apply_optional!(server_directory, "serverDirectory");

            if !changes.is_empty() {
                record.updated_at = OffsetDateTime::now_utc();
            }
            record.clone()
        };

        if !changes.is_empty() {
            self.persist()
                .await
                .map_err(|e| format!("failed to persist catalogue: {}", e))?;
            if let Some(proxy) = self.proxies.read().await.get(&id) {
                if let Ok(destination) = updated_record.destination_address.parse::<SocketAddr>() {
                    proxy.update_destination(destination).await;
                }
                proxy
                    .set_proxy_protocol_v2_enabled(updated_record.proxy_protocol_v2_enabled)
                    .await;
            }

            let changes = ServerChanges(changes);
            self.broadcast(DaemonEvent::ServerUpdated {
                record: updated_record.clone(),
                changes: changes.0.clone(),
            });

            let properties_relevant = changes.contains("maxPlayers")
                || changes.contains("name")
                || changes.contains("destinationAddress");
            if properties_relevant {
                self.sync_server_properties(&updated_record).await;
            }

            Ok((updated_record, changes))
        } else {
            Ok((updated_record, ServerChanges::default()))
        }
    }

    async fn sync_server_properties(&self, record: &ServerRecord) {
        let Some(server_directory) = &record.server_directory else {
            return;
        };
        let path = Path::new(server_directory).join("server.properties");
        let result = (|| -> anyhow::Result<()> {
            let contents = std::fs::read_to_string(&path)?;
            let mut contents = contents;
            contents = detector::rewrite_property(
                &contents,
                "max-players",
                &record.max_players.to_string(),
            );
            contents = detector::rewrite_property(
                &contents,
                "server-name",
                &record.name.replace('\n', " "),
            );
            if let Ok(addr) = record.destination_address.parse::<SocketAddr>() {
                let port = addr.port().to_string();
                contents = detector::rewrite_property(&contents, "server-port", &port);
                contents = detector::rewrite_property(&contents, "server-portv4", &port);
            }
            std::fs::write(&path, contents)?;
            Ok(())
        })();

        match result {
            Ok(()) => self.broadcast(DaemonEvent::ServerPropertiesUpdated { id: record.id }),
            Err(err) => self.broadcast(DaemonEvent::ServerPropertiesUpdateFailed {
                id: record.id,
                reason: err.to_string(),
            }),
        }
    }

    pub async fn delete(self: &Arc<Self>, id: Uuid) -> Result<(), String> {
        if !self.records.read().await.contains_key(&id) {
            return Err(ErrorCode::ServerNotFound.with_detail(id));
        }
        let _ = self.do_stop(id).await;
        self.proxies.write().await.remove(&id);
        self.supervisor.cleanup(id).await;
        self.records.write().await.remove(&id);
        self.persist()
            .await
            .map_err(|e| format!("failed to persist catalogue: {}", e))?;
        self.broadcast(DaemonEvent::ServerDeleted { id });
        Ok(())
    }

    pub async fn action(
        self: &Arc<Self>,
        id: Uuid,
        action: &str,
        ip: Option<String>,
    ) -> Result<(), String> {
        if !matches!(action, "start" | "stop" | "restart" | "block") {
            return Err(ErrorCode::InvalidAction.with_detail(action));
        }
        let result = match action {
            "start" => self.do_start(id).await,
            "stop" => self.do_stop(id).await,
            "restart" => self.do_restart(id).await,
            "block" => self.do_block(id, ip).await,
            _ => unreachable!(),
        };
        self.broadcast(DaemonEvent::ServerAction {
            id,
            action: action.to_owned(),
            success: result.is_ok(),
            message: result.as_ref().err().cloned(),
        });
        result
    }

    async fn do_start(self: &Arc<Self>, id: Uuid) -> Result<(), String> {
        let record = self
            .get_details(id)
            .await
            .ok_or_else(|| ErrorCode::ServerNotFound.with_detail(id))?;
        if !matches!(record.status, ServerStatus::Offline | ServerStatus::Error) {
            return Err(ErrorCode::InvalidAction.with_detail("server is not offline"));
        }

        let listen_address: SocketAddr = record
            .listen_address
            .parse()
            .map_err(|_| ErrorCode::InvalidAddress.with_detail(&record.listen_address))?;
        let destination_address: SocketAddr = record
            .destination_address
            .parse()
            .map_err(|_| ErrorCode::InvalidAddress.with_detail(&record.destination_address))?;

        let mut executable_path = record.executable_path.clone();
        if executable_path.is_none() {
            if let Some(dir) = &record.server_directory {
                if let Some(found) = detector::probe_default_executable(Path::new(dir)) {
                    executable_path = Some(found.to_string_lossy().into_owned());
                }
            }
        }

        let mut options = UdpProxyOptions::new(listen_address, destination_address);
        options.proxy_protocol_v2_enabled = record.proxy_protocol_v2_enabled;
        let proxy = UdpProxy::new(options);
        proxy
            .start()
            .await
            .map_err(|e| format!("BIND_ERROR: {}", e))?;
        self.proxies.write().await.insert(id, proxy);

        match executable_path {
            None => {
                self.set_status(id, ServerStatus::Online).await;
                self.emit_console(
                    id,
                    ConsoleStreamKind::Stdout,
                    format!(
                        "Proxy-only mode started: {} -> {}",
                        record.listen_address, record.destination_address
                    ),
                )
                .await;
            }
            Some(exe) => {
                self.set_status(id, ServerStatus::Starting).await;
                self.supervisor
                    .start(id, &exe, &[], record.auto_restart)
                    .await
                    .map_err(|e| format!("failed to start process: {}", e))?;
            }
        }
        Ok(())
    }

    async fn do_stop(&self, id: Uuid) -> Result<(), String> {
        if !self.records.read().await.contains_key(&id) {
            return Err(ErrorCode::ServerNotFound.with_detail(id));
        }
        let _ = self.supervisor.stop(id, true).await;
        if let Some(proxy) = self.proxies.write().await.remove(&id) {
            proxy.stop().await;
        }
        self.set_status(id, ServerStatus::Offline).await;
        if let Some(record) = self.records.write().await.get_mut(&id) {
            record.players.clear();
            record.updated_at = OffsetDateTime::now_utc();
        }
        self.persist()
            .await
            .map_err(|e| format!("failed to persist catalogue: {}", e))?;
        Ok(())
    }

    async fn do_restart(self: &Arc<Self>, id: Uuid) -> Result<(), String> {
        let record = self
            .get_details(id)
            .await
            .ok_or_else(|| ErrorCode::ServerNotFound.with_detail(id))?;
        let Some(exe) = record.executable_path.clone() else {
            return Err(ErrorCode::ExecutablePathMissing.with_detail(id));
        };
        self.supervisor
            .restart(id, &exe, &[])
            .await
            .map_err(|e| format!("failed to restart: {}", e))
    }

    async fn do_block(&self, id: Uuid, ip: Option<String>) -> Result<(), String> {
        let ip = ip.ok_or_else(|| ErrorCode::InvalidAddress.with_detail("missing ip"))?;
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| ErrorCode::InvalidAddress.with_detail(&ip))?;
        if let Some(proxy) = self.proxies.read().await.get(&id) {
            proxy.block_client(addr).await;
        }
        if let Some(record) = self.records.write().await.get_mut(&id) {
            record.players.retain(|p| p.ip_address.as_deref() != Some(ip.as_str()));
            record.updated_at = OffsetDateTime::now_utc();
        }
        self.persist()
            .await
            .map_err(|e| format!("failed to persist catalogue: {}", e))?;
        Ok(())
    }

    /// Runs the detector against `req.executablePath` and creates a record
    /// from the result, with any front-end-supplied fields taking priority
    /// over the detection's suggestions (`servers.addFromDetection`).
    pub async fn add_from_detection(
        &self,
        req: AddFromDetectionRequest,
    ) -> Result<ServerRecord, String> {
        let detection = detector::detect(&req.executable_path)
            .map_err(|e| ErrorCode::InvalidExecutable.with_detail(e))?;

        let name = req
            .name
            .or_else(|| detection.suggested_name.clone())
            .unwrap_or_else(|| "New Server".to_owned());
        let listen_address = req.listen_address.unwrap_or_else(|| {
            format!("0.0.0.0:{}", detection.suggested_proxy_port)
        });
        let destination_address = req.destination_address.unwrap_or_else(|| {
            format!(
                "127.0.0.1:{}",
                detection.suggested_destination_port.unwrap_or(19132)
            )
        });
        let max_players = req
            .max_players
            .or(detection.max_players)
            .unwrap_or(10);

        self.add(AddServerRequest {
            name,
            listen_address,
            destination_address,
            max_players,
            tags: req.tags,
            description: req.description,
            icon_url: req.icon_url,
            auto_start: req.auto_start,
            auto_restart: req.auto_restart,
            block_same_ip: req.block_same_ip,
            proxy_protocol_v2_enabled: req.proxy_protocol_v2_enabled,
            forward_address: req.forward_address,
            executable_path: Some(detection.executable_path),
            server_directory: Some(detection.server_directory),
        })
        .await
    }

    /// Last `n` console lines for `servers.getConsole`. When no process has
    /// ever run (or its supervisor entry was cleaned up), synthesises a
    /// one-line transcript from `lastExit` rather than failing the request
    /// (DESIGN NOTES §9: a UI affordance, not a data guarantee).
    pub async fn get_console(&self, id: Uuid, n: Option<usize>) -> Result<Vec<ConsoleLine>, String> {
        if let Some(lines) = self.supervisor.get_console_output(id, n).await {
            return Ok(lines);
        }
        let record = self
            .get_details(id)
            .await
            .ok_or_else(|| ErrorCode::ServerNotFound.with_detail(id))?;
        let line = match &record.last_exit {
            Some(last_exit) => ConsoleLine {
                timestamp: last_exit.time,
                text: format!(
                    "Last exit: code={:?}, signal={:?}",
                    last_exit.code, last_exit.signal
                ),
                stream: ConsoleStreamKind::Stdout,
            },
            None => ConsoleLine {
                timestamp: OffsetDateTime::now_utc(),
                text: "No console output available: process has not been started.".to_owned(),
                stream: ConsoleStreamKind::Stdout,
            },
        };
        Ok(vec![line])
    }

    /// Forwards a line to the supervisor's stdin and echoes it as
    /// `console.output`; if no process is running, emits a synthesised
    /// stderr line instead and fails the request (`servers.consoleCommand`,
    /// §4.4, §8 scenario 4).
    pub async fn console_command(&self, id: Uuid, line: &str) -> Result<(), String> {
        if !self.records.read().await.contains_key(&id) {
            return Err(ErrorCode::ServerNotFound.with_detail(id));
        }
        match self.supervisor.send_command(id, line).await {
            Ok(()) => {
                self.emit_console(id, ConsoleStreamKind::Stdin, format!("> {}", line))
                    .await;
                Ok(())
            }
            Err(_) => {
                self.emit_console(
                    id,
                    ConsoleStreamKind::Stderr,
                    "No running server process to receive commands (failed: no running process)"
                        .to_owned(),
                )
                .await;
                Err(ErrorCode::ProcessNotRunning.with_detail("no running server process to receive commands"))
            }
        }
    }

    /// Stops every non-offline record, bounded by a 10s aggregate budget
    /// (§5, invoked from the daemon's shutdown sequence).
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status != ServerStatus::Offline)
            .map(|r| r.id)
            .collect();
        let budget = tokio::time::Duration::from_secs(10);
        let _ = tokio::time::timeout(budget, async {
            for id in ids {
                let _ = self.do_stop(id).await;
            }
        })
        .await;
    }

    async fn set_status(&self, id: Uuid, status: ServerStatus) {
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(&id) {
                record.status = status;
                record.updated_at = OffsetDateTime::now_utc();
            }
        }
        // §4.3 invariant: a record is persisted after every mutating
        // operation, before the event announcing it goes out.
        let _ = self.persist().await;
        self.broadcast(DaemonEvent::ServerStatusChanged { id, status });
    }

    async fn emit_console(&self, id: Uuid, stream: ConsoleStreamKind, text: String) {
        self.broadcast(DaemonEvent::ConsoleOutput(ConsoleOutputPayload {
            server_id: id,
            stream,
            text,
            timestamp: now_millis(),
        }));
    }

    fn broadcast(&self, event: DaemonEvent) {
        (self.broadcast)(event);
    }

    async fn handle_supervisor_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::StateChanged { id, state, last_exit } => {
                self.handle_state_changed(id, state, last_exit).await;
            }
            SupervisorEvent::ConsoleOutput { id, line } => {
                self.broadcast(DaemonEvent::ConsoleOutput(ConsoleOutputPayload {
                    server_id: id,
                    stream: line.stream,
                    text: line.text,
                    timestamp: line.timestamp.unix_timestamp() * 1000,
                }));
            }
            SupervisorEvent::PlayerJoined { id, name, xuid } => {
                self.handle_player_joined(id, name, xuid).await;
            }
            SupervisorEvent::PlayerLeft { id, name, xuid } => {
                self.handle_player_left(id, name, xuid).await;
            }
        }
    }

    async fn handle_state_changed(&self, id: Uuid, state: ProcessState, last_exit: Option<LastExit>) {
        let status = match state {
            ProcessState::Starting => ServerStatus::Starting,
            ProcessState::Running => ServerStatus::Online,
            ProcessState::Stopping => ServerStatus::Stopping,
            ProcessState::Stopped => ServerStatus::Offline,
            ProcessState::Error => ServerStatus::Error,
        };
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(&id) {
                record.status = status;
                record.updated_at = OffsetDateTime::now_utc();
                if status == ServerStatus::Offline {
                    record.players.clear();
                }
                if let Some(last_exit) = last_exit {
                    record.last_exit = Some(last_exit);
                }
            } else {
                return;
            }
        }
        let _ = self.persist().await;
        self.broadcast(DaemonEvent::ServerStatusChanged { id, status });
    }

    async fn handle_player_joined(&self, id: Uuid, name: String, xuid: Option<String>) {
        let player = PlayerSession {
            id: PlayerSession::derive_id(&name, xuid.as_deref()),
            name,
            xuid,
            join_time: OffsetDateTime::now_utc(),
            leave_time: None,
            ip_address: None,
        };
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(&id) {
                record.players.push(player.clone());
                record.updated_at = OffsetDateTime::now_utc();
            } else {
                return;
            }
        }
        let _ = self.persist().await;
        self.broadcast(DaemonEvent::PlayerJoined {
            server_id: id,
            player,
        });
    }

    async fn handle_player_left(&self, id: Uuid, name: String, xuid: Option<String>) {
        let player_id = PlayerSession::derive_id(&name, xuid.as_deref());
        let removed = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&id) else {
                return;
            };
            let position = record.players.iter().position(|p| p.id == player_id);
            position.map(|idx| {
                let mut player = record.players.remove(idx);
                player.leave_time = Some(OffsetDateTime::now_utc());
                record.updated_at = OffsetDateTime::now_utc();
                player
            })
        };
        if let Some(player) = removed {
            let _ = self.persist().await;
            self.broadcast(DaemonEvent::PlayerLeft {
                server_id: id,
                player,
            });
        }
    }
}

fn now_millis() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp() * 1000
}

fn validate_host_port(value: &str) -> Result<(), String> {
    value
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ErrorCode::InvalidAddress.with_detail(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_broadcast() -> BroadcastFn {
        Arc::new(|_event| {})
    }

    #[tokio::test]
    async fn add_rejects_duplicate_listen_address() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::new(dir.path().to_path_buf()));
        store.ensure_directories().await.unwrap();
        let supervisor = ProcessSupervisor::new();
        let manager = ServerManager::new(store, supervisor, noop_broadcast());

        let req = AddServerRequest {
            name: "A".to_owned(),
            listen_address: "127.0.0.1:19132".to_owned(),
            destination_address: "127.0.0.1:19133".to_owned(),
            max_players: 10,
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
        };
        manager.add(req.clone()).await.unwrap();
        let second = manager.add(req).await;
        assert!(second.is_err());
        assert!(second.unwrap_err().starts_with("DUPLICATE_ADDRESS"));
    }

    #[tokio::test]
    async fn update_with_no_changes_emits_no_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::new(dir.path().to_path_buf()));
        store.ensure_directories().await.unwrap();
        let supervisor = ProcessSupervisor::new();
        let manager = ServerManager::new(store, supervisor, noop_broadcast());

        let record = manager
            .add(AddServerRequest {
                name: "A".to_owned(),
                listen_address: "127.0.0.1:19134".to_owned(),
                destination_address: "127.0.0.1:19135".to_owned(),
                max_players: 10,
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
            })
            .await
            .unwrap();

        let (_, changes) = manager
            .update(record.id, UpdateServerRequest::default())
            .await
            .unwrap();
        assert!(changes.0.is_empty());
    }
}
