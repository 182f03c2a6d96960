//! Data Store (component D, §4.3/§6).
//!
//! Grounded on the teacher's snapshot writer (plain `serde_json::to_writer`
//! over a `File::create`): we keep the "serialize the whole catalogue to
//! one JSON document" shape but harden the write path to atomic
//! write-and-rename, since §5 demands replace-on-same-filesystem semantics
//! for the catalogue/config (a disposable recovery snapshot did not need
//! that guarantee; the user-facing catalogue does).
//!
//! Schema migration is "merge with defaults on load": every persisted
//! field already carries `#[serde(default = ..)]` in `bedrockproxy_api`,
//! so a plain `serde_json::from_str` already fills in missing keys: we
//! then rewrite the file so the on-disk shape catches up (§8 scenario 6).

use std::path::{Path, PathBuf};

use anyhow::Context;
use bedrockproxy_api::model::{AppConfig, ServerRecord};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::fs;

const CONFIG_FILE: &str = "config.json";
const SERVERS_FILE: &str = "servers.json";
const BACKUPS_DIR: &str = "backups";
const PLUGINS_DIR: &str = "plugins";

pub struct DataStore {
    data_dir: PathBuf,
}

impl DataStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    fn servers_path(&self) -> PathBuf {
        self.data_dir.join(SERVERS_FILE)
    }

    fn backups_dir(&self) -> PathBuf {
        self.data_dir.join(BACKUPS_DIR)
    }

    /// Creates the data directory and its `backups`/`plugins` subdirectories
    /// if absent. A failure here is fatal at daemon startup (§6, §7).
    pub async fn ensure_directories(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("failed to create data directory {:?}", self.data_dir))?;
        fs::create_dir_all(self.backups_dir()).await?;
        fs::create_dir_all(self.data_dir.join(PLUGINS_DIR)).await?;
        Ok(())
    }

    pub async fn load_config(&self) -> anyhow::Result<AppConfig> {
        let path = self.config_path();
        let config = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {:?}", path))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(err) => return Err(err).context("failed to read config.json"),
        };
        self.save_config(&config).await?;
        Ok(config)
    }

    pub async fn save_config(&self, config: &AppConfig) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(config)?;
        atomic_write(&self.config_path(), &json).await
    }

    /// Loads the server catalogue, migrating missing keys to their defaults
    /// and rewriting the file so the on-disk copy reflects the migration.
    pub async fn load_servers(&self) -> anyhow::Result<Vec<ServerRecord>> {
        let path = self.servers_path();
        let records: Vec<ServerRecord> = match fs::read_to_string(&path).await {
            Ok(raw) => {
                serde_json::from_str(&raw).with_context(|| format!("failed to parse {:?}", path))?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).context("failed to read servers.json"),
        };
        self.save_servers(&records).await?;
        Ok(records)
    }

    pub async fn save_servers(&self, records: &[ServerRecord]) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(records)?;
        atomic_write(&self.servers_path(), &json).await
    }

    /// Writes a timestamped snapshot of the current catalogue under
    /// `backups/`. Best-effort: callers decide whether a failure here
    /// should block the operation that triggered it.
    pub async fn backup_servers(&self, records: &[ServerRecord]) -> anyhow::Result<PathBuf> {
        let now = OffsetDateTime::now_utc();
        let stamp = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string())
            .replace([':', '.'], "-");
        let path = self.backups_dir().join(format!("backup_{}.json", stamp));
        let json = serde_json::to_vec_pretty(records)?;
        atomic_write(&path, &json).await?;
        Ok(path)
    }
}

/// Writes `contents` to a sibling `.tmp` file then renames it over `path`,
/// so a reader never observes a partially written file (§5: "all writes
/// use atomic write-and-rename semantics, replace on the same filesystem").
async fn atomic_write(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_owned(),
    });
    fs::write(&tmp_path, contents)
        .await
        .with_context(|| format!("failed to write {:?}", tmp_path))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("failed to rename {:?} to {:?}", tmp_path, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedrockproxy_api::model::ServerStatus;
    use uuid::Uuid;

    fn sample_record(listen: &str) -> ServerRecord {
        let now = OffsetDateTime::now_utc();
        ServerRecord {
            id: Uuid::new_v4(),
            name: "test".to_owned(),
            listen_address: listen.to_owned(),
            destination_address: "127.0.0.1:19133".to_owned(),
            max_players: 10,
            status: ServerStatus::Offline,
            players: Vec::new(),
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

    #[tokio::test]
    async fn round_trips_servers_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path().to_path_buf());
        store.ensure_directories().await.unwrap();

        let records = vec![sample_record("127.0.0.1:19132")];
        store.save_servers(&records).await.unwrap();
        let loaded = store.load_servers().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].listen_address, "127.0.0.1:19132");
    }

    #[tokio::test]
    async fn migrates_servers_json_missing_new_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path().to_path_buf());
        store.ensure_directories().await.unwrap();

        let now = OffsetDateTime::now_utc().format(&Rfc3339).unwrap();
        let legacy = format!(
            r#"[{{"id":"{}","name":"legacy","listenAddress":"127.0.0.1:19132","destinationAddress":"127.0.0.1:19133","maxPlayers":10,"createdAt":"{}","updatedAt":"{}"}}]"#,
            Uuid::new_v4(),
            now,
            now
        );
        tokio::fs::write(dir.path().join("servers.json"), legacy)
            .await
            .unwrap();

        let loaded = store.load_servers().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].proxy_protocol_v2_enabled);

        let rewritten = tokio::fs::read_to_string(dir.path().join("servers.json"))
            .await
            .unwrap();
        assert!(rewritten.contains("proxyProtocolV2Enabled"));
    }

    #[tokio::test]
    async fn load_config_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path().to_path_buf());
        store.ensure_directories().await.unwrap();

        let config = store.load_config().await.unwrap();
        assert_eq!(config.language, "en");
        assert!(dir.path().join("config.json").exists());
    }

    #[tokio::test]
    async fn backup_servers_writes_timestamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path().to_path_buf());
        store.ensure_directories().await.unwrap();

        let path = store.backup_servers(&[sample_record("127.0.0.1:19132")]).await.unwrap();
        assert!(path.exists());
        assert!(path.starts_with(dir.path().join("backups")));
    }
}
