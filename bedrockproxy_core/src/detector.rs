//! Detector (component H, §4.3 start flow / §6 `server.properties`).
//!
//! Validates a candidate executable, parses `server.properties` for the
//! recognised key set, and proposes a free-ish proxy port. Grounded on the
//! teacher's plain `std::fs`-based config loading style (`trakt_core`
//! reads its TOML config with direct `std::fs::read_to_string` rather than
//! an abstraction layer); we follow the same directness here since the
//! property file format is a flat `key=value` text format, not JSON.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};

use bedrockproxy_api::model::DetectionResult;

const DEFAULT_EXECUTABLE_CANDIDATES: &[&str] =
    &["bedrock_server.exe", "server.exe", "bedrock_server", "server"];

const RECOGNISED_PROPERTY_KEYS: &[&str] = &[
    "server-name",
    "server-port",
    "server-portv4",
    "max-players",
    "gamemode",
    "difficulty",
    "level-name",
    "white-list",
    "whitelist",
    "motd",
    "level-seed",
    "allow-cheats",
    "server-authoritative-movement",
];

/// Walks `server_directory` looking for the first default executable name
/// that exists (§4.3 start flow step 1).
pub fn probe_default_executable(server_directory: &Path) -> Option<PathBuf> {
    DEFAULT_EXECUTABLE_CANDIDATES
        .iter()
        .map(|name| server_directory.join(name))
        .find(|candidate| candidate.is_file())
}

/// Validates that `executable_path` exists and is a file. Directories and
/// missing paths are `INVALID_EXECUTABLE`.
pub fn validate_executable(executable_path: &str) -> anyhow::Result<()> {
    let path = Path::new(executable_path);
    if !path.is_file() {
        anyhow::bail!("INVALID_EXECUTABLE: {} is not a file", executable_path);
    }
    Ok(())
}

/// Parses a `server.properties`-formatted file, keeping only recognised
/// keys (§6). Unknown keys are not surfaced here but are preserved
/// verbatim by `rewrite_property` below, which edits the raw text in
/// place rather than round-tripping through this map.
pub fn parse_server_properties(contents: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if RECOGNISED_PROPERTY_KEYS.contains(&key) {
                properties.insert(key.to_owned(), value.trim().to_owned());
            }
        }
    }
    properties
}

/// Rewrites a single `key=value` line in `contents`, preserving every other
/// line verbatim (including unrecognised keys and comments). Appends the
/// key if absent.
pub fn rewrite_property(contents: &str, key: &str, value: &str) -> String {
    let mut found = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| {
            let trimmed = line.trim();
            if !found && !trimmed.starts_with('#') {
                if let Some((existing_key, _)) = trimmed.split_once('=') {
                    if existing_key.trim() == key {
                        found = true;
                        return format!("{}={}", key, value);
                    }
                }
            }
            line.to_owned()
        })
        .collect();
    if !found {
        lines.push(format!("{}={}", key, value));
    }
    lines.join("\n")
}

/// Proposes a UDP port for the proxy's listen socket by probing ephemeral
/// binds starting from `preferred`, falling back to the OS-assigned
/// ephemeral port if nothing near `preferred` is free.
pub fn suggest_proxy_port(preferred: u16) -> u16 {
    for candidate in preferred..preferred.saturating_add(20).max(preferred + 1) {
        if candidate == 0 {
            continue;
        }
        let addr: SocketAddr = ([0, 0, 0, 0], candidate).into();
        if UdpSocket::bind(addr).is_ok() {
            return candidate;
        }
    }
    let addr: SocketAddr = ([0, 0, 0, 0], 0).into();
    UdpSocket::bind(addr)
        .and_then(|sock| sock.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(preferred)
}

/// Runs the full detection flow for `servers.detect`: validates the
/// executable, reads `server.properties` next to it if present, and
/// proposes a proxy port distinct from the detected destination port.
pub fn detect(executable_path: &str) -> anyhow::Result<DetectionResult> {
    validate_executable(executable_path)?;
    let path = Path::new(executable_path);
    let server_directory = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let properties_path = server_directory.join("server.properties");
    let properties = std::fs::read_to_string(&properties_path)
        .map(|raw| parse_server_properties(&raw))
        .unwrap_or_default();

    let suggested_destination_port = properties
        .get("server-portv4")
        .or_else(|| properties.get("server-port"))
        .and_then(|p| p.parse::<u16>().ok());
    let suggested_proxy_port = suggest_proxy_port(suggested_destination_port.unwrap_or(19132) + 1);
    let max_players = properties.get("max-players").and_then(|p| p.parse::<u32>().ok());
    let suggested_name = properties.get("server-name").cloned();

    Ok(DetectionResult {
        executable_path: executable_path.to_owned(),
        server_directory: server_directory.to_string_lossy().into_owned(),
        suggested_name,
        suggested_destination_port,
        suggested_proxy_port,
        max_players,
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognised_keys_and_skips_unknown() {
        let contents = "server-name=My Server\nmax-players=20\nunknown-key=ignored\n# comment\n";
        let properties = parse_server_properties(contents);
        assert_eq!(properties.get("server-name").unwrap(), "My Server");
        assert_eq!(properties.get("max-players").unwrap(), "20");
        assert!(!properties.contains_key("unknown-key"));
    }

    #[test]
    fn rewrite_property_preserves_unknown_lines() {
        let contents = "server-name=Old\nunknown-key=keepme\nmax-players=10";
        let rewritten = rewrite_property(contents, "server-name", "New");
        assert!(rewritten.contains("server-name=New"));
        assert!(rewritten.contains("unknown-key=keepme"));
        assert!(rewritten.contains("max-players=10"));
    }

    #[test]
    fn rewrite_property_appends_when_missing() {
        let contents = "server-name=Old";
        let rewritten = rewrite_property(contents, "max-players", "30");
        assert!(rewritten.contains("max-players=30"));
    }

    #[test]
    fn validate_executable_rejects_directory() {
        let result = validate_executable(".");
        assert!(result.is_err());
    }
}
