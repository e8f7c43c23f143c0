//! Configuration module for craftwatch.
//!
//! Loads process configuration from environment variables with sensible
//! defaults, and the server roster from a JSON file.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::HostId;

/// Default Minecraft server port.
pub const DEFAULT_PORT: u16 = 25565;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse roster: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the query API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "craftwatch.db")
    pub db_path: String,
    /// Path to the JSON roster (default: "servers.json")
    pub servers_path: String,
    /// Tick interval in milliseconds (default: 3000)
    pub ping_interval_ms: u64,
    /// Per-probe budget in milliseconds (default: 2500)
    pub connect_timeout_ms: u64,
    /// Span of the coarse history window (default: 24h)
    pub graph_duration_ms: u64,
    /// Span of the fine per-server window (default: 3 minutes)
    pub server_graph_duration_ms: u64,
    /// Minimum spacing of coarse points (default: 1 minute)
    pub graph_sample_interval_ms: u64,
    /// How often old samples are purged from the database (default: 1h)
    pub cleanup_interval_ms: u64,
    /// Persist samples and records (default: true)
    pub log_to_database: bool,
    /// Log every failed probe at warn level (default: true)
    pub log_failed_pings: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "craftwatch.db".to_string(),
            servers_path: "servers.json".to_string(),
            ping_interval_ms: 3_000,
            connect_timeout_ms: 2_500,
            graph_duration_ms: 24 * 60 * 60 * 1000,
            server_graph_duration_ms: 3 * 60 * 1000,
            graph_sample_interval_ms: 60 * 1000,
            cleanup_interval_ms: 60 * 60 * 1000,
            log_to_database: true,
            log_failed_pings: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every field can be overridden by `CRAFTWATCH_<FIELD>` in upper case,
    /// e.g. `CRAFTWATCH_PING_INTERVAL_MS=5000`. Unparseable values are ignored.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        override_from_env("CRAFTWATCH_HTTP_PORT", &mut cfg.http_port);
        if let Ok(db_path) = env::var("CRAFTWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(servers_path) = env::var("CRAFTWATCH_SERVERS_PATH") {
            cfg.servers_path = servers_path;
        }
        override_from_env("CRAFTWATCH_PING_INTERVAL_MS", &mut cfg.ping_interval_ms);
        override_from_env("CRAFTWATCH_CONNECT_TIMEOUT_MS", &mut cfg.connect_timeout_ms);
        override_from_env("CRAFTWATCH_GRAPH_DURATION_MS", &mut cfg.graph_duration_ms);
        override_from_env("CRAFTWATCH_SERVER_GRAPH_DURATION_MS", &mut cfg.server_graph_duration_ms);
        override_from_env("CRAFTWATCH_GRAPH_SAMPLE_INTERVAL_MS", &mut cfg.graph_sample_interval_ms);
        override_from_env("CRAFTWATCH_CLEANUP_INTERVAL_MS", &mut cfg.cleanup_interval_ms);
        override_from_env("CRAFTWATCH_LOG_TO_DATABASE", &mut cfg.log_to_database);
        override_from_env("CRAFTWATCH_LOG_FAILED_PINGS", &mut cfg.log_failed_pings);

        cfg
    }

    /// Reject settings the scheduler cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid("ping interval must be positive".to_string()));
        }
        if self.connect_timeout_ms == 0 || self.connect_timeout_ms >= self.ping_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "connect timeout ({}ms) must be positive and below the ping interval ({}ms)",
                self.connect_timeout_ms, self.ping_interval_ms
            )));
        }
        if self.graph_duration_ms == 0 || self.server_graph_duration_ms == 0 {
            return Err(ConfigError::Invalid("graph durations must be positive".to_string()));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigError::Invalid("cleanup interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn graph_duration(&self) -> Duration {
        Duration::from_millis(self.graph_duration_ms)
    }

    pub fn server_graph_duration(&self) -> Duration {
        Duration::from_millis(self.server_graph_duration_ms)
    }

    pub fn graph_sample_interval(&self) -> Duration {
        Duration::from_millis(self.graph_sample_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn override_from_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={:?}", name, raw),
        }
    }
}

/// One roster entry as written in `servers.json`.
#[derive(Debug, Clone, Deserialize)]
struct RosterFileEntry {
    name: String,
    ip: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    protocols: Vec<i32>,
}

/// A monitored host. Immutable for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub id: HostId,
    pub address: String,
    pub port: u16,
    pub label: String,
    pub color: Option<String>,
    pub protocol_hints: Vec<i32>,
}

impl RosterEntry {
    pub fn new(id: HostId, label: &str, address: &str, port: u16) -> Self {
        Self {
            id,
            address: address.to_string(),
            port,
            label: label.to_string(),
            color: None,
            protocol_hints: Vec::new(),
        }
    }

    /// Key under which this host's samples and record are persisted.
    pub fn host_key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Parse a roster document. Ids follow file order.
pub fn parse_roster(json: &str) -> Result<Vec<RosterEntry>, ConfigError> {
    let entries: Vec<RosterFileEntry> = serde_json::from_str(json)?;

    let mut roster = Vec::with_capacity(entries.len());
    for (id, entry) in entries.into_iter().enumerate() {
        if entry.ip.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("server {:?} has no address", entry.name)));
        }
        let candidate = RosterEntry {
            id,
            address: entry.ip.trim().to_string(),
            port: entry.port.unwrap_or(DEFAULT_PORT),
            label: entry.name,
            color: entry.color,
            protocol_hints: entry.protocols,
        };
        if roster.iter().any(|e: &RosterEntry| e.host_key() == candidate.host_key()) {
            return Err(ConfigError::Invalid(format!("duplicate server {}", candidate.host_key())));
        }
        roster.push(candidate);
    }
    Ok(roster)
}

/// Load the roster from a JSON file.
pub fn load_roster<P: AsRef<Path>>(path: P) -> Result<Vec<RosterEntry>, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_roster(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "craftwatch.db");
        assert_eq!(cfg.ping_interval(), Duration::from_secs(3));
        tokio_test::assert_ok!(cfg.validate());
    }

    #[test]
    fn test_validate_rejects_timeout_above_interval() {
        let cfg = ServerConfig {
            connect_timeout_ms: 5_000,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let cfg = ServerConfig {
            cleanup_interval_ms: 0,
            ..Default::default()
        };
        tokio_test::assert_err!(cfg.validate());
    }

    #[test]
    fn test_parse_roster() {
        let roster = parse_roster(
            r##"[
                {"name": "Hypixel", "ip": "mc.hypixel.net", "color": "#ffb300"},
                {"name": "Retro", "ip": "retro.example.org", "port": 25570, "protocols": [47, 5]}
            ]"##,
        )
        .unwrap();

        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].id, 0);
        assert_eq!(roster[0].port, DEFAULT_PORT);
        assert_eq!(roster[0].color.as_deref(), Some("#ffb300"));
        assert_eq!(roster[1].id, 1);
        assert_eq!(roster[1].host_key(), "retro.example.org:25570");
        assert_eq!(roster[1].protocol_hints, vec![47, 5]);
    }

    #[test]
    fn test_parse_roster_rejects_duplicates() {
        let result = parse_roster(r#"[{"name": "a", "ip": "x"}, {"name": "b", "ip": "x", "port": 25565}]"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_roster_missing_file() {
        assert!(matches!(load_roster("/nonexistent/servers.json"), Err(ConfigError::Io { .. })));
    }
}
