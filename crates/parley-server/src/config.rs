//! Server configuration: TOML file + CLI overrides.

use parley_core::{ParleyError, ParleyResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            ws_path: default_ws_path(),
            max_frame_size: default_max_frame_size(),
            outbound_queue: default_outbound_queue(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            push_timeout_ms: default_push_timeout_ms(),
        }
    }
}

/// `[storage]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_port() -> u16 {
    8080
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_max_frame_size() -> usize {
    1_048_576
}
fn default_outbound_queue() -> usize {
    64
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_push_timeout_ms() -> u64 {
    250
}
fn default_db_path() -> String {
    "./data/parley.db".to_string()
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_address: String,
    pub ws_path: String,
    pub max_frame_size: usize,
    pub outbound_queue: usize,
    pub shutdown_grace: Duration,
    pub push_timeout: Duration,
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl ServerConfig {
    /// Load config from a TOML file (if it exists), then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_db: Option<&str>,
    ) -> ParleyResult<Self> {
        let file_config = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                Self::parse(&content)?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config);
        if let Some(port) = cli_port {
            config.port = port;
        }
        if let Some(bind) = cli_bind {
            config.bind_address = bind.to_string();
        }
        if let Some(db) = cli_db {
            config.db_path = expand_tilde_str(db);
        }
        Ok(config)
    }

    fn parse(content: &str) -> ParleyResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| ParleyError::Other(format!("config parse error: {e}")))
    }

    fn from_file(file: ConfigFile) -> Self {
        let mut ws_path = file.server.ws_path;
        if !ws_path.starts_with('/') {
            ws_path.insert(0, '/');
        }
        Self {
            port: file.server.port,
            bind_address: file.server.bind_address,
            ws_path,
            max_frame_size: file.server.max_frame_size,
            outbound_queue: file.server.outbound_queue.max(1),
            shutdown_grace: Duration::from_millis(file.server.shutdown_grace_ms),
            push_timeout: Duration::from_millis(file.server.push_timeout_ms),
            db_path: expand_tilde_str(&file.storage.db_path),
        }
    }

    /// `bind_address:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.ws_path, "/ws");
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.db_path, PathBuf::from("./data/parley.db"));
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(2));
        assert_eq!(cfg.push_timeout, Duration::from_millis(250));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let file = ServerConfig::parse(
            r#"
            [server]
            port = 9000
            ws_path = "chat"

            [storage]
            db_path = "/var/lib/parley/chat.db"
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::from_file(file);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.ws_path, "/chat");
        assert_eq!(cfg.max_frame_size, 1_048_576);
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/parley/chat.db"));
    }

    #[test]
    fn cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 9000\nbind_address = \"10.0.0.1\"\n").unwrap();

        let cfg = ServerConfig::load(Some(&path), Some(7000), None, Some("/tmp/x.db")).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.bind_address, "10.0.0.1");
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let cfg = ServerConfig::load(Some(Path::new("/nonexistent/parley.toml")), None, None, None)
            .unwrap();
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(ServerConfig::parse("[server\nport = ").is_err());
    }
}
