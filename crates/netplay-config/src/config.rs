//! Configuration sections with defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use netplay::SessionConfig;
use netplay::lobby::{NETCODE_VERSION_MAJOR, NETCODE_VERSION_MINOR};
use netplay::messages::MAX_CONNECTED_PLAYERS;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Where `config.ron` lives when no directory is given: `<config dir>/netplay`.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("netplay"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Top-level peer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub session: SessionSettings,
    pub player: PlayerConfig,
    pub debug: DebugConfig,
}

/// Addresses and ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port a hosted game listens on.
    pub game_port: u16,
    /// Upper bound on an outbound connect, in seconds.
    pub connect_timeout_secs: u64,
    /// Player slots when hosting, host included.
    pub max_players: usize,
}

/// Session timing and limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    pub heartbeat_interval_ms: u64,
    /// Silence before a peer is dropped.
    pub heartbeat_timeout_ms: u64,
    pub kick_grace_ms: u64,
    /// How long a lagging player may stall game time.
    pub wait_timeout_ms: u64,
    pub join_timeout_ms: u64,
    /// Malformed envelopes tolerated per player.
    pub malformed_limit: u32,
    pub file_chunk_size: usize,
    pub file_chunks_per_tick: usize,
    /// Game data hash compared at join time (0 = unchecked).
    pub data_hash: u32,
}

/// Local player identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerConfig {
    pub name: String,
    /// Password used when joining, or required when hosting. Empty means none.
    pub password: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Directory for desync dumps. Dumps go to the log when unset.
    pub sync_dump_dir: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            game_port: 2100,
            connect_timeout_secs: 5,
            max_players: MAX_CONNECTED_PLAYERS,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 10_000,
            kick_grace_ms: 2000,
            wait_timeout_ms: 15_000,
            join_timeout_ms: 10_000,
            malformed_limit: 16,
            file_chunk_size: 4096,
            file_chunks_per_tick: 4,
            data_hash: 0,
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            name: "Player".to_string(),
            password: String::new(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sync_dump_dir: None,
        }
    }
}

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there if it is missing.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            let config = Self::read(&path)?;
            log::info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Save as `config_dir/config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;
        std::fs::write(&path, text).map_err(|source| ConfigError::Write { path, source })
    }

    /// Re-read the file. `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = Self::read(&config_dir.join(CONFIG_FILE))?;
        if &fresh == self {
            return Ok(None);
        }
        log::info!("Config reloaded with changes");
        Ok(Some(fresh))
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        ron::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Session parameters for [`netplay::Session`].
    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            max_players: self.network.max_players,
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(s.heartbeat_timeout_ms),
            kick_grace: Duration::from_millis(s.kick_grace_ms),
            wait_timeout: Duration::from_millis(s.wait_timeout_ms),
            join_timeout: Duration::from_millis(s.join_timeout_ms),
            malformed_limit: s.malformed_limit,
            file_chunk_size: s.file_chunk_size,
            file_chunks_per_tick: s.file_chunks_per_tick,
            sync_dump_dir: self.debug.sync_dump_dir.clone(),
            data_hash: s.data_hash,
            version: (NETCODE_VERSION_MAJOR, NETCODE_VERSION_MINOR),
        }
    }

    /// The configured password, if any.
    pub fn password(&self) -> Option<&str> {
        Some(self.player.password.as_str()).filter(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_session_defaults() {
        let config = Config::default();
        let session = config.session_config();
        let stock = SessionConfig::default();
        assert_eq!(session.max_players, stock.max_players);
        assert_eq!(session.heartbeat_interval, stock.heartbeat_interval);
        assert_eq!(session.heartbeat_timeout, stock.heartbeat_timeout);
        assert_eq!(session.kick_grace, stock.kick_grace);
        assert_eq!(session.wait_timeout, stock.wait_timeout);
        assert_eq!(session.join_timeout, stock.join_timeout);
        assert_eq!(session.malformed_limit, stock.malformed_limit);
        assert_eq!(session.file_chunk_size, stock.file_chunk_size);
        assert_eq!(session.version, stock.version);
        assert_eq!(config.network.game_port, 2100);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(network: (game_port: 2200))").unwrap();
        assert_eq!(config.network.game_port, 2200);
        assert_eq!(config.network.max_players, MAX_CONNECTED_PLAYERS);
        assert_eq!(config.session, SessionSettings::default());
    }

    #[test]
    fn test_unknown_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_retired_network_fields_still_load() {
        let text = r#"(network: (game_port: 2300, master_server: "lobby.example", master_server_port: 9990))"#;
        let config: Config = ron::from_str(text).unwrap();
        assert_eq!(config.network.game_port, 2300);
        assert!(!ron::to_string(&config).unwrap().contains("master_server"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.player.name = "Commander".to_string();
        config.debug.sync_dump_dir = Some(PathBuf::from("dumps"));
        config.session.wait_timeout_ms = 30_000;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.session_config().wait_timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("netplay");
        let config = Config::load_or_create(&nested).unwrap();
        assert_eq!(config, Config::default());
        assert!(nested.join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_reports_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut changed = config.clone();
        changed.network.max_players = 4;
        changed.save(dir.path()).unwrap();
        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.session_config().max_players, 4);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn test_empty_password_is_none() {
        let mut config = Config::default();
        assert_eq!(config.password(), None);
        config.player.password = "secret".to_string();
        assert_eq!(config.password(), Some("secret"));
    }
}
