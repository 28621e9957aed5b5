//! Configuration structs with defaults and RON persistence.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use empire_net::{
    Empire, FrameConfig, ReconnectConfig, ServerConfig, SocketConfig, StaticAccounts,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration shared by the client and server binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Endpoints and socket options.
    pub network: NetworkConfig,
    /// Client reconnect backoff.
    pub reconnect: ReconnectSettings,
    /// Client session credentials.
    pub session: SessionConfig,
    /// Game and login server settings.
    pub server: ServerSettings,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Login endpoint the client POSTs to.
    pub login_url: String,
    /// Game host used when a login response names none.
    pub game_host: String,
    /// Largest accepted frame payload, in bytes.
    pub max_payload_size: u32,
    /// Give up dialing the game server after this many seconds.
    pub connect_timeout_seconds: u64,
    /// Give up on the login request after this many seconds.
    pub login_timeout_seconds: u64,
    /// Disable Nagle's algorithm on game sockets.
    pub tcp_nodelay: bool,
    /// Keepalive idle time in seconds (0 disables keepalive).
    pub keepalive_seconds: u64,
}

/// Reconnect backoff, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// First retry delay.
    pub initial_delay_ms: u64,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Delay ceiling.
    pub max_delay_ms: u64,
    /// ± fraction of random jitter (0.0 disables).
    pub jitter: f64,
}

/// Persisted client credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Session cookie from the last successful sign-up or login.
    pub cookie: Option<String>,
}

/// One account the demo login server knows about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub cookie: String,
    pub empire_id: i64,
    pub display_name: String,
    /// Identity token the account is bound to. Logins presenting a
    /// different token are refused.
    #[serde(default)]
    pub identity: Option<String>,
    /// Refuse logins for this account.
    #[serde(default)]
    pub banned: bool,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address both listeners bind to.
    pub bind_address: String,
    /// Game socket port.
    pub game_port: u16,
    /// HTTP login port.
    pub login_port: u16,
    /// Host handed to clients in login responses. `None` lets clients use their default.
    pub public_host: Option<String>,
    /// Maximum concurrent game sessions.
    pub max_connections: usize,
    /// Seconds a new connection has to present its cookie.
    pub upgrade_timeout_seconds: u64,
    /// Known accounts.
    pub accounts: Vec<Account>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Also write JSON logs to the config directory's `logs/`.
    pub file_logging: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            login_url: "http://127.0.0.1:8080/login".to_string(),
            game_host: "127.0.0.1".to_string(),
            max_payload_size: 1_048_576,
            connect_timeout_seconds: 10,
            login_timeout_seconds: 15,
            tcp_nodelay: true,
            keepalive_seconds: 60,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.0,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            game_port: 8081,
            login_port: 8080,
            public_host: None,
            max_connections: 256,
            upgrade_timeout_seconds: 10,
            accounts: vec![Account {
                cookie: "demo-cookie".to_string(),
                empire_id: 1,
                display_name: "Demo Empire".to_string(),
                identity: None,
                banned: false,
            }],
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            file_logging: cfg!(debug_assertions),
        }
    }
}

// --- Conversions into runtime settings ---

impl NetworkConfig {
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
        }
    }

    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            tcp_nodelay: self.tcp_nodelay,
            keepalive_enabled: self.keepalive_seconds > 0,
            keepalive_idle: Duration::from_secs(self.keepalive_seconds.max(1)),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            ..SocketConfig::default()
        }
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_seconds)
    }
}

impl ReconnectSettings {
    pub fn to_reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter.clamp(0.0, 1.0),
        }
    }
}

impl ServerSettings {
    fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                field: "server.bind_address",
                value: self.bind_address.clone(),
            })
    }

    /// Address the game socket listens on.
    pub fn game_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.game_port))
    }

    /// Address the login endpoint listens on.
    pub fn login_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.login_port))
    }

    /// Game server settings, combined with the shared network options.
    pub fn server_config(&self, network: &NetworkConfig) -> Result<ServerConfig, ConfigError> {
        Ok(ServerConfig {
            bind_addr: self.game_addr()?,
            max_connections: self.max_connections,
            upgrade_timeout: Duration::from_secs(self.upgrade_timeout_seconds),
            frame: network.frame_config(),
            socket: network.socket_config(),
        })
    }

    /// Cookie table of the accounts that may play.
    pub fn account_table(&self) -> StaticAccounts {
        let mut table = StaticAccounts::default();
        for account in self.accounts.iter().filter(|a| !a.banned) {
            table.insert(account.cookie.clone(), account.empire());
        }
        table
    }

    /// Look up an account by cookie.
    pub fn account(&self, cookie: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.cookie == cookie)
    }
}

impl Account {
    pub fn empire(&self) -> Empire {
        Empire {
            id: self.empire_id,
            display_name: self.display_name.clone(),
            home_star: None,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(4)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Re-read the file: `Some(new_config)` if it changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Default config directory for `app`, under the platform config dir.
    pub fn default_dir(app: &str) -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("empire").join(app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let config = Config::default();
        let ron_str =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::new().depth_limit(4))
                .unwrap();
        assert!(ron_str.contains("game_port: 8081"));
        assert!(ron_str.contains("initial_delay_ms: 1000"));
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.session.cookie = Some("abc".to_string());
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_section_uses_default() {
        let ron_str = "(network: (), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.reconnect, ReconnectSettings::default());
        assert_eq!(config.session.cookie, None);
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.login_url = "http://10.0.0.1:8080/login".to_string();
        config.session.cookie = Some("persisted".to_string());

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.reconnect.max_delay_ms = 5_000;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.reconnect.max_delay_ms, 5_000);
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }

    #[test]
    fn test_reconnect_settings_convert() {
        let settings = ReconnectSettings {
            initial_delay_ms: 250,
            backoff_multiplier: 3.0,
            max_delay_ms: 4_000,
            jitter: 2.0,
        };
        let config = settings.to_reconnect_config();
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(4));
        assert_eq!(config.jitter, 1.0);
    }

    #[test]
    fn test_server_config_uses_network_options() {
        let mut config = Config::default();
        config.network.max_payload_size = 4096;
        config.server.bind_address = "127.0.0.1".to_string();

        let server = config.server.server_config(&config.network).unwrap();
        assert_eq!(server.bind_addr, "127.0.0.1:8081".parse().unwrap());
        assert_eq!(server.frame.max_payload_size, 4096);
    }

    #[test]
    fn test_bad_bind_address_is_reported() {
        let mut settings = ServerSettings::default();
        settings.bind_address = "not-an-ip".to_string();
        assert!(matches!(
            settings.game_addr(),
            Err(ConfigError::InvalidValue { field: "server.bind_address", .. })
        ));
    }

    #[test]
    fn test_banned_accounts_cannot_play() {
        use empire_net::AccountResolver;

        let mut settings = ServerSettings::default();
        settings.accounts.push(Account {
            cookie: "exile".to_string(),
            empire_id: 2,
            display_name: "Exiles".to_string(),
            identity: None,
            banned: true,
        });
        let table = settings.account_table();
        assert_eq!(table.resolve("demo-cookie").map(|e| e.id), Some(1));
        assert!(table.resolve("exile").is_none());
        assert!(settings.account("exile").is_some());
    }
}
