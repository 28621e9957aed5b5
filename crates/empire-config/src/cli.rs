//! Command-line argument parsing shared by the empire binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "empire", about = "Empire game session tools")]
pub struct CliArgs {
    /// Login endpoint URL.
    #[arg(long)]
    pub login_url: Option<String>,

    /// Game host to use when the login server names none.
    #[arg(long)]
    pub host: Option<String>,

    /// Session cookie (persisted to the config file).
    #[arg(long)]
    pub cookie: Option<String>,

    /// Game socket port (server).
    #[arg(long)]
    pub port: Option<u16>,

    /// HTTP login port (server).
    #[arg(long)]
    pub login_port: Option<u16>,

    /// Maximum concurrent sessions (server).
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref url) = args.login_url {
            self.network.login_url = url.clone();
        }
        if let Some(ref host) = args.host {
            self.network.game_host = host.clone();
        }
        if let Some(ref cookie) = args.cookie {
            self.session.cookie = Some(cookie.clone());
        }
        if let Some(port) = args.port {
            self.server.game_port = port;
        }
        if let Some(port) = args.login_port {
            self.server.login_port = port;
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            login_url: Some("http://10.1.1.1/login".to_string()),
            cookie: Some("abc".to_string()),
            port: Some(9001),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.login_url, "http://10.1.1.1/login");
        assert_eq!(config.session.cookie.as_deref(), Some("abc"));
        assert_eq!(config.server.game_port, 9001);
        // Non-overridden fields retain defaults
        assert_eq!(config.server.login_port, 8080);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from(["empire", "--cookie", "xyz", "--log-level", "debug"]);
        assert_eq!(args.cookie.as_deref(), Some("xyz"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.config.is_none());
    }
}
