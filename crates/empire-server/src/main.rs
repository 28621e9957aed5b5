//! Empire game server: the game socket plus the HTTP login endpoint.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p empire-server -- --port 8081 --login-port 8080`.

mod login;
mod world;

use std::sync::Arc;

use clap::Parser;
use empire_config::{Account, CliArgs, Config};
use empire_net::GameServer;
use tracing::{error, info};

use crate::login::{LoginServer, LoginService};
use crate::world::{World, WorldAccounts};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(|| Config::default_dir("server"))
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}, using defaults");
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);

    empire_log::init_logging(
        Some(&config_dir.join("logs")),
        config.debug.file_logging,
        Some(&config),
    );

    if let Err(e) = run(config).await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let settings = &config.server;
    let world = Arc::new(World::new(
        settings
            .accounts
            .iter()
            .filter(|a| !a.banned)
            .map(Account::empire),
    ));

    let mut login = LoginServer::start(
        settings.login_addr()?,
        Arc::new(LoginService::new(settings, Arc::clone(&world))),
    )?;

    let resolver = Arc::new(WorldAccounts {
        table: settings.account_table(),
        world: Arc::clone(&world),
    });
    let server = Arc::new(GameServer::new(
        settings.server_config(&config.network)?,
        resolver,
        world,
    ));

    let accept = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    info!(
        "Serving {} account(s); press Ctrl+C to stop",
        settings.accounts.len()
    );
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {e}");
            }
        }
        finished = accept => {
            login.stop();
            return match finished {
                Ok(result) => result.map_err(Into::into),
                Err(e) => Err(e.into()),
            };
        }
    }

    info!("Shutting down");
    server.shutdown();
    login.stop();
    Ok(())
}
