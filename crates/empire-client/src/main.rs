//! Headless empire client.
//!
//! Keeps a game session alive through [`ReconnectController`], logs what the
//! server sends, and turns stdin lines into chat. Lines starting with `/` are
//! commands: `/cookie <value>`, `/login <url>`, `/reconnect`, `/quit`.
//!
//! Run with `cargo run -p empire-client -- --cookie demo-cookie`.

mod cache;
mod credentials;

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use clap::Parser;
use empire_config::{CliArgs, Config};
use empire_net::{
    ChatMessage, ChatMessagesPacket, ConnectionState, Direction, Dispatcher, Packet, PacketEvent,
    PacketKind, ReconnectController, RequestEmpirePacket, TcpConnector, UreqLoginTransport,
    WatchSectorsPacket,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::cache::SessionCache;
use crate::credentials::ConfigCredentials;

/// Sectors watched around the home star, in each direction.
const WATCH_RADIUS: i64 = 2;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(|| Config::default_dir("client"))
        .unwrap_or_else(|| PathBuf::from("."));
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}, using defaults");
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);
    if args.cookie.is_some()
        && let Err(e) = config.save(&config_dir)
    {
        eprintln!("Failed to save cookie: {e}");
    }

    empire_log::init_logging(
        Some(&config_dir.join("logs")),
        config.debug.file_logging,
        Some(&config),
    );

    if let Err(e) = run(config_dir, config).await {
        error!("Client stopped: {e}");
        std::process::exit(1);
    }
}

async fn run(config_dir: PathBuf, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Arc::new(Dispatcher::new());
    let cache = Arc::new(SessionCache::default());
    cache.attach(&dispatcher);
    register_log_handlers(&dispatcher);

    if config.session.cookie.is_none() {
        warn!("No session cookie; pass --cookie or type /cookie <value>");
    }

    let network = &config.network;
    let controller = ReconnectController::builder(
        Arc::new(ConfigCredentials::new(config_dir, config.clone())),
        Arc::clone(&dispatcher),
    )
    .login_transport(Arc::new(UreqLoginTransport::new(network.login_timeout())))
    .default_host(network.game_host.clone())
    .connector(Arc::new(TcpConnector::new(network.socket_config())))
    .resume(cache.clone())
    .reconnect_config(config.reconnect.to_reconnect_config())
    .frame_config(network.frame_config())
    .build()?;
    let controller = Arc::new(controller);

    tokio::spawn(trace_packets(dispatcher.subscribe_packets()));
    tokio::spawn(watch_state(
        Arc::downgrade(&controller),
        Arc::clone(&dispatcher),
        cache,
    ));
    controller.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&controller, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    break;
                }
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {e}");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    controller.shutdown();
    Ok(())
}

/// Act on one stdin line. Returns `false` to quit.
async fn handle_line(controller: &ReconnectController, line: &str) -> bool {
    match line.split_once(' ').unwrap_or((line, "")) {
        ("", _) => {}
        ("/quit", _) => return false,
        ("/cookie", cookie) if !cookie.trim().is_empty() => {
            controller.update_cookie(cookie.trim());
        }
        ("/login", url) if !url.trim().is_empty() => {
            controller.update_endpoint(url.trim());
            info!("Login endpoint changed; set a cookie with /cookie <value>");
        }
        ("/reconnect", _) => controller.disconnect(),
        (command, _) if command.starts_with('/') => {
            warn!("Unknown command {command}");
        }
        _ => {
            let chat = Packet::ChatMessages(ChatMessagesPacket {
                messages: vec![ChatMessage {
                    id: 0,
                    empire_id: None,
                    date_posted: 0,
                    message: line.to_string(),
                }],
            });
            match controller.send(chat).await {
                Ok(delivery) => tracing::debug!("Chat {delivery:?}"),
                Err(e) => warn!("Chat not sent: {e}"),
            }
        }
    }
    true
}

fn register_log_handlers(dispatcher: &Dispatcher) {
    dispatcher.register_handler(PacketKind::ChatMessages, |packet| {
        if let Packet::ChatMessages(chat) = packet {
            for message in &chat.messages {
                match message.empire_id {
                    Some(empire) => info!("[chat] <{empire}> {}", message.message),
                    None => info!("[chat] {}", message.message),
                }
            }
        }
        Ok(())
    });
    dispatcher.register_handler(PacketKind::StarUpdated, |packet| {
        if let Packet::StarUpdated(update) = packet {
            for star in &update.stars {
                info!(
                    "Star {} ({}) at sector {},{}",
                    star.name, star.id, star.sector_x, star.sector_y
                );
            }
        }
        Ok(())
    });
    dispatcher.register_handler(PacketKind::EmpireDetails, |packet| {
        if let Packet::EmpireDetails(details) = packet {
            for empire in &details.empires {
                info!("Empire {}: {}", empire.id, empire.display_name);
            }
        }
        Ok(())
    });
}

async fn trace_packets(mut events: broadcast::Receiver<PacketEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let arrow = match event.direction {
                    Direction::Sent => ">>",
                    Direction::Received => "<<",
                };
                tracing::trace!("{arrow} {:?} ({} bytes)", event.kind, event.encoded_size);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::trace!("Packet trace skipped {skipped} event(s)");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Log state transitions, and set up the view each time a session goes live.
async fn watch_state(
    controller: Weak<ReconnectController>,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<SessionCache>,
) {
    let mut states = dispatcher.subscribe_state();
    while states.changed().await.is_ok() {
        let event = states.borrow_and_update().clone();
        match event.login_status {
            Some(status) => info!("{}: {:?} ({status:?})", event.url, event.state),
            None => info!("{}: {:?}", event.url, event.state),
        }
        if event.state != ConnectionState::Connected {
            continue;
        }

        let Some(controller) = controller.upgrade() else {
            return;
        };
        let Some(empire) = event.empire.or_else(|| cache.empire()) else {
            continue;
        };
        let mut setup = vec![Packet::RequestEmpire(RequestEmpirePacket {
            empire_ids: vec![empire.id],
        })];
        if let Some(home) = &empire.home_star {
            setup.push(Packet::WatchSectors(WatchSectorsPacket {
                left: home.sector_x - WATCH_RADIUS,
                top: home.sector_y - WATCH_RADIUS,
                right: home.sector_x + WATCH_RADIUS,
                bottom: home.sector_y + WATCH_RADIUS,
            }));
        }
        for packet in setup {
            if let Err(e) = controller.send(packet).await {
                warn!("Setup packet not sent: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use empire_net::{MemoryCredentials, NoResume};

    fn offline_controller() -> ReconnectController {
        let credentials = Arc::new(MemoryCredentials::new("http://127.0.0.1:9/login", None));
        ReconnectController::builder(credentials, Arc::new(Dispatcher::new()))
            .resume(Arc::new(NoResume))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_chat_lines_queue_while_offline() {
        let controller = offline_controller();
        assert!(handle_line(&controller, "hello there").await);
        assert!(handle_line(&controller, "/unknown").await);
        assert!(handle_line(&controller, "").await);
        assert_eq!(controller.queued_len(), 1);
        assert!(!handle_line(&controller, "/quit").await);
    }

    #[tokio::test]
    async fn test_login_command_switches_endpoint() {
        let controller = offline_controller();
        assert!(handle_line(&controller, "/login http://other.test/login").await);
        let event = controller.dispatcher().current_state();
        assert_eq!(event.url, "http://other.test/login");
        assert_eq!(event.state, ConnectionState::Disconnected);
    }
}
