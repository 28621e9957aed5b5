//! Server side of the game socket.
//!
//! [`GameServer`] accepts TCP connections, reads the cookie upgrade
//! preamble, resolves it to an empire and wraps the stream in a
//! [`GameSession`]. Each session greets its player with `Hello` before
//! anything is read, then forwards inbound packets to the server's
//! [`PlayerHandler`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::codec::{self, FrameConfig, FrameError};
use crate::connector::{self, SocketConfig};
use crate::packet::{Empire, HelloPacket, Packet};
use crate::session::{
    ConnectionSession, IdGenerator, InboundHandler, SessionError, SessionId, Transport,
};

/// Who is on the other end of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionIdentity {
    /// Cookie presented in the upgrade preamble.
    pub cookie: String,
    /// Empire the cookie resolved to.
    pub empire: Empire,
}

/// Maps upgrade cookies to empires.
pub trait AccountResolver: Send + Sync + 'static {
    /// The empire `cookie` belongs to, or `None` to refuse the connection.
    fn resolve(&self, cookie: &str) -> Option<Empire>;
}

/// Fixed cookie → empire table.
#[derive(Debug, Default, Clone)]
pub struct StaticAccounts {
    accounts: HashMap<String, Empire>,
}

impl StaticAccounts {
    pub fn new(accounts: HashMap<String, Empire>) -> Self {
        Self { accounts }
    }

    pub fn insert(&mut self, cookie: impl Into<String>, empire: Empire) {
        self.accounts.insert(cookie.into(), empire);
    }
}

impl AccountResolver for StaticAccounts {
    fn resolve(&self, cookie: &str) -> Option<Empire> {
        self.accounts.get(cookie).cloned()
    }
}

/// Game logic behind the server's sessions.
///
/// Called from each session's read loop, one packet at a time per session.
pub trait PlayerHandler: Send + Sync + 'static {
    /// A packet arrived from the player.
    fn on_packet(&self, session: &Arc<GameSession>, packet: Packet);

    /// The session ended, from either side. Called once.
    fn on_disconnect(&self, _session: &Arc<GameSession>) {}
}

/// One connected player.
pub struct GameSession {
    conn: Arc<ConnectionSession>,
    identity: SessionIdentity,
    handler: Arc<dyn PlayerHandler>,
    disconnected: AtomicBool,
}

impl GameSession {
    /// Take over an authenticated stream: send `Hello { empire }`, then
    /// start forwarding inbound packets to `handler`.
    pub async fn accept<T: Transport>(
        stream: T,
        id: SessionId,
        identity: SessionIdentity,
        handler: Arc<dyn PlayerHandler>,
        config: FrameConfig,
    ) -> Result<Arc<Self>, SessionError> {
        let (conn, inbound) = ConnectionSession::split(stream, id, config);
        let session = Arc::new(Self {
            conn,
            identity,
            handler,
            disconnected: AtomicBool::new(false),
        });

        let hello = Packet::Hello(HelloPacket {
            empire: Some(session.identity.empire.clone()),
            ..Default::default()
        });
        if let Err(e) = session.conn.send(&hello).await {
            tracing::warn!("Failed to greet {id:?}: {e}");
            session.conn.close();
            return Err(e);
        }

        inbound.spawn(Arc::new(PlayerEvents {
            session: Arc::clone(&session),
        }));
        tracing::info!(
            "Session {id:?} started for empire {} ({})",
            session.identity.empire.id,
            session.identity.empire.display_name
        );
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.conn.id()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn empire(&self) -> &Empire {
        &self.identity.empire
    }

    /// Send one packet. Failures are logged and returned; there is no retry.
    pub async fn send(&self, packet: &Packet) -> Result<usize, SessionError> {
        self.conn.send(packet).await.inspect_err(|e| {
            tracing::warn!("Send {:?} to {:?} failed: {e}", packet.kind(), self.id());
        })
    }

    /// Close the transport. Idempotent.
    pub fn close(self: &Arc<Self>) {
        self.conn.close();
        self.finish();
    }

    /// Whether the session has ended.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn finish(self: &Arc<Self>) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            tracing::info!("Session {:?} ended", self.id());
            self.handler.on_disconnect(self);
        }
    }
}

struct PlayerEvents {
    session: Arc<GameSession>,
}

impl InboundHandler for PlayerEvents {
    fn on_packet(&self, _id: SessionId, packet: Packet, _encoded_size: usize) {
        self.session.handler.on_packet(&self.session, packet);
    }

    fn on_closed(&self, id: SessionId, cause: FrameError) {
        match cause {
            FrameError::ConnectionClosed => tracing::debug!("{id:?} hung up"),
            other => tracing::warn!("{id:?} transport error: {other}"),
        }
        self.session.conn.close();
        self.session.finish();
    }
}

/// Configuration for [`GameServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:8081`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions. Default: 256.
    pub max_connections: usize,
    /// How long a new connection has to send its cookie. Default: 10 s.
    pub upgrade_timeout: Duration,
    pub frame: FrameConfig,
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            max_connections: 256,
            upgrade_timeout: Duration::from_secs(10),
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

/// Live sessions by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<GameSession>>>,
}

impl SessionRegistry {
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<GameSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Snapshot of every live session.
    pub fn all(&self) -> Vec<Arc<GameSession>> {
        self.sessions.read().values().cloned().collect()
    }

    fn insert(&self, session: Arc<GameSession>) {
        self.sessions.write().insert(session.id(), session);
    }

    fn remove(&self, id: SessionId) -> Option<Arc<GameSession>> {
        self.sessions.write().remove(&id)
    }
}

/// Drops sessions from the registry as they end, then hands off to the game.
struct Tracked {
    registry: Arc<SessionRegistry>,
    game: Arc<dyn PlayerHandler>,
}

impl PlayerHandler for Tracked {
    fn on_packet(&self, session: &Arc<GameSession>, packet: Packet) {
        self.game.on_packet(session, packet);
    }

    fn on_disconnect(&self, session: &Arc<GameSession>) {
        self.registry.remove(session.id());
        self.game.on_disconnect(session);
    }
}

/// Accepts players and keeps track of their sessions.
pub struct GameServer {
    config: ServerConfig,
    resolver: Arc<dyn AccountResolver>,
    handler: Arc<dyn PlayerHandler>,
    sessions: Arc<SessionRegistry>,
    ids: Arc<IdGenerator>,
    shutdown_tx: watch::Sender<bool>,
}

impl GameServer {
    pub fn new(
        config: ServerConfig,
        resolver: Arc<dyn AccountResolver>,
        handler: Arc<dyn PlayerHandler>,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::default());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            resolver,
            handler: Arc::new(Tracked {
                registry: Arc::clone(&sessions),
                game: handler,
            }),
            sessions,
            ids: Arc::new(IdGenerator::new()),
            shutdown_tx,
        }
    }

    /// Live sessions.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = connector::bind_listener(self.config.bind_addr, &self.config.socket)?;
        tracing::info!("Game server listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop on a pre-bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    if self.sessions.len() >= self.config.max_connections {
                        tracing::warn!("Connection limit reached, rejecting {peer}");
                        continue;
                    }
                    if let Err(e) = connector::configure_stream(&stream, &self.config.socket) {
                        tracing::warn!("Failed to configure socket from {peer}: {e}");
                    }
                    tokio::spawn(Self::admit(
                        stream,
                        peer,
                        self.config.clone(),
                        Arc::clone(&self.resolver),
                        Arc::clone(&self.handler),
                        Arc::clone(&self.sessions),
                        Arc::clone(&self.ids),
                    ));
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("Game server shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn admit(
        mut stream: TcpStream,
        peer: SocketAddr,
        config: ServerConfig,
        resolver: Arc<dyn AccountResolver>,
        handler: Arc<dyn PlayerHandler>,
        sessions: Arc<SessionRegistry>,
        ids: Arc<IdGenerator>,
    ) {
        let cookie =
            match tokio::time::timeout(config.upgrade_timeout, codec::read_upgrade(&mut stream))
                .await
            {
                Ok(Ok(cookie)) => cookie,
                Ok(Err(e)) => {
                    tracing::warn!("Bad upgrade from {peer}: {e}");
                    return;
                }
                Err(_) => {
                    tracing::warn!("No upgrade from {peer} within {:?}", config.upgrade_timeout);
                    return;
                }
            };

        let Some(empire) = resolver.resolve(&cookie) else {
            tracing::warn!("Unknown cookie from {peer}, closing");
            return;
        };

        let identity = SessionIdentity { cookie, empire };
        let id = ids.next_id();
        match GameSession::accept(stream, id, identity, handler, config.frame).await {
            Ok(session) => {
                sessions.insert(Arc::clone(&session));
                // Lost the race with a fast hangup.
                if session.is_disconnected() {
                    sessions.remove(id);
                }
                tracing::info!("Accepted {id:?} from {peer}");
            }
            Err(e) => tracing::warn!("Failed to start session for {peer}: {e}"),
        }
    }

    /// Send `packet` to every live session. Returns how many sends succeeded.
    pub async fn broadcast(&self, packet: &Packet) -> usize {
        let mut delivered = 0;
        for session in self.sessions.all() {
            if session.send(packet).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        for session in self.sessions.all() {
            session.close();
        }
    }
}
