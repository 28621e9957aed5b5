//! Client connection lifecycle: login, socket, queue, backoff.
//!
//! [`ReconnectController`] owns the single authoritative connection state.
//! While no session is live, outgoing packets collect in an
//! [`OutboundQueue`]; once a session is up the queue is drained through the
//! session's writer, behind the `Hello`, before any later send gets the
//! writer. A lost transport swaps in a fresh queue and schedules a retry
//! with exponential backoff.
//!
//! ```text
//! DISCONNECTED --connect--> CONNECTING --ok--> CONNECTED
//!      ^  ^                    |   |              |
//!      |  +----- failure ------+   +-- rejected --+--> ERROR
//!      +------------- transport lost / disconnect ---+
//! ```
//!
//! Every attempt carries a generation number. `disconnect`, credential
//! changes and `shutdown` bump it, so a login or dial that finishes late
//! is recognised as stale and its transport closed.

use std::fmt::Display;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::auth::{
    Anonymous, AuthError, AuthHandshake, IdentityProvider, LoginStatus, LoginTransport,
    UreqLoginTransport,
};
use crate::backoff::{Backoff, ReconnectConfig};
use crate::codec::{self, FrameConfig, FrameError, MalformedPacket};
use crate::connector::{ConnectError, Connector, TcpConnector};
use crate::credentials::CredentialStore;
use crate::dispatch::{Direction, Dispatcher, PacketEvent};
use crate::packet::{Empire, HelloPacket, Packet};
use crate::queue::OutboundQueue;
use crate::session::{
    ConnectionSession, IdGenerator, InboundHandler, SessionError, SessionId, SessionWriter,
};
use crate::state::{ConnectionState, ServerStateEvent};

/// Resume markers the client sends in its `Hello`.
pub trait ResumeSource: Send + Sync + 'static {
    /// Last simulation time of the player's home star, if known.
    fn our_star_last_simulation(&self) -> Option<i64>;

    /// Timestamp of the newest chat message seen.
    fn last_chat_time(&self) -> Option<i64>;
}

/// [`ResumeSource`] for a client with no cached state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResume;

impl ResumeSource for NoResume {
    fn our_star_last_simulation(&self) -> Option<i64> {
        None
    }

    fn last_chat_time(&self) -> Option<i64> {
        None
    }
}

/// What happened to a packet handed to [`ReconnectController::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the live session.
    Sent { encoded_size: usize },
    /// Queued until the next session is live.
    Queued,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Either packets waiting for a session, or the session itself. Never both.
enum Link {
    Queued(OutboundQueue),
    Live(Arc<ConnectionSession>),
}

struct Shared {
    state: ConnectionState,
    link: Link,
    backoff: Backoff,
    generation: u64,
    shutdown: bool,
    /// Session most recently lost to a transport failure, if the link has not moved on since.
    last_lost: Option<SessionId>,
    url: String,
    login_status: Option<LoginStatus>,
    empire: Option<Empire>,
}

struct Inner {
    credentials: Arc<dyn CredentialStore>,
    auth: Arc<AuthHandshake>,
    connector: Arc<dyn Connector>,
    resume: Arc<dyn ResumeSource>,
    dispatcher: Arc<Dispatcher>,
    frame_config: FrameConfig,
    runtime: Handle,
    ids: IdGenerator,
    shared: Mutex<Shared>,
}

/// Builder for [`ReconnectController`].
pub struct ControllerBuilder {
    credentials: Arc<dyn CredentialStore>,
    dispatcher: Arc<Dispatcher>,
    login_transport: Arc<dyn LoginTransport>,
    identity: Arc<dyn IdentityProvider>,
    default_host: String,
    connector: Arc<dyn Connector>,
    resume: Arc<dyn ResumeSource>,
    reconnect: ReconnectConfig,
    frame: FrameConfig,
    runtime: Option<Handle>,
}

impl ControllerBuilder {
    /// HTTP client for the login POST. Default: [`UreqLoginTransport`].
    pub fn login_transport(mut self, transport: Arc<dyn LoginTransport>) -> Self {
        self.login_transport = transport;
        self
    }

    /// Identity token source. Default: [`Anonymous`].
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    /// Game host used when the login response names none. Default: `localhost`.
    pub fn default_host(mut self, host: impl Into<String>) -> Self {
        self.default_host = host.into();
        self
    }

    /// How game sockets are opened. Default: [`TcpConnector`].
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Resume markers for the `Hello`. Default: [`NoResume`].
    pub fn resume(mut self, resume: Arc<dyn ResumeSource>) -> Self {
        self.resume = resume;
        self
    }

    pub fn reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    pub fn frame_config(mut self, config: FrameConfig) -> Self {
        self.frame = config;
        self
    }

    /// Runtime that attempts and retries are spawned on. Default: the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the controller, in DISCONNECTED. Fails outside a tokio runtime
    /// unless [`runtime`](Self::runtime) was given.
    pub fn build(self) -> Result<ReconnectController, tokio::runtime::TryCurrentError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current()?,
        };
        let url = self.credentials.login_url();
        let auth = AuthHandshake::new(self.login_transport, self.identity, self.default_host);

        let inner = Arc::new(Inner {
            credentials: self.credentials,
            auth: Arc::new(auth),
            connector: self.connector,
            resume: self.resume,
            dispatcher: self.dispatcher,
            frame_config: self.frame,
            runtime,
            ids: IdGenerator::new(),
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                link: Link::Queued(OutboundQueue::new()),
                backoff: Backoff::new(self.reconnect),
                generation: 0,
                shutdown: false,
                last_lost: None,
                url,
                login_status: None,
                empire: None,
            }),
        });
        inner.publish(&inner.shared.lock());
        Ok(ReconnectController { inner })
    }
}

/// Keeps one game session alive for the client.
///
/// Dropping the controller shuts it down.
pub struct ReconnectController {
    inner: Arc<Inner>,
}

impl ReconnectController {
    /// Start building a controller around the player's credentials.
    ///
    /// Inbound packets and state transitions go to `dispatcher`.
    pub fn builder(
        credentials: Arc<dyn CredentialStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> ControllerBuilder {
        ControllerBuilder {
            credentials,
            dispatcher,
            login_transport: Arc::new(UreqLoginTransport::default()),
            identity: Arc::new(Anonymous),
            default_host: "localhost".to_string(),
            connector: Arc::new(TcpConnector::default()),
            resume: Arc::new(NoResume),
            reconnect: ReconnectConfig::default(),
            frame: FrameConfig::default(),
            runtime: None,
        }
    }

    /// Begin connecting, if there is a cookie and nothing is in flight.
    ///
    /// Without a cookie the controller stays DISCONNECTED and nothing is
    /// sent. Allowed from ERROR.
    pub fn connect(&self) {
        self.inner.begin(None);
    }

    /// Send a packet, or queue it if no session is live.
    ///
    /// A send that hits a failed transport tears the session down and lands
    /// the packet in the fresh queue. A packet over the frame limit is
    /// refused with [`SessionError::Encode`] and the session is left alone.
    pub async fn send(&self, packet: Packet) -> Result<Delivery, SessionError> {
        self.inner.send(packet).await
    }

    /// Drop the connection and any queued packets.
    ///
    /// Cancels an in-flight attempt. Unless the state is ERROR a reconnect is
    /// scheduled with the current backoff.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let mut shared = inner.shared.lock();
        if shared.shutdown {
            return;
        }
        inner.drop_link(&mut shared);
        if shared.state == ConnectionState::Error {
            return;
        }
        inner.transition(&mut shared, ConnectionState::Disconnected);
        inner.schedule_retry(&mut shared);
    }

    /// Stop for good: disconnect and cancel every pending retry.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut shared = inner.shared.lock();
        if shared.shutdown {
            return;
        }
        shared.shutdown = true;
        inner.drop_link(&mut shared);
        if shared.state != ConnectionState::Error {
            inner.transition(&mut shared, ConnectionState::Disconnected);
        }
        tracing::info!("Connection controller shut down");
    }

    /// Replace the cookie and reconnect with it. Lifts ERROR.
    pub fn update_cookie(&self, cookie: impl Into<String>) {
        let inner = &self.inner;
        {
            let mut shared = inner.shared.lock();
            // Under the lock, so a refused attempt cannot clear it afterwards.
            inner.credentials.set_cookie(cookie.into());
            if shared.shutdown {
                return;
            }
            inner.drop_link(&mut shared);
            shared.backoff.reset();
            inner.transition(&mut shared, ConnectionState::Disconnected);
        }
        inner.begin(None);
    }

    /// Point at a different login server.
    ///
    /// The cookie belongs to the old server, so it is cleared and the
    /// connection dropped rather than retried.
    pub fn update_endpoint(&self, url: impl Into<String>) {
        let url = url.into();
        let inner = &self.inner;
        let mut shared = inner.shared.lock();
        inner.credentials.set_login_url(url.clone());
        inner.credentials.clear_cookie();
        inner.drop_link(&mut shared);
        shared.url = url;
        shared.backoff.reset();
        inner.transition(&mut shared, ConnectionState::Disconnected);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Number of packets waiting for a session. Zero while connected.
    pub fn queued_len(&self) -> usize {
        match &self.inner.shared.lock().link {
            Link::Queued(queue) => queue.len(),
            Link::Live(_) => 0,
        }
    }

    /// The dispatcher inbound packets and state events go to.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }
}

impl Drop for ReconnectController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn publish(&self, shared: &Shared) {
        self.dispatcher.publish_connection_state(ServerStateEvent {
            url: shared.url.clone(),
            state: shared.state,
            login_status: shared.login_status,
            empire: shared.empire.clone(),
        });
    }

    fn transition(&self, shared: &mut Shared, state: ConnectionState) {
        shared.state = state;
        if state != ConnectionState::Connected {
            shared.empire = None;
        }
        if state != ConnectionState::Error && state != ConnectionState::Connected {
            shared.login_status = None;
        }
        self.publish(shared);
    }

    fn trace(&self, direction: Direction, packet: &Packet, encoded_size: usize) {
        self.dispatcher.publish_packet_event(PacketEvent {
            direction,
            kind: packet.kind(),
            encoded_size,
        });
    }

    /// Cancel in-flight attempts and replace the link with an empty queue.
    fn drop_link(&self, shared: &mut Shared) {
        shared.generation += 1;
        shared.last_lost = None;
        match std::mem::replace(&mut shared.link, Link::Queued(OutboundQueue::new())) {
            Link::Live(session) => session.close(),
            Link::Queued(queue) if !queue.is_empty() => {
                tracing::warn!("Discarding {} queued packets on disconnect", queue.len());
            }
            Link::Queued(_) => {}
        }
    }

    fn schedule_retry(self: &Arc<Self>, shared: &mut Shared) {
        if shared.shutdown {
            return;
        }
        let delay = shared.backoff.next_delay();
        let generation = shared.generation;
        tracing::info!(
            "Reconnecting in {delay:?} (attempt {})",
            shared.backoff.attempts()
        );

        let weak: Weak<Inner> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.begin(Some(generation));
            }
        });
    }

    /// Start an attempt. `retry_of` is the generation a scheduled retry was
    /// armed in; the retry is skipped if anything happened since.
    fn begin(self: &Arc<Self>, retry_of: Option<u64>) {
        let cookie = self.credentials.cookie().filter(|c| !c.is_empty());
        let url = self.credentials.login_url();

        let (generation, cookie) = {
            let mut shared = self.shared.lock();
            if shared.shutdown {
                return;
            }
            if let Some(armed) = retry_of
                && (armed != shared.generation || shared.state != ConnectionState::Disconnected)
            {
                tracing::trace!("Skipping stale retry");
                return;
            }
            match shared.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    tracing::debug!("Already {:?}, ignoring connect", shared.state);
                    return;
                }
                ConnectionState::Disconnected | ConnectionState::Error => {}
            }
            let Some(cookie) = cookie else {
                tracing::info!("No cookie yet, staying disconnected");
                return;
            };

            shared.generation += 1;
            shared.url = url.clone();
            self.transition(&mut shared, ConnectionState::Connecting);
            (shared.generation, cookie)
        };

        let this = Arc::clone(self);
        self.runtime
            .spawn(async move { this.attempt(generation, url, cookie).await });
    }

    fn is_current(&self, generation: u64) -> bool {
        let shared = self.shared.lock();
        shared.generation == generation && !shared.shutdown
    }

    async fn attempt(self: Arc<Self>, generation: u64, url: String, cookie: String) {
        let auth = Arc::clone(&self.auth);
        let login_cookie = cookie.clone();
        let login = tokio::task::spawn_blocking(move || auth.login(&url, &login_cookie)).await;
        let grant = match login {
            Ok(Ok(grant)) => grant,
            Ok(Err(e)) => return self.attempt_failed(generation, e.into()),
            Err(e) => {
                let e = AuthError::Transport(format!("login task failed: {e}"));
                return self.attempt_failed(generation, e.into());
            }
        };

        if !self.is_current(generation) {
            tracing::debug!("Login finished for a cancelled attempt, discarding");
            return;
        }

        let stream = match self.connector.connect(&grant.host, grant.port, &cookie).await {
            Ok(stream) => stream,
            Err(e) => return self.attempt_failed(generation, e.into()),
        };

        let id = self.ids.next_id();
        let (session, inbound) = ConnectionSession::split(stream, id, self.frame_config.clone());
        // Taken before the link goes live so the drain is ahead of every new send.
        let mut writer = session.writer().await;

        let queue = {
            let mut shared = self.shared.lock();
            if shared.generation != generation
                || shared.shutdown
                || shared.state != ConnectionState::Connecting
            {
                drop(shared);
                drop(writer);
                session.close();
                tracing::debug!("Socket opened for a cancelled attempt, closing");
                return;
            }
            // Live but still CONNECTING until the Hello is on the wire.
            let previous = std::mem::replace(&mut shared.link, Link::Live(Arc::clone(&session)));
            shared.last_lost = None;
            match previous {
                Link::Queued(queue) => queue,
                Link::Live(stale) => {
                    stale.close();
                    OutboundQueue::new()
                }
            }
        };

        inbound.spawn(Arc::new(SessionEvents {
            inner: Arc::downgrade(&self),
        }));

        let hello = Packet::Hello(HelloPacket {
            empire: None,
            empire_id: Some(grant.empire.id),
            our_star_last_simulation: self.resume.our_star_last_simulation(),
            last_chat_time: self.resume.last_chat_time(),
        });
        if let Err(e) = self.write(&mut writer, &hello).await {
            drop(writer);
            self.lose_session(id, &e, queue.drain().collect());
            return;
        }

        {
            let mut shared = self.shared.lock();
            let ours = matches!(&shared.link, Link::Live(live) if live.id() == id);
            if !ours || shared.generation != generation || shared.shutdown {
                drop(shared);
                drop(writer);
                // Requeued only if the session was lost rather than dropped.
                self.lose_session(id, &"session ended during handshake", queue.drain().collect());
                return;
            }
            shared.backoff.reset();
            shared.login_status = Some(grant.status);
            shared.empire = Some(grant.empire.clone());
            self.transition(&mut shared, ConnectionState::Connected);
        }

        let queued = queue.len();
        let mut pending = queue.drain();
        while let Some(packet) = pending.next() {
            match self.write(&mut writer, &packet).await {
                Ok(_) => {}
                Err(SessionError::Encode(e)) => {
                    tracing::error!("Dropping queued packet that does not encode: {e}");
                }
                Err(e) => {
                    let unsent: Vec<Packet> = std::iter::once(packet).chain(pending).collect();
                    tracing::warn!("Drain interrupted with {} packets unsent", unsent.len());
                    drop(writer);
                    self.lose_session(id, &e, unsent);
                    return;
                }
            }
        }
        tracing::info!(
            "Connected as empire {} ({}), flushed {queued} queued packets",
            grant.empire.id,
            grant.empire.display_name
        );
    }

    async fn write(&self, writer: &mut SessionWriter, packet: &Packet) -> Result<usize, SessionError> {
        let size = writer.send(packet).await?;
        self.trace(Direction::Sent, packet, size);
        Ok(size)
    }

    fn attempt_failed(self: &Arc<Self>, generation: u64, error: AttemptError) {
        let mut shared = self.shared.lock();
        if shared.generation != generation || shared.shutdown {
            tracing::debug!("Cancelled attempt failed: {error}");
            return;
        }

        match &error {
            AttemptError::Auth(AuthError::Rejected(status)) => {
                tracing::error!("Error logging in, got login status {status:?}; not retrying");
                shared.login_status = Some(*status);
                self.transition(&mut shared, ConnectionState::Error);
                return;
            }
            AttemptError::Auth(AuthError::CredentialInvalid { status }) => {
                tracing::warn!("Login server refused cookie (HTTP {status}), clearing it");
                // Under the lock, so a cookie from update_cookie is never clobbered.
                self.credentials.clear_cookie();
            }
            other => tracing::warn!("Error connecting, will try again: {other}"),
        }

        self.transition(&mut shared, ConnectionState::Disconnected);
        self.schedule_retry(&mut shared);
    }

    /// The transport under session `id` failed. `unsent` are packets that
    /// were already taken off a queue and must go back to its head.
    fn lose_session(self: &Arc<Self>, id: SessionId, cause: &dyn Display, unsent: Vec<Packet>) {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;

        let ours = matches!(&shared.link, Link::Live(session) if session.id() == id);
        if !ours {
            match &mut shared.link {
                Link::Queued(queue) if shared.last_lost == Some(id) => queue.requeue_front(unsent),
                _ if !unsent.is_empty() => {
                    tracing::warn!(
                        "Dropping {} packets from a superseded session: {cause}",
                        unsent.len()
                    );
                }
                _ => {}
            }
            return;
        }

        let mut queue = OutboundQueue::new();
        queue.requeue_front(unsent);
        if let Link::Live(session) = std::mem::replace(&mut shared.link, Link::Queued(queue)) {
            session.close();
        }
        shared.last_lost = Some(id);
        tracing::warn!("Connection lost: {cause}; will reconnect");
        self.transition(shared, ConnectionState::Disconnected);
        self.schedule_retry(shared);
    }

    async fn send(self: &Arc<Self>, packet: Packet) -> Result<Delivery, SessionError> {
        loop {
            let session = {
                let mut shared = self.shared.lock();
                match &mut shared.link {
                    Link::Queued(queue) => {
                        codec::encode_limited(&packet, &self.frame_config)?;
                        tracing::debug!("Not connected, queueing {:?}", packet.kind());
                        queue.push(packet);
                        return Ok(Delivery::Queued);
                    }
                    Link::Live(session) => Arc::clone(session),
                }
            };

            match session.send(&packet).await {
                Ok(encoded_size) => {
                    self.trace(Direction::Sent, &packet, encoded_size);
                    return Ok(Delivery::Sent { encoded_size });
                }
                Err(SessionError::Encode(e)) => return Err(SessionError::Encode(e)),
                Err(e) => self.lose_session(session.id(), &e, Vec::new()),
            }
        }
    }
}

/// Read-loop callbacks for the live session.
struct SessionEvents {
    inner: Weak<Inner>,
}

impl InboundHandler for SessionEvents {
    fn on_packet(&self, _session: SessionId, packet: Packet, encoded_size: usize) {
        if let Some(inner) = self.inner.upgrade() {
            inner.trace(Direction::Received, &packet, encoded_size);
            inner.dispatcher.dispatch(&packet);
        }
    }

    fn on_malformed(&self, session: SessionId, error: &MalformedPacket) {
        tracing::warn!("Dropped malformed packet from {session:?}: {error}");
    }

    fn on_closed(&self, session: SessionId, cause: FrameError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lose_session(session, &cause, Vec::new());
        }
    }
}
