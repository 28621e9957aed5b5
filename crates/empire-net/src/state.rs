//! Observable connection state.

use tokio::sync::watch;

use crate::auth::LoginStatus;
use crate::packet::Empire;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport, and no attempt in flight.
    Disconnected,
    /// Logging in or opening the socket.
    Connecting,
    /// Session live, queue drained.
    Connected,
    /// The server rejected the login. No automatic retry.
    Error,
}

/// Snapshot published on every state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStateEvent {
    /// Login endpoint the state refers to.
    pub url: String,
    /// The new state.
    pub state: ConnectionState,
    /// Login status of the latest login response, if there was one.
    pub login_status: Option<LoginStatus>,
    /// The player's empire, once connected.
    pub empire: Option<Empire>,
}

impl ServerStateEvent {
    /// A bare event with no login details.
    pub fn new(url: impl Into<String>, state: ConnectionState) -> Self {
        Self {
            url: url.into(),
            state,
            login_status: None,
            empire: None,
        }
    }
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ServerStateEvent>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ServerStateEvent::new("", ConnectionState::Disconnected));
        Self { tx }
    }

    /// Publish a new event, notifying all subscribers.
    pub fn set(&self, event: ServerStateEvent) {
        self.tx.send_replace(event);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ServerStateEvent> {
        self.tx.subscribe()
    }

    /// Return the latest event without blocking.
    pub fn current(&self) -> ServerStateEvent {
        self.tx.borrow().clone()
    }

    /// Return the latest state without blocking.
    pub fn state(&self) -> ConnectionState {
        self.tx.borrow().state
    }
}
