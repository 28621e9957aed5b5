//! Packet dispatch: route decoded packets to the handlers registered for their kind.
//!
//! Handlers are closures keyed by [`PacketKind`]. Several handlers may share a
//! kind; they run in registration order. A handler that fails or panics is
//! logged and skipped, so one broken consumer cannot starve the others or
//! kill the read loop that feeds the dispatcher.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};

use crate::packet::{Packet, PacketKind};
use crate::state::{ConnectionState, ConnectionStateWatch, ServerStateEvent};

/// Error a handler may return. Logged by the dispatcher.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&Packet) -> Result<(), HandlerError> + Send + Sync>;

/// Token returned by [`Dispatcher::register_handler`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Which way a traced packet went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Written to the transport.
    Sent,
    /// Read from the transport.
    Received,
}

/// Trace record for one packet crossing the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEvent {
    /// Direction of travel.
    pub direction: Direction,
    /// Kind of packet.
    pub kind: PacketKind,
    /// Frame size on the wire, length prefix included.
    pub encoded_size: usize,
}

const PACKET_EVENT_CAPACITY: usize = 256;

/// Routes packets to registered handlers and publishes connection state.
pub struct Dispatcher {
    handlers: RwLock<HashMap<PacketKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
    state: ConnectionStateWatch,
    packet_events: broadcast::Sender<PacketEvent>,
}

impl Dispatcher {
    /// Create a dispatcher with no handlers, in the disconnected state.
    pub fn new() -> Self {
        let (packet_events, _) = broadcast::channel(PACKET_EVENT_CAPACITY);
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: ConnectionStateWatch::new(),
            packet_events,
        }
    }

    /// Register a handler for one packet kind.
    pub fn register_handler<F>(&self, kind: PacketKind, handler: F) -> HandlerId
    where
        F: Fn(&Packet) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered for `kind`.
    pub fn unregister_handler(&self, kind: PacketKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: PacketKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Run every handler registered for the packet's kind, in registration order.
    ///
    /// Returns the number of handlers invoked. The registry lock is not held
    /// while handlers run, so handlers may register or unregister.
    pub fn dispatch(&self, packet: &Packet) -> usize {
        let kind = packet.kind();
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!("No handler registered for {kind:?}, dropping packet");
            return 0;
        }

        for handler in &handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(packet))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Handler for {kind:?} failed: {e}"),
                Err(_) => tracing::error!("Handler for {kind:?} panicked"),
            }
        }
        handlers.len()
    }

    /// Publish a connection state transition to all observers.
    pub fn publish_connection_state(&self, event: ServerStateEvent) {
        tracing::info!("Connection state: {:?} ({})", event.state, event.url);
        self.state.set(event);
    }

    /// Observe connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ServerStateEvent> {
        self.state.subscribe()
    }

    /// Latest published state event.
    pub fn current_state(&self) -> ServerStateEvent {
        self.state.current()
    }

    /// Latest published state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Publish a packet trace record. Dropped if nobody is listening.
    pub fn publish_packet_event(&self, event: PacketEvent) {
        let _ = self.packet_events.send(event);
    }

    /// Observe packet trace records.
    pub fn subscribe_packets(&self) -> broadcast::Receiver<PacketEvent> {
        self.packet_events.subscribe()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
