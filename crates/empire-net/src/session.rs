//! One live transport: framed writer plus an asynchronous read loop.
//!
//! [`ConnectionSession`] owns the write half of a byte stream and hands out
//! an exclusive [`SessionWriter`] for sends. The read half becomes an
//! [`InboundStream`] whose loop decodes frames one at a time, in arrival
//! order, and reports each packet to an [`InboundHandler`]. The same type
//! backs the client's connection and the server's per-player session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;

use crate::codec::{
    self, EncodeError, FrameConfig, FrameError, LENGTH_PREFIX_SIZE, MalformedPacket,
};
use crate::packet::Packet;

/// A bidirectional byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Type-erased transport, so TCP sockets and in-memory pipes share one session type.
pub type BoxedTransport = Box<dyn Transport>;

type Reader = ReadHalf<BoxedTransport>;
type Writer = WriteHalf<BoxedTransport>;

/// Unique identifier for a session within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Atomic generator for monotonically increasing [`SessionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`SessionId`].
    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors returned by session sends.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was closed, or a previous write already failed.
    #[error("not connected")]
    NotConnected,

    /// Writing the frame failed.
    #[error("transport error: {0}")]
    Transport(#[from] FrameError),

    /// The packet could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Receives what the read loop produces.
///
/// Called from the read loop's task, one packet at a time. Implementations
/// must not block for long: the next frame is not read until they return.
pub trait InboundHandler: Send + Sync + 'static {
    /// A frame decoded to `packet`. `encoded_size` includes the length prefix.
    fn on_packet(&self, session: SessionId, packet: Packet, encoded_size: usize);

    /// A frame arrived that does not decode. The loop keeps reading.
    fn on_malformed(&self, session: SessionId, error: &MalformedPacket) {
        tracing::warn!("Session {session:?} dropped malformed packet: {error}");
    }

    /// The transport failed or the peer hung up. Not called after [`ConnectionSession::close`].
    fn on_closed(&self, session: SessionId, cause: FrameError);
}

/// Owner of one live transport.
pub struct ConnectionSession {
    id: SessionId,
    config: FrameConfig,
    writer: Arc<Mutex<Option<Writer>>>,
    closed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

/// The read half of a session, not yet being read.
pub struct InboundStream {
    id: SessionId,
    reader: Reader,
    config: FrameConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectionSession {
    /// Bind a transport without starting the read loop.
    ///
    /// Use this when something must be written before any inbound data is
    /// processed; call [`InboundStream::spawn`] afterwards.
    pub fn split<T: Transport>(
        stream: T,
        id: SessionId,
        config: FrameConfig,
    ) -> (Arc<Self>, InboundStream) {
        let boxed: BoxedTransport = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            config: config.clone(),
            writer: Arc::new(Mutex::new(Some(writer))),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        });
        let inbound = InboundStream {
            id,
            reader,
            config,
            shutdown_rx,
        };
        (session, inbound)
    }

    /// Bind a transport and start reading from it immediately.
    pub fn open<T: Transport>(
        stream: T,
        id: SessionId,
        config: FrameConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Arc<Self> {
        let (session, inbound) = Self::split(stream, id, config);
        inbound.spawn(handler);
        session
    }

    /// This session's identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take exclusive use of the writer.
    ///
    /// Waiters are served in order, so packets written through one guard are
    /// never interleaved with packets from other senders.
    pub async fn writer(&self) -> SessionWriter {
        SessionWriter {
            id: self.id,
            guard: Arc::clone(&self.writer).lock_owned().await,
            config: self.config.clone(),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Encode and write one packet. Returns the encoded frame size.
    pub async fn send(&self, packet: &Packet) -> Result<usize, SessionError> {
        self.writer().await.send(packet).await
    }

    /// Close the transport. Idempotent and safe from any thread.
    ///
    /// Stops the read loop without reporting `on_closed`. If a write is in
    /// flight the write half is released when that writer guard drops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        tracing::debug!("Session {:?} closed", self.id);
    }
}

impl InboundStream {
    /// Start the read loop on the current runtime.
    pub fn spawn(self, handler: Arc<dyn InboundHandler>) -> JoinHandle<()> {
        tokio::spawn(self.run(handler))
    }

    async fn run(self, handler: Arc<dyn InboundHandler>) {
        let InboundStream {
            id,
            mut reader,
            config,
            mut shutdown_rx,
        } = self;

        loop {
            tokio::select! {
                result = codec::read_frame(&mut reader, &config) => {
                    match result {
                        Ok(payload) => match codec::decode_payload(&payload) {
                            Ok(packet) => {
                                let size = payload.len() + LENGTH_PREFIX_SIZE;
                                tracing::debug!("<< {:?} {:?} ({size} bytes)", id, packet.kind());
                                handler.on_packet(id, packet, size);
                            }
                            Err(e) => handler.on_malformed(id, &e),
                        },
                        Err(e) => {
                            if !*shutdown_rx.borrow() {
                                handler.on_closed(id, e);
                            }
                            break;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::trace!("Session {id:?} read loop exited");
    }
}

/// Exclusive handle on a session's writer. See [`ConnectionSession::writer`].
pub struct SessionWriter {
    id: SessionId,
    guard: OwnedMutexGuard<Option<Writer>>,
    config: FrameConfig,
    closed: Arc<AtomicBool>,
}

impl SessionWriter {
    /// Encode and write one packet. Returns the encoded frame size.
    ///
    /// A packet that does not encode (or is over the payload limit) fails
    /// with [`SessionError::Encode`] and leaves the session usable. A failed
    /// write releases the transport; later sends on this session return
    /// [`SessionError::NotConnected`].
    pub async fn send(&mut self, packet: &Packet) -> Result<usize, SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::NotConnected);
        }
        let writer = self.guard.as_mut().ok_or(SessionError::NotConnected)?;
        // Refused before any byte is written, so the stream stays usable.
        let payload = codec::encode_limited(packet, &self.config)?;

        if let Err(e) = codec::write_frame(writer, &payload, &self.config).await {
            self.guard.take();
            return Err(e.into());
        }

        let size = payload.len() + LENGTH_PREFIX_SIZE;
        tracing::debug!(">> {:?} {:?} ({size} bytes)", self.id, packet.kind());
        Ok(size)
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            self.guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, duplex};
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Event {
        Packet(Packet),
        Malformed,
        Closed,
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl InboundHandler for Recorder {
        fn on_packet(&self, _session: SessionId, packet: Packet, _encoded_size: usize) {
            let _ = self.tx.send(Event::Packet(packet));
        }

        fn on_malformed(&self, _session: SessionId, _error: &MalformedPacket) {
            let _ = self.tx.send(Event::Malformed);
        }

        fn on_closed(&self, _session: SessionId, _cause: FrameError) {
            let _ = self.tx.send(Event::Closed);
        }
    }

    fn recorder() -> (Arc<dyn InboundHandler>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx }), rx)
    }

    fn pkt(id: i64) -> Packet {
        Packet::RequestEmpire(RequestEmpirePacket {
            empire_ids: vec![id],
        })
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_send_writes_decodable_frame() {
        let (local, mut remote) = duplex(8192);
        let (handler, _rx) = recorder();
        let session = ConnectionSession::open(local, SessionId(1), FrameConfig::default(), handler);

        let size = session.send(&pkt(7)).await.unwrap();
        let payload = codec::read_frame(&mut remote, &FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(size, payload.len() + LENGTH_PREFIX_SIZE);
        assert_eq!(codec::decode_payload(&payload).unwrap(), pkt(7));
    }

    #[tokio::test]
    async fn test_inbound_packets_arrive_in_order() {
        let (local, mut remote) = duplex(8192);
        let (handler, mut rx) = recorder();
        let _session = ConnectionSession::open(local, SessionId(1), FrameConfig::default(), handler);

        for id in 1..=3 {
            remote.write_all(&codec::encode(&pkt(id)).unwrap()).await.unwrap();
        }

        for id in 1..=3 {
            match next_event(&mut rx).await {
                Event::Packet(p) => assert_eq!(p, pkt(id)),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_read_loop_survives_malformed_frame() {
        let (local, mut remote) = duplex(8192);
        let (handler, mut rx) = recorder();
        let _session = ConnectionSession::open(local, SessionId(1), FrameConfig::default(), handler);

        let truncated = codec::encode_payload(&Packet::StarUpdated(StarUpdatedPacket {
            stars: vec![Star {
                id: 1,
                name: "Vega".to_string(),
                sector_x: 0,
                sector_y: 0,
                offset_x: 1.0,
                offset_y: 2.0,
                last_simulation: None,
            }],
        }))
        .unwrap();
        let config = FrameConfig::default();
        codec::write_frame(&mut remote, &truncated[..truncated.len() - 6], &config)
            .await
            .unwrap();
        remote.write_all(&codec::encode(&pkt(2)).unwrap()).await.unwrap();

        assert!(matches!(next_event(&mut rx).await, Event::Malformed));
        match next_event(&mut rx).await {
            Event::Packet(p) => assert_eq!(p, pkt(2)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_hangup_reports_closed() {
        let (local, remote) = duplex(8192);
        let (handler, mut rx) = recorder();
        let _session = ConnectionSession::open(local, SessionId(1), FrameConfig::default(), handler);

        drop(remote);
        assert!(matches!(next_event(&mut rx).await, Event::Closed));
    }

    #[tokio::test]
    async fn test_oversized_send_leaves_session_usable() {
        let (local, mut remote) = duplex(8192);
        let (handler, _rx) = recorder();
        let config = FrameConfig {
            max_payload_size: 16,
        };
        let session = ConnectionSession::open(local, SessionId(1), config, handler);

        let big = Packet::RequestEmpire(RequestEmpirePacket {
            empire_ids: (0..64).collect(),
        });
        assert!(matches!(
            session.send(&big).await,
            Err(SessionError::Encode(EncodeError::TooLarge { .. }))
        ));

        session.send(&pkt(3)).await.unwrap();
        let payload = codec::read_frame(&mut remote, &FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(codec::decode_payload(&payload).unwrap(), pkt(3));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let (local, _remote) = duplex(8192);
        let (handler, _rx) = recorder();
        let session = ConnectionSession::open(local, SessionId(1), FrameConfig::default(), handler);

        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(matches!(
            session.send(&pkt(1)).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_local_close_does_not_report_closed() {
        let (local, _remote) = duplex(8192);
        let (handler, mut rx) = recorder();
        let session = ConnectionSession::open(local, SessionId(1), FrameConfig::default(), handler);

        session.close();
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(result, Ok(Some(Event::Closed))));
    }

    #[tokio::test]
    async fn test_writer_guard_keeps_batches_contiguous() {
        let (local, mut remote) = duplex(64 * 1024);
        let (handler, _rx) = recorder();
        let session = ConnectionSession::open(local, SessionId(1), FrameConfig::default(), handler);

        let mut guard = session.writer().await;
        let late = Arc::clone(&session);
        let late_send = tokio::spawn(async move { late.send(&pkt(3)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        guard.send(&pkt(1)).await.unwrap();
        guard.send(&pkt(2)).await.unwrap();
        drop(guard);
        late_send.await.unwrap().unwrap();

        let config = FrameConfig::default();
        for id in 1..=3 {
            let payload = codec::read_frame(&mut remote, &config).await.unwrap();
            assert_eq!(codec::decode_payload(&payload).unwrap(), pkt(id));
        }
    }

    #[tokio::test]
    async fn test_split_defers_reading_until_spawned() {
        let (local, mut remote) = duplex(8192);
        let (session, inbound) = ConnectionSession::split(local, SessionId(4), FrameConfig::default());
        assert_eq!(session.id(), SessionId(4));

        remote.write_all(&codec::encode(&pkt(9)).unwrap()).await.unwrap();
        session.send(&pkt(1)).await.unwrap();

        let (handler, mut rx) = recorder();
        inbound.spawn(handler);
        match next_event(&mut rx).await {
            Event::Packet(p) => assert_eq!(p, pkt(9)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_session_id_uniqueness() {
        let ids = IdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert_eq!(a.0 + 1, b.0);
    }
}
