//! Packet codec and length-prefixed framing.
//!
//! Every packet on the wire is one frame:
//!
//! ```text
//! +-------------------+-----------+---------+---------------------+
//! | length (4 bytes)  | version   | tag     | body                |
//! | u32 little-endian | u8        | u8      | postcard, variant's |
//! |                   |           |         | payload struct      |
//! +-------------------+-----------+---------+---------------------+
//! ```
//!
//! The length covers everything after the prefix. Because frames are
//! length-prefixed, a payload that fails to decode leaves the stream aligned
//! on the next frame, so readers report [`MalformedPacket`] and keep going.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::packet::{Packet, PacketKind};

/// Current wire-protocol version. First byte of every payload.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest cookie accepted in the upgrade preamble.
pub const MAX_UPGRADE_SIZE: u32 = 4096;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while moving frames over a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame or payload that does not decode to a [`Packet`].
#[derive(Debug, thiserror::Error)]
pub enum MalformedPacket {
    /// Fewer bytes than the length prefix announces.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the frame should contain.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// The payload has no version byte.
    #[error("empty payload")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The tag byte is not a known [`PacketKind`].
    #[error("unrecognized packet tag: {0}")]
    UnknownVariant(u8),

    /// The body ended before the payload struct was complete.
    #[error("truncated {0:?} body")]
    TruncatedBody(PacketKind),

    /// The body decoded but bytes were left over.
    #[error("{trailing} trailing bytes after {kind:?} body")]
    TrailingBytes {
        /// Kind that was decoded.
        kind: PacketKind,
        /// Number of unread bytes.
        trailing: usize,
    },

    /// The body is not a valid payload struct.
    #[error("invalid {kind:?} body: {source}")]
    Body {
        /// Kind named by the tag.
        kind: PacketKind,
        /// Postcard failure.
        #[source]
        source: postcard::Error,
    },
}

/// A packet that cannot be put on the wire. Nothing was written, so the
/// stream is still usable.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// Serialization failed. Not expected for in-memory packets.
    #[error("failed to encode {kind:?}: {source}")]
    Serialize {
        /// Kind being encoded.
        kind: PacketKind,
        /// Postcard failure.
        #[source]
        source: postcard::Error,
    },

    /// The encoded payload is larger than the peer will accept.
    #[error("{kind:?} payload of {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Kind being encoded.
        kind: PacketKind,
        /// Encoded payload size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },
}

/// Errors reading the transport upgrade preamble.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    /// Framing failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// The cookie is not UTF-8.
    #[error("upgrade cookie is not valid UTF-8")]
    NotUtf8,
    /// The cookie is empty.
    #[error("upgrade cookie is empty")]
    EmptyCookie,
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

fn encode_body<T: Serialize>(kind: PacketKind, body: &T) -> Result<Vec<u8>, EncodeError> {
    let encoded = postcard::to_allocvec(body).map_err(|source| EncodeError::Serialize { kind, source })?;
    let mut out = Vec::with_capacity(2 + encoded.len());
    out.push(PROTOCOL_VERSION);
    out.push(kind.tag());
    out.extend_from_slice(&encoded);
    Ok(out)
}

/// Serialize a [`Packet`] into a payload (no length prefix).
pub fn encode_payload(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let kind = packet.kind();
    match packet {
        Packet::Hello(p) => encode_body(kind, p),
        Packet::WatchSectors(p) => encode_body(kind, p),
        Packet::StarUpdated(p) => encode_body(kind, p),
        Packet::ModifyStar(p) => encode_body(kind, p),
        Packet::ChatMessages(p) => encode_body(kind, p),
        Packet::RequestEmpire(p) => encode_body(kind, p),
        Packet::EmpireDetails(p) => encode_body(kind, p),
    }
}

/// [`encode_payload`], refusing payloads over `config.max_payload_size`.
pub fn encode_limited(packet: &Packet, config: &FrameConfig) -> Result<Vec<u8>, EncodeError> {
    let payload = encode_payload(packet)?;
    if payload.len() > config.max_payload_size as usize {
        return Err(EncodeError::TooLarge {
            kind: packet.kind(),
            size: payload.len(),
            max: config.max_payload_size,
        });
    }
    Ok(payload)
}

/// Serialize a [`Packet`] into a complete frame, length prefix included.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let payload = encode_payload(packet)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_body<T: DeserializeOwned>(kind: PacketKind, body: &[u8]) -> Result<T, MalformedPacket> {
    match postcard::take_from_bytes::<T>(body) {
        Ok((value, [])) => Ok(value),
        Ok((_, rest)) => Err(MalformedPacket::TrailingBytes {
            kind,
            trailing: rest.len(),
        }),
        Err(postcard::Error::DeserializeUnexpectedEnd) => Err(MalformedPacket::TruncatedBody(kind)),
        Err(source) => Err(MalformedPacket::Body { kind, source }),
    }
}

/// Deserialize a payload (no length prefix) into a [`Packet`].
pub fn decode_payload(data: &[u8]) -> Result<Packet, MalformedPacket> {
    let (&version, rest) = data.split_first().ok_or(MalformedPacket::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MalformedPacket::UnsupportedVersion(version));
    }

    let (&tag, body) = rest.split_first().ok_or(MalformedPacket::Truncated {
        expected: 2,
        actual: data.len(),
    })?;
    let kind = PacketKind::from_tag(tag).ok_or(MalformedPacket::UnknownVariant(tag))?;

    let packet = match kind {
        PacketKind::Hello => Packet::Hello(decode_body(kind, body)?),
        PacketKind::WatchSectors => Packet::WatchSectors(decode_body(kind, body)?),
        PacketKind::StarUpdated => Packet::StarUpdated(decode_body(kind, body)?),
        PacketKind::ModifyStar => Packet::ModifyStar(decode_body(kind, body)?),
        PacketKind::ChatMessages => Packet::ChatMessages(decode_body(kind, body)?),
        PacketKind::RequestEmpire => Packet::RequestEmpire(decode_body(kind, body)?),
        PacketKind::EmpireDetails => Packet::EmpireDetails(decode_body(kind, body)?),
    };
    Ok(packet)
}

/// Deserialize a complete frame produced by [`encode`].
pub fn decode(frame: &[u8]) -> Result<Packet, MalformedPacket> {
    if frame.len() < LENGTH_PREFIX_SIZE {
        return Err(MalformedPacket::Truncated {
            expected: LENGTH_PREFIX_SIZE,
            actual: frame.len(),
        });
    }

    let (prefix, payload) = frame.split_at(LENGTH_PREFIX_SIZE);
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    len_buf.copy_from_slice(prefix);
    let expected = u32::from_le_bytes(len_buf) as usize;

    if payload.len() < expected {
        return Err(MalformedPacket::Truncated {
            expected: LENGTH_PREFIX_SIZE + expected,
            actual: frame.len(),
        });
    }
    if payload.len() > expected {
        return Err(MalformedPacket::TrailingBytes {
            kind: decode_payload(&payload[..expected])?.kind(),
            trailing: payload.len() - expected,
        });
    }

    decode_payload(payload)
}

// ---------------------------------------------------------------------------
// Stream framing
// ---------------------------------------------------------------------------

/// Read a single length-prefixed frame from the stream.
///
/// Returns the payload bytes. Returns [`FrameError::ConnectionClosed`] if the
/// peer closes the connection before the frame is complete.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let payload_len = u32::from_le_bytes(len_buf);
    if payload_len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(e)
            }
        })?;
    }

    Ok(payload)
}

/// Write a single length-prefixed frame to the stream and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = payload.len() as u32;
    if len > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: config.max_payload_size,
        });
    }

    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Write the upgrade preamble: the session cookie as a raw frame.
pub async fn write_upgrade<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    cookie: &str,
) -> Result<(), FrameError> {
    let config = FrameConfig {
        max_payload_size: MAX_UPGRADE_SIZE,
    };
    write_frame(writer, cookie.as_bytes(), &config).await
}

/// Read the upgrade preamble written by [`write_upgrade`].
pub async fn read_upgrade<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<String, UpgradeError> {
    let config = FrameConfig {
        max_payload_size: MAX_UPGRADE_SIZE,
    };
    let payload = read_frame(reader, &config).await?;
    let cookie = String::from_utf8(payload).map_err(|_| UpgradeError::NotUtf8)?;
    if cookie.is_empty() {
        return Err(UpgradeError::EmptyCookie);
    }
    Ok(cookie)
}
