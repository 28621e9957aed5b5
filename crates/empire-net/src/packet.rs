//! Packet types exchanged over the game socket.
//!
//! [`Packet`] is a tagged union: exactly one payload struct is carried per
//! packet, and [`PacketKind`] names which one. The one-byte tag returned by
//! [`PacketKind::tag`] is what goes on the wire; see [`crate::codec`].

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// One self-contained protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // --- Session ---
    /// Greeting. Sent by the server with the player's empire, and by the
    /// client with its resume markers.
    Hello(HelloPacket),

    // --- Starfield ---
    /// Client asks to be kept up to date on a rectangle of sectors.
    WatchSectors(WatchSectorsPacket),
    /// Server pushes stars that changed (or that the client has not seen).
    StarUpdated(StarUpdatedPacket),
    /// Client asks the server to apply changes to a star.
    ModifyStar(ModifyStarPacket),

    // --- Empires and chat ---
    /// Chat messages, in either direction.
    ChatMessages(ChatMessagesPacket),
    /// Client asks for details of one or more empires.
    RequestEmpire(RequestEmpirePacket),
    /// Server answers a [`RequestEmpirePacket`].
    EmpireDetails(EmpireDetailsPacket),
}

/// Discriminant of a [`Packet`], used as the wire tag and the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// [`Packet::Hello`].
    Hello,
    /// [`Packet::WatchSectors`].
    WatchSectors,
    /// [`Packet::StarUpdated`].
    StarUpdated,
    /// [`Packet::ModifyStar`].
    ModifyStar,
    /// [`Packet::ChatMessages`].
    ChatMessages,
    /// [`Packet::RequestEmpire`].
    RequestEmpire,
    /// [`Packet::EmpireDetails`].
    EmpireDetails,
}

impl PacketKind {
    /// Every kind, in tag order.
    pub const ALL: [PacketKind; 7] = [
        PacketKind::Hello,
        PacketKind::WatchSectors,
        PacketKind::StarUpdated,
        PacketKind::ModifyStar,
        PacketKind::ChatMessages,
        PacketKind::RequestEmpire,
        PacketKind::EmpireDetails,
    ];

    /// Wire tag for this kind. Tags are stable; new kinds append.
    pub fn tag(self) -> u8 {
        match self {
            PacketKind::Hello => 1,
            PacketKind::WatchSectors => 2,
            PacketKind::StarUpdated => 3,
            PacketKind::ModifyStar => 4,
            PacketKind::ChatMessages => 5,
            PacketKind::RequestEmpire => 6,
            PacketKind::EmpireDetails => 7,
        }
    }

    /// Inverse of [`PacketKind::tag`]. `None` for unrecognized tags.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl Packet {
    /// Extract the kind of a packet without consuming it.
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Hello(_) => PacketKind::Hello,
            Packet::WatchSectors(_) => PacketKind::WatchSectors,
            Packet::StarUpdated(_) => PacketKind::StarUpdated,
            Packet::ModifyStar(_) => PacketKind::ModifyStar,
            Packet::ChatMessages(_) => PacketKind::ChatMessages,
            Packet::RequestEmpire(_) => PacketKind::RequestEmpire,
            Packet::EmpireDetails(_) => PacketKind::EmpireDetails,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared domain records
// ---------------------------------------------------------------------------

/// A star, as much of it as the session layer needs to carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Star {
    /// Star identifier.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Sector X coordinate.
    pub sector_x: i64,
    /// Sector Y coordinate.
    pub sector_y: i64,
    /// Offset within the sector, X (0..1024).
    pub offset_x: f32,
    /// Offset within the sector, Y (0..1024).
    pub offset_y: f32,
    /// Last time the server simulated this star (ms since epoch).
    pub last_simulation: Option<i64>,
}

/// A player's empire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Empire {
    /// Empire identifier.
    pub id: i64,
    /// Display name.
    pub display_name: String,
    /// The empire's home star, if it still has one.
    pub home_star: Option<Star>,
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Session greeting.
///
/// Server → client: `empire` is set. Client → server: `empire_id` plus the
/// resume markers, so the server can send a delta instead of a full resync.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HelloPacket {
    /// The player's empire (server → client).
    pub empire: Option<Empire>,
    /// The empire the client logged in as (client → server).
    pub empire_id: Option<i64>,
    /// Last simulation time of the client's home star, if known.
    pub our_star_last_simulation: Option<i64>,
    /// Timestamp of the newest chat message the client has seen.
    pub last_chat_time: Option<i64>,
}

/// Sector rectangle the client wants updates for (inclusive bounds).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchSectorsPacket {
    /// Leftmost sector X.
    pub left: i64,
    /// Topmost sector Y.
    pub top: i64,
    /// Rightmost sector X.
    pub right: i64,
    /// Bottommost sector Y.
    pub bottom: i64,
}

/// Batch of updated stars.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StarUpdatedPacket {
    /// Stars in their new state.
    pub stars: Vec<Star>,
}

/// What a [`StarModification`] does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModificationKind {
    /// Colonize a planet.
    Colonize,
    /// Queue a build on a colony.
    AddBuildRequest,
    /// Create a fleet at the star.
    CreateFleet,
}

/// One change to apply to a star.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StarModification {
    /// What kind of change.
    pub kind: ModificationKind,
    /// Planet index, where relevant.
    pub planet_index: Option<u32>,
    /// Design identifier for builds and fleets.
    pub design_id: Option<String>,
    /// Number of units.
    pub count: u32,
}

/// Request to modify a star.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModifyStarPacket {
    /// Star to modify.
    pub star_id: i64,
    /// Empire making the request.
    pub empire_id: i64,
    /// Changes, applied in order.
    pub modifications: Vec<StarModification>,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// Message identifier (0 for client-originated messages).
    pub id: i64,
    /// Sending empire; `None` for system messages.
    pub empire_id: Option<i64>,
    /// When the message was posted (ms since epoch).
    pub date_posted: i64,
    /// Message text.
    pub message: String,
}

/// Batch of chat messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatMessagesPacket {
    /// Messages, oldest first.
    pub messages: Vec<ChatMessage>,
}

/// Request for empire details.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestEmpirePacket {
    /// Empires to look up.
    pub empire_ids: Vec<i64>,
}

/// Empire details.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmpireDetailsPacket {
    /// The requested empires that exist.
    pub empires: Vec<Empire>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique_and_nonzero() {
        let mut tags: Vec<u8> = PacketKind::ALL.iter().map(|k| k.tag()).collect();
        assert!(tags.iter().all(|&t| t != 0));
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), PacketKind::ALL.len());
    }

    #[test]
    fn test_from_tag_inverts_tag() {
        for kind in PacketKind::ALL {
            assert_eq!(PacketKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(PacketKind::from_tag(0), None);
        assert_eq!(PacketKind::from_tag(200), None);
    }

    #[test]
    fn test_kind_extraction() {
        assert_eq!(
            Packet::Hello(HelloPacket::default()).kind(),
            PacketKind::Hello
        );
        assert_eq!(
            Packet::WatchSectors(WatchSectorsPacket {
                left: -1,
                top: -1,
                right: 1,
                bottom: 1,
            })
            .kind(),
            PacketKind::WatchSectors
        );
        assert_eq!(
            Packet::EmpireDetails(EmpireDetailsPacket::default()).kind(),
            PacketKind::EmpireDetails
        );
    }
}
