//! Message type space, player addressing, and control payload records.
//!
//! Type tags live in two disjoint, append-only ranges. Each range is bounded by
//! a MIN and a MAX sentinel that are never valid payload types. New types are
//! only ever added directly before the relevant MAX sentinel.

use std::fmt;

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, MAX_PAYLOAD_SIZE};
use crate::error::LobbyError;
use crate::file_transfer::{FileFault, FileType};
use crate::gamestruct::GameStruct;

/// Lower sentinel of the net range (never a valid type).
pub const NET_MIN_TYPE: u8 = 33;
/// Upper sentinel of the net range (never a valid type).
pub const NET_MAX_TYPE: u8 = 63;
/// Lower sentinel of the game range (never a valid type).
pub const GAME_MIN_TYPE: u8 = 111;
/// Upper sentinel of the game range (never a valid type).
pub const GAME_MAX_TYPE: u8 = 137;

/// Destination byte meaning "every player".
pub const NET_ALL_PLAYERS: u8 = 255;
/// Destination byte meaning "the host only".
pub const NET_HOST_ONLY: u8 = 0;

/// Maximum number of player slots in one session.
pub const MAX_CONNECTED_PLAYERS: usize = 8;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Control, lifecycle and file-transfer messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NetMessageType {
    /// Heartbeat ping / reply.
    Ping = 34,
    /// Player statistics.
    PlayerStats = 35,
    /// Chat text between machines.
    TextMsg = 36,
    /// The sending machine is now in the game.
    PlayerResponding = 37,
    /// Session options sent to a freshly accepted player.
    Options = 38,
    /// Kick notice.
    Kick = 39,
    /// Campaign start shortcut.
    FireUp = 40,
    /// Colour change request.
    ColourRequest = 41,
    /// Chat between AIs.
    AiTextMsg = 42,
    /// Beacon placement.
    BeaconMsg = 43,
    /// Team membership request.
    TeamRequest = 44,
    /// Join request.
    Join = 45,
    /// Join accepted.
    Accepted = 46,
    /// Roster record for one player.
    PlayerInfo = 47,
    /// A player joined.
    PlayerJoined = 48,
    /// A player is leaving cleanly.
    PlayerLeaving = 49,
    /// A player dropped.
    PlayerDropped = 50,
    /// The four user game flags.
    GameFlags = 51,
    /// Player ready toggle.
    ReadyRequest = 52,
    /// Join rejected.
    Rejected = 53,
    /// Lobby list position request.
    PositionRequest = 54,
    /// Data integrity check.
    DataCheck = 55,
    /// The host has dropped.
    HostDropped = 56,
    /// Relay request: the payload is an envelope for another player.
    SendToPlayer = 57,
    /// Game message to be inserted into a queue.
    ShareGameQueue = 58,
    /// A file (map/mod) was requested.
    FileRequested = 59,
    /// A file request was cancelled.
    FileCancelled = 60,
    /// One chunk of a file.
    FilePayload = 61,
    /// Desync dump, so nobody has to paste logs around.
    DebugSync = 62,
}

impl NetMessageType {
    /// Every net type in tag order.
    pub const ALL: [NetMessageType; 29] = [
        Self::Ping,
        Self::PlayerStats,
        Self::TextMsg,
        Self::PlayerResponding,
        Self::Options,
        Self::Kick,
        Self::FireUp,
        Self::ColourRequest,
        Self::AiTextMsg,
        Self::BeaconMsg,
        Self::TeamRequest,
        Self::Join,
        Self::Accepted,
        Self::PlayerInfo,
        Self::PlayerJoined,
        Self::PlayerLeaving,
        Self::PlayerDropped,
        Self::GameFlags,
        Self::ReadyRequest,
        Self::Rejected,
        Self::PositionRequest,
        Self::DataCheck,
        Self::HostDropped,
        Self::SendToPlayer,
        Self::ShareGameQueue,
        Self::FileRequested,
        Self::FileCancelled,
        Self::FilePayload,
        Self::DebugSync,
    ];

    /// Look up a net type by wire tag. Sentinels and foreign tags yield `None`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        if tag <= NET_MIN_TYPE || tag >= NET_MAX_TYPE {
            return None;
        }
        Some(Self::ALL[(tag - NET_MIN_TYPE - 1) as usize])
    }

    /// Wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Symbolic name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "NET_PING",
            Self::PlayerStats => "NET_PLAYER_STATS",
            Self::TextMsg => "NET_TEXTMSG",
            Self::PlayerResponding => "NET_PLAYERRESPONDING",
            Self::Options => "NET_OPTIONS",
            Self::Kick => "NET_KICK",
            Self::FireUp => "NET_FIREUP",
            Self::ColourRequest => "NET_COLOURREQUEST",
            Self::AiTextMsg => "NET_AITEXTMSG",
            Self::BeaconMsg => "NET_BEACONMSG",
            Self::TeamRequest => "NET_TEAMREQUEST",
            Self::Join => "NET_JOIN",
            Self::Accepted => "NET_ACCEPTED",
            Self::PlayerInfo => "NET_PLAYER_INFO",
            Self::PlayerJoined => "NET_PLAYER_JOINED",
            Self::PlayerLeaving => "NET_PLAYER_LEAVING",
            Self::PlayerDropped => "NET_PLAYER_DROPPED",
            Self::GameFlags => "NET_GAME_FLAGS",
            Self::ReadyRequest => "NET_READY_REQUEST",
            Self::Rejected => "NET_REJECTED",
            Self::PositionRequest => "NET_POSITIONREQUEST",
            Self::DataCheck => "NET_DATA_CHECK",
            Self::HostDropped => "NET_HOST_DROPPED",
            Self::SendToPlayer => "NET_SEND_TO_PLAYER",
            Self::ShareGameQueue => "NET_SHARE_GAME_QUEUE",
            Self::FileRequested => "NET_FILE_REQUESTED",
            Self::FileCancelled => "NET_FILE_CANCELLED",
            Self::FilePayload => "NET_FILE_PAYLOAD",
            Self::DebugSync => "NET_DEBUG_SYNC",
        }
    }
}

/// Simulation messages, delivered in game-time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GameMessageType {
    /// A new droid.
    Droid = 112,
    /// Droid order update.
    DroidInfo = 113,
    /// A new template.
    Template = 114,
    /// Template removal.
    TemplateDest = 115,
    /// Feature destruction.
    FeatureDest = 116,
    /// Build a structure.
    Build = 117,
    /// Research completed.
    Research = 118,
    /// Feature information.
    Features = 119,
    /// Droid secondary order.
    Secondary = 120,
    /// Alliance data.
    Alliance = 121,
    /// A gift between players.
    Gift = 122,
    /// Artifacts placement.
    Artifacts = 123,
    /// Research state.
    ResearchStatus = 124,
    /// Structure state.
    StructureInfo = 125,
    /// Lassat firing.
    Lassat = 126,
    /// Game-time report used to release queued game messages.
    GameTime = 127,
    /// Droid destruction.
    DroidDest = 128,
    /// Droid position/damage check.
    CheckDroid = 129,
    /// Structure damage check.
    CheckStruct = 130,
    /// Power level check.
    CheckPower = 131,
    /// Structure destruction.
    StructDest = 132,
    /// Building completed.
    BuildFinished = 133,
    /// Demolish completed.
    Demolish = 134,
    /// Droid embarked on a transporter.
    DroidEmbark = 135,
    /// Droid disembarked from a transporter.
    DroidDisembark = 136,
}

impl GameMessageType {
    /// Every game type in tag order.
    pub const ALL: [GameMessageType; 25] = [
        Self::Droid,
        Self::DroidInfo,
        Self::Template,
        Self::TemplateDest,
        Self::FeatureDest,
        Self::Build,
        Self::Research,
        Self::Features,
        Self::Secondary,
        Self::Alliance,
        Self::Gift,
        Self::Artifacts,
        Self::ResearchStatus,
        Self::StructureInfo,
        Self::Lassat,
        Self::GameTime,
        Self::DroidDest,
        Self::CheckDroid,
        Self::CheckStruct,
        Self::CheckPower,
        Self::StructDest,
        Self::BuildFinished,
        Self::Demolish,
        Self::DroidEmbark,
        Self::DroidDisembark,
    ];

    /// Look up a game type by wire tag. Sentinels and foreign tags yield `None`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        if tag <= GAME_MIN_TYPE || tag >= GAME_MAX_TYPE {
            return None;
        }
        Some(Self::ALL[(tag - GAME_MIN_TYPE - 1) as usize])
    }

    /// Wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Symbolic name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Droid => "GAME_DROID",
            Self::DroidInfo => "GAME_DROIDINFO",
            Self::Template => "GAME_TEMPLATE",
            Self::TemplateDest => "GAME_TEMPLATEDEST",
            Self::FeatureDest => "GAME_FEATUREDEST",
            Self::Build => "GAME_BUILD",
            Self::Research => "GAME_RESEARCH",
            Self::Features => "GAME_FEATURES",
            Self::Secondary => "GAME_SECONDARY",
            Self::Alliance => "GAME_ALLIANCE",
            Self::Gift => "GAME_GIFT",
            Self::Artifacts => "GAME_ARTIFACTS",
            Self::ResearchStatus => "GAME_RESEARCHSTATUS",
            Self::StructureInfo => "GAME_STRUCTUREINFO",
            Self::Lassat => "GAME_LASSAT",
            Self::GameTime => "GAME_GAME_TIME",
            Self::DroidDest => "GAME_DROIDDEST",
            Self::CheckDroid => "GAME_CHECK_DROID",
            Self::CheckStruct => "GAME_CHECK_STRUCT",
            Self::CheckPower => "GAME_CHECK_POWER",
            Self::StructDest => "GAME_STRUCTDEST",
            Self::BuildFinished => "GAME_BUILDFINISHED",
            Self::Demolish => "GAME_DEMOLISH",
            Self::DroidEmbark => "GAME_DROIDEMBARK",
            Self::DroidDisembark => "GAME_DROIDDISEMBARK",
        }
    }
}

/// Traffic class of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    /// Control and lifecycle traffic, delivered in arrival order.
    Net,
    /// Simulation traffic, delivered in game-time order.
    Game,
}

/// A valid message type from either range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Net range.
    Net(NetMessageType),
    /// Game range.
    Game(GameMessageType),
}

impl MessageType {
    /// Look up a type by wire tag in both ranges.
    pub fn from_tag(tag: u8) -> Option<Self> {
        NetMessageType::from_tag(tag)
            .map(Self::Net)
            .or_else(|| GameMessageType::from_tag(tag).map(Self::Game))
    }

    /// Wire tag.
    pub fn tag(self) -> u8 {
        match self {
            Self::Net(t) => t.tag(),
            Self::Game(t) => t.tag(),
        }
    }

    /// Traffic class implied by the range.
    pub fn class(self) -> TrafficClass {
        match self {
            Self::Net(_) => TrafficClass::Net,
            Self::Game(_) => TrafficClass::Game,
        }
    }

    /// Symbolic name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Net(t) => t.name(),
            Self::Game(t) => t.name(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Symbolic name for a raw tag, for logging untrusted input.
pub fn message_type_to_string(tag: u8) -> &'static str {
    MessageType::from_tag(tag).map_or("(INVALID MESSAGE TYPE)", MessageType::name)
}

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Player slot index. Stable for as long as the player stays in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerIndex(pub u8);

impl PlayerIndex {
    /// The host always owns slot 0.
    pub const HOST: PlayerIndex = PlayerIndex(NET_HOST_ONLY);
    /// Source of a connection that has not been admitted yet.
    pub const UNASSIGNED: PlayerIndex = PlayerIndex(NET_ALL_PLAYERS);

    /// Whether this is the host slot.
    pub fn is_host(self) -> bool {
        self == Self::HOST
    }

    /// Slot number usable as a table index.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PlayerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an envelope is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A single player; `PlayerIndex::HOST` doubles as "host only".
    Player(PlayerIndex),
    /// Every player.
    All,
}

impl Destination {
    /// The host-only destination.
    pub const HOST_ONLY: Destination = Destination::Player(PlayerIndex::HOST);

    /// Wire byte.
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Player(p) => p.0,
            Self::All => NET_ALL_PLAYERS,
        }
    }

    /// Parse a wire byte.
    pub fn from_wire(byte: u8) -> Self {
        if byte == NET_ALL_PLAYERS {
            Self::All
        } else {
            Self::Player(PlayerIndex(byte))
        }
    }

    /// Whether `player` is among the recipients.
    pub fn includes(self, player: PlayerIndex) -> bool {
        match self {
            Self::Player(p) => p == player,
            Self::All => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A routed unit of traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Type tag; also fixes the traffic class.
    pub message_type: MessageType,
    /// Originating player.
    pub source: PlayerIndex,
    /// Addressee.
    pub destination: Destination,
    /// Game time at origin. Zero for net traffic.
    pub game_time: u32,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build a net-class envelope.
    pub fn net(
        kind: NetMessageType,
        source: PlayerIndex,
        destination: Destination,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_type: MessageType::Net(kind),
            source,
            destination,
            game_time: 0,
            payload,
        }
    }

    /// Build a game-class envelope stamped with `game_time`.
    pub fn game(
        kind: GameMessageType,
        source: PlayerIndex,
        destination: Destination,
        game_time: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_type: MessageType::Game(kind),
            source,
            destination,
            game_time,
            payload,
        }
    }

    /// Traffic class.
    pub fn class(&self) -> TrafficClass {
        self.message_type.class()
    }

    /// Net type, if this is a net envelope.
    pub fn net_type(&self) -> Option<NetMessageType> {
        match self.message_type {
            MessageType::Net(t) => Some(t),
            MessageType::Game(_) => None,
        }
    }

    /// Decode the payload as a postcard-encoded record.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }
}

/// Encode a control record as a postcard payload.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(value)?)
}

// ---------------------------------------------------------------------------
// Control payloads
// ---------------------------------------------------------------------------

/// NET_JOIN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinRequest {
    /// Requested display name.
    pub name: String,
    /// Netcode major version of the joiner.
    pub version_major: u32,
    /// Netcode minor version of the joiner.
    pub version_minor: u32,
    /// Session password, empty if none.
    pub password: String,
    /// Data integrity hash of the joiner's game data.
    pub data_hash: u32,
}

/// NET_ACCEPTED.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Accepted {
    /// Slot assigned to the joiner.
    pub index: PlayerIndex,
}

/// NET_REJECTED.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rejected {
    /// Why the join failed.
    pub reason: LobbyError,
}

/// NET_PLAYER_INFO.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerInfo {
    /// Slot this record describes.
    pub index: PlayerIndex,
    /// Display name.
    pub name: String,
    /// Map start position.
    pub position: i32,
    /// Colour slot.
    pub colour: i32,
    /// Team.
    pub team: i32,
    /// Human (true) or computer player.
    pub allocated: bool,
    /// Ready to start.
    pub ready: bool,
}

/// NET_PLAYER_JOINED, NET_PLAYER_LEAVING, NET_PLAYER_DROPPED and NET_KICK.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerNotice {
    /// Player the notice is about.
    pub index: PlayerIndex,
}

/// NET_OPTIONS.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionOptions {
    /// The session descriptor.
    pub game: GameStruct,
    /// Map file every player needs, if any.
    pub map_file: Option<String>,
}

/// NET_GAME_FLAGS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameFlags {
    /// The four user flags.
    pub flags: [i32; 4],
}

/// NET_READY_REQUEST.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyRequest {
    /// Requesting player.
    pub index: PlayerIndex,
    /// New ready state.
    pub ready: bool,
}

/// NET_TEXTMSG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextMessage {
    /// Chat text.
    pub text: String,
}

/// NET_PING.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    /// Sequence number, echoed by the reply.
    pub sequence: u32,
    /// `false` for a request, `true` for the echo.
    pub reply: bool,
}

/// NET_FILE_REQUESTED.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRequest {
    /// File identifier (map or mod name).
    pub file_id: String,
    /// Kind of file.
    pub file_type: FileType,
    /// First byte the requester still needs.
    pub offset: u32,
}

/// NET_FILE_CANCELLED.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileCancelled {
    /// File identifier.
    pub file_id: String,
    /// Set when the sender aborted the transfer.
    pub fault: Option<FileFault>,
}

/// NET_FILE_PAYLOAD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilePayload {
    /// File identifier.
    pub file_id: String,
    /// Kind of file.
    pub file_type: FileType,
    /// Total size of the file.
    pub file_size: u32,
    /// Offset of the first byte of `data`.
    pub offset: u32,
    /// Whether `data` is LZ4-compressed.
    pub compressed: bool,
    /// Chunk bytes.
    pub data: Vec<u8>,
}

/// NET_DEBUG_SYNC.
///
/// The dump travels LZ4-compressed. Lines that would push the frame past
/// [`MAX_PAYLOAD_SIZE`] are dropped from the end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebugSync {
    /// Game time of the diverging window.
    pub game_time: u32,
    /// Newline-joined lines, size-prepended LZ4 block.
    pub compressed: Vec<u8>,
}

/// Room left for the compressed block after the record's own framing.
const DEBUG_SYNC_BUDGET: usize = MAX_PAYLOAD_SIZE - 16;

impl DebugSync {
    /// Compress `lines`, keeping as many leading lines as fit.
    pub fn pack(game_time: u32, lines: &[String]) -> Self {
        let mut keep = lines.len();
        loop {
            let compressed = compress_prepend_size(lines[..keep].join("\n").as_bytes());
            if compressed.len() <= DEBUG_SYNC_BUDGET || keep == 0 {
                return Self {
                    game_time,
                    compressed,
                };
            }
            keep /= 2;
        }
    }

    /// The transmitted lines.
    pub fn lines(&self) -> Result<Vec<String>, CodecError> {
        let bytes = decompress_size_prepended(&self.compressed)?;
        let text = String::from_utf8_lossy(&bytes);
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.split('\n').map(str::to_string).collect())
    }
}

/// GAME_GAME_TIME.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameTimeReport {
    /// Every game message the sender stamped below this time has been sent.
    pub reached: u32,
    /// Game time of the closed sync-debug window.
    pub sync_time: u32,
    /// Checksum of that window.
    pub sync_crc: u32,
}
