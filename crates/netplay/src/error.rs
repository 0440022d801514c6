//! Lobby error codes and the session-level error type.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::file_transfer::FileTransferError;
use crate::gamestruct::GameStructError;
use crate::lobby::LobbyDirectoryError;
use crate::messages::PlayerIndex;
use crate::routing::RoutingError;
use crate::transport::TransportError;

/// Join-time and lobby error codes reported to peers.
///
/// "No error" is represented as `Option::None` by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[repr(u8)]
pub enum LobbyError {
    /// Could not reach the host.
    #[error("connection failed")]
    Connection = 1,
    /// The session has no free slot, or joining was halted.
    #[error("game is full")]
    Full = 2,
    /// The joiner sent invalid identity data.
    #[error("cheat detected")]
    Cheat = 3,
    /// The joiner was kicked or banned from this session.
    #[error("kicked from game")]
    Kicked = 4,
    /// Netcode version mismatch.
    #[error("wrong game version")]
    WrongVersion = 5,
    /// Password did not match.
    #[error("wrong password")]
    WrongPassword = 6,
    /// The host left; the session is over.
    #[error("host dropped")]
    HostDropped = 7,
    /// Game data integrity hash mismatch.
    #[error("wrong game data")]
    WrongData = 8,
    /// A requested file could not be provided.
    #[error("unknown file issue")]
    UnknownFileIssue = 9,
}

/// Errors returned by the public [`Session`](crate::session::Session) API.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Destination slot is invalid.
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    /// File transfer refused or aborted.
    #[error("file transfer error: {0}")]
    FileTransfer(#[from] FileTransferError),

    /// Session descriptor could not be encoded or decoded.
    #[error("game struct error: {0}")]
    GameStruct(#[from] GameStructError),

    /// Lobby directory could not be reached.
    #[error("lobby directory error: {0}")]
    Lobby(#[from] LobbyDirectoryError),

    /// The host refused the join.
    #[error("join rejected: {0}")]
    Rejected(LobbyError),

    /// The session is not connected (closed, or never admitted).
    #[error("not connected to a session")]
    NotConnected,

    /// Only the host may perform this operation.
    #[error("operation requires the host")]
    NotHost,

    /// The host has no one to ask for this.
    #[error("operation not available to the host")]
    IsHost,

    /// No player occupies the given slot.
    #[error("no player in slot {0}")]
    UnknownPlayer(PlayerIndex),

    /// Game flag index outside 1..=4.
    #[error("invalid game flag {0}")]
    InvalidFlag(usize),
}
