//! Peer-to-peer game session networking: envelope codec, transports, host
//! relay, roster, file transfer, sync debugging and the lobby record.

pub mod codec;
pub mod diagnostics;
pub mod error;
pub mod file_transfer;
pub mod gamestruct;
pub mod lobby;
pub mod messages;
pub mod queue;
pub mod roster;
pub mod routing;
pub mod session;
pub mod sync_debug;
pub mod transport;

pub use codec::{CodecError, FrameDecoder, MAX_MSG_SIZE};
pub use diagnostics::{CheckKind, PingSnapshot, PingTracker, SyncCounters, TrafficStats};
pub use error::{LobbyError, NetError};
pub use file_transfer::{DirectoryStore, FileFault, FileStore, FileType, MemoryStore};
pub use gamestruct::GameStruct;
pub use lobby::{LobbyDirectory, MemoryLobby, find_games};
pub use messages::{
    Destination, Envelope, GameMessageType, MessageType, NetMessageType, PlayerIndex,
    message_type_to_string,
};
pub use roster::{ConnectionState, ConnectionStatus, Player, Roster};
pub use session::{HostOptions, Session, SessionConfig, SessionEvent};
pub use sync_debug::{SyncDebug, sync_debug_float};
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::tcp::{SocketConfig, TcpTransport};
pub use transport::{ConnectionHandle, PortMapper, Transport, TransportError};
