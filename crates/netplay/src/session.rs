//! The session context and its poll driver.
//!
//! A [`Session`] owns everything one machine knows about a game session: the
//! transport, the roster, the queues, the sync debug history and the
//! counters. The host is the authority for the roster, admission and file
//! serving. Clients only ever talk to the host.
//!
//! Nothing here blocks. The embedding game calls [`Session::poll`] once per
//! frame with the current time and drains [`Session::recv_net`],
//! [`Session::recv_game`] and [`Session::next_event`] afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::codec::{self, FrameDecoder, MAX_MSG_SIZE, MAX_PAYLOAD_SIZE};
use crate::diagnostics::{CheckKind, SyncCounters, TrafficStats};
use crate::error::{LobbyError, NetError};
use crate::file_transfer::{
    FileFault, FileStatus, FileStore, FileTransferError, FileType, MemoryStore, Outgoing,
};
use crate::gamestruct::{
    GAMESTRUCT_SIZE, GameStruct, PASSWORD_STRING_SIZE, SESSION_JOINDISABLED, STRING_SIZE,
    SessionDesc, truncate_to,
};
use crate::lobby::{LobbyDirectory, NETCODE_VERSION_MAJOR, NETCODE_VERSION_MINOR, new_game_id};
use crate::messages::{
    Accepted, DebugSync, Destination, Envelope, FileCancelled, FilePayload, FileRequest,
    GameFlags, GameMessageType, GameTimeReport, JoinRequest, MAX_CONNECTED_PLAYERS, MessageType,
    NetMessageType, Ping, PlayerIndex, PlayerInfo, PlayerNotice, ReadyRequest, Rejected,
    SessionOptions, TextMessage, encode_payload,
};
use crate::queue::QueueSet;
use crate::roster::{ConnectionState, ConnectionStatus, Player, Roster};
use crate::routing::{Multiplexer, Route};
use crate::sync_debug::{MAX_SYNC_HISTORY, SyncCheck, SyncDebug};
use crate::transport::{ConnectionHandle, NoPortMapping, PortMapper, Transport, TransportError};

#[cfg(test)]
mod tests;

/// Maximum number of remembered bans.
pub const MAX_BANS: usize = 255;
/// Maximum number of connections waiting for their join to be decided.
pub const MAX_TMP_SOCKETS: usize = 16;
/// File chunks pause for a player while this many bytes wait in the transport.
pub const FILE_BACKLOG_LIMIT: usize = 4 * MAX_MSG_SIZE;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Usable player slots, host included.
    pub max_players: usize,
    /// How often pings are sent.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Time a kicked player is given before being dropped.
    pub kick_grace: Duration,
    /// How long a lagging player may hold up game time.
    pub wait_timeout: Duration,
    /// How long a join may stay undecided.
    pub join_timeout: Duration,
    /// Malformed envelopes tolerated from one player before it is dropped.
    pub malformed_limit: u32,
    /// Bytes per file chunk.
    pub file_chunk_size: usize,
    /// Chunks sent per player per poll.
    pub file_chunks_per_tick: usize,
    /// Where desync dumps are written. `None` logs them instead.
    pub sync_dump_dir: Option<PathBuf>,
    /// Game data hash. Zero disables the data check.
    pub data_hash: u32,
    /// Netcode version as (major, minor).
    pub version: (u32, u32),
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_players: MAX_CONNECTED_PLAYERS,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            kick_grace: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(15),
            join_timeout: Duration::from_secs(10),
            malformed_limit: 16,
            file_chunk_size: 4096,
            file_chunks_per_tick: 4,
            sync_dump_dir: None,
            data_hash: 0,
            version: (NETCODE_VERSION_MAJOR, NETCODE_VERSION_MINOR),
        }
    }
}

/// What the host advertises when it opens a session.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    pub session_name: String,
    pub player_name: String,
    pub port: u16,
    pub user_flags: [i32; 4],
    pub password: Option<String>,
    pub map_file: Option<String>,
    pub version_string: String,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Something the game should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Our join was accepted into this slot.
    Accepted(PlayerIndex),
    /// Our join was refused, or never answered.
    Rejected(LobbyError),
    PlayerJoined(PlayerIndex),
    /// A roster record changed.
    PlayerUpdated(PlayerIndex),
    PlayerRenamed { index: PlayerIndex, name: String },
    PlayerLeft(PlayerIndex),
    PlayerDropped(PlayerIndex),
    PlayerKicked(PlayerIndex),
    /// We were kicked.
    Kicked,
    HostDropped,
    GameFlagsChanged([i32; 4]),
    OptionsReceived,
    GameStarted,
    /// A peer asked us for a file and we are sending it.
    FileRequested { player: PlayerIndex, file_id: String },
    FileReceived { file_id: String },
    FileFailed { file_id: String, fault: Option<FileFault> },
    /// `player` disagrees with us about the state at `game_time`.
    Desync { player: PlayerIndex, game_time: u32 },
    /// `player` is holding up game time.
    WaitingForPlayer(PlayerIndex),
}

/// A remembered kick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ban {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Copy)]
struct PendingJoin {
    handle: ConnectionHandle,
    since: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    Left,
    Dropped,
    Kicked,
}

/// Net message types only the host may originate.
fn host_authored(kind: NetMessageType) -> bool {
    matches!(
        kind,
        NetMessageType::PlayerJoined
            | NetMessageType::PlayerDropped
            | NetMessageType::Kick
            | NetMessageType::HostDropped
            | NetMessageType::GameFlags
            | NetMessageType::Options
            | NetMessageType::FireUp
    )
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One machine's view of a game session.
pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    mux: Multiplexer,
    state: ConnectionState,
    started: bool,
    roster: Roster,
    queues: QueueSet,
    game: GameStruct,
    password: Option<String>,
    map_file: Option<String>,
    bans: Vec<Ban>,
    pending: Vec<PendingJoin>,
    host_connection: Option<ConnectionHandle>,
    join_request: Option<Envelope>,
    decoders: HashMap<ConnectionHandle, FrameDecoder>,
    lost: Vec<ConnectionHandle>,
    events: VecDeque<SessionEvent>,
    counters: SyncCounters,
    stats: TrafficStats,
    sync: SyncDebug,
    game_time: u32,
    pending_checks: VecDeque<(PlayerIndex, u32, u32)>,
    reported_desyncs: HashSet<u32>,
    lobby: Option<Box<dyn LobbyDirectory>>,
    lobby_dirty: bool,
    port_mapper: Box<dyn PortMapper>,
    port: u16,
    lobby_error: Option<LobbyError>,
    file_store: Box<dyn FileStore>,
    last_heartbeat: Option<Instant>,
    join_started: Instant,
    now: Instant,
}

impl<T: Transport> Session<T> {
    fn with_role(
        transport: T,
        config: SessionConfig,
        mux: Multiplexer,
        state: ConnectionState,
    ) -> Self {
        let now = Instant::now();
        Self {
            sync: SyncDebug::new(mux.local(), config.sync_dump_dir.clone()),
            roster: Roster::new(config.max_players),
            transport,
            config,
            mux,
            state,
            started: false,
            queues: QueueSet::new(),
            game: GameStruct::default(),
            password: None,
            map_file: None,
            bans: Vec::new(),
            pending: Vec::new(),
            host_connection: None,
            join_request: None,
            decoders: HashMap::new(),
            lost: Vec::new(),
            events: VecDeque::new(),
            counters: SyncCounters::default(),
            stats: TrafficStats::default(),
            game_time: 0,
            pending_checks: VecDeque::new(),
            reported_desyncs: HashSet::new(),
            lobby: None,
            lobby_dirty: true,
            port_mapper: Box::new(NoPortMapping),
            port: 0,
            lobby_error: None,
            file_store: Box::new(MemoryStore::new()),
            last_heartbeat: None,
            join_started: now,
            now,
        }
    }

    /// Open a session on `options.port` with the local player in slot 0.
    pub fn host(
        mut transport: T,
        config: SessionConfig,
        options: HostOptions,
    ) -> Result<Self, NetError> {
        transport.listen(options.port)?;
        let mut session =
            Self::with_role(transport, config, Multiplexer::host(), ConnectionState::Active);
        session.port = options.port;

        let mut host = Player::new(PlayerIndex::HOST, &options.player_name);
        host.touch(session.now);
        session.roster.insert(host);

        session.game = GameStruct {
            name: truncate_to(&options.session_name, STRING_SIZE - 1).to_string(),
            desc: SessionDesc {
                size: GAMESTRUCT_SIZE as i32,
                flags: 0,
                host: String::new(),
                max_players: session.roster.max_players() as i32,
                current_players: 1,
                user_flags: options.user_flags,
            },
            version_string: options.version_string,
            game_version_major: session.config.version.0,
            game_version_minor: session.config.version.1,
            game_id: new_game_id(),
            ..GameStruct::default()
        };
        session.map_file = options.map_file;
        if let Some(password) = &options.password {
            session.set_game_password(password)?;
        }
        tracing::info!(
            "Hosting \"{}\" on port {} (game id {:08x})",
            session.game.name,
            options.port,
            session.game.game_id
        );
        Ok(session)
    }

    /// Connect to the host at `address` and ask to join.
    ///
    /// Returns while the connection may still be in progress; the join request
    /// goes out once the transport reports it connected. The answer arrives
    /// through [`Session::poll`] as [`SessionEvent::Accepted`] or
    /// [`SessionEvent::Rejected`].
    pub fn join(
        mut transport: T,
        config: SessionConfig,
        address: &str,
        player_name: &str,
        password: &str,
    ) -> Result<Self, NetError> {
        let handle = transport.connect(address)?;
        let mut session = Self::with_role(
            transport,
            config,
            Multiplexer::client(PlayerIndex::UNASSIGNED),
            ConnectionState::Connecting,
        );
        session.host_connection = Some(handle);
        session.decoders.insert(handle, FrameDecoder::new());

        let request = JoinRequest {
            name: player_name.to_string(),
            version_major: session.config.version.0,
            version_minor: session.config.version.1,
            password: password.to_string(),
            data_hash: session.config.data_hash,
        };
        let envelope = Envelope::net(
            NetMessageType::Join,
            PlayerIndex::UNASSIGNED,
            Destination::HOST_ONLY,
            encode_payload(&request)?,
        );
        session.join_request = Some(envelope);
        tracing::info!("Joining {address} as {player_name}");
        if session.transport.is_connected(handle)? {
            session.send_join_request(handle);
        }
        Ok(session)
    }

    // -- attachments ---------------------------------------------------------

    /// Advertise this session in `lobby`. Only meaningful on the host.
    pub fn attach_lobby(&mut self, lobby: Box<dyn LobbyDirectory>) {
        self.lobby = Some(lobby);
        self.lobby_dirty = true;
        self.republish();
    }

    /// Ask `mapper` to forward the listening port.
    pub fn attach_port_mapper(&mut self, mut mapper: Box<dyn PortMapper>) {
        if self.mux.is_host() {
            match mapper.add_redirect(self.port) {
                Ok(()) => tracing::info!("Port {} forwarded", self.port),
                Err(e) => tracing::warn!("Port forwarding unavailable: {e}"),
            }
        }
        self.port_mapper = mapper;
    }

    /// Where served files are read from and received files written to.
    pub fn attach_file_store(&mut self, store: Box<dyn FileStore>) {
        self.file_store = store;
    }

    // -- accessors -----------------------------------------------------------

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn counters(&self) -> &SyncCounters {
        &self.counters
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    /// Current session descriptor, as advertised or as received from the host.
    pub fn game_struct(&self) -> &GameStruct {
        &self.game
    }

    pub fn map_file(&self) -> Option<&str> {
        self.map_file.as_deref()
    }

    pub fn sync_debug(&self) -> &SyncDebug {
        &self.sync
    }

    /// Sink for [`sync_debug!`](crate::sync_debug) lines.
    pub fn sync_debug_mut(&mut self) -> &mut SyncDebug {
        &mut self.sync
    }

    pub fn connection_status(&self, index: PlayerIndex) -> Option<ConnectionStatus> {
        self.roster.get(index).map(|p| p.status)
    }

    /// Why the session ended or the join failed.
    pub fn lobby_error(&self) -> Option<LobbyError> {
        self.lobby_error
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_host(&self) -> bool {
        self.mux.is_host()
    }

    /// Local slot. [`PlayerIndex::UNASSIGNED`] until a join is accepted.
    pub fn local_player(&self) -> PlayerIndex {
        self.mux.local()
    }

    pub fn game_time(&self) -> u32 {
        self.game_time
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn bans(&self) -> &[Ban] {
        &self.bans
    }

    pub fn file_store(&self) -> &dyn FileStore {
        self.file_store.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Next pending event.
    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting
                | ConnectionState::Joining
                | ConnectionState::Accepted
                | ConnectionState::Active
        )
    }

    fn ensure_admitted(&self) -> Result<(), NetError> {
        match self.state {
            ConnectionState::Accepted | ConnectionState::Active => Ok(()),
            _ => Err(NetError::NotConnected),
        }
    }

    fn ensure_host(&self) -> Result<(), NetError> {
        if !self.mux.is_host() {
            return Err(NetError::NotHost);
        }
        self.ensure_admitted()
    }

    // -- messaging -----------------------------------------------------------

    /// Queue a net-class message.
    pub fn send(
        &mut self,
        kind: NetMessageType,
        destination: Destination,
        payload: Vec<u8>,
    ) -> Result<(), NetError> {
        self.ensure_admitted()?;
        check_payload_size(&payload)?;
        let envelope = Envelope::net(kind, self.mux.local(), destination, payload);
        self.route_and_queue(envelope)
    }

    /// Queue a chat line.
    pub fn send_text(&mut self, destination: Destination, text: &str) -> Result<(), NetError> {
        let payload = encode_payload(&TextMessage {
            text: text.to_string(),
        })?;
        self.send(NetMessageType::TextMsg, destination, payload)
    }

    /// Queue a game-class message stamped with the current game time.
    pub fn send_game(
        &mut self,
        kind: GameMessageType,
        destination: Destination,
        payload: Vec<u8>,
    ) -> Result<(), NetError> {
        self.ensure_admitted()?;
        check_payload_size(&payload)?;
        let envelope =
            Envelope::game(kind, self.mux.local(), destination, self.game_time, payload);
        self.route_and_queue(envelope)
    }

    /// Next net-class message addressed to us, in arrival order.
    pub fn recv_net(&mut self) -> Option<Envelope> {
        self.queues.pop_net()
    }

    /// Next game-class message every live player has moved past.
    ///
    /// Returns nothing once the host has been lost.
    pub fn recv_game(&mut self) -> Option<Envelope> {
        if self.lobby_error == Some(LobbyError::HostDropped) {
            return None;
        }
        let threshold = self.release_threshold();
        self.queues.pop_game(threshold)
    }

    fn release_threshold(&self) -> u32 {
        self.roster
            .iter()
            .filter(|p| p.allocated && !p.status.contains(ConnectionStatus::DROPPED))
            .map(|p| p.reached_time)
            .min()
            .unwrap_or(0)
    }

    /// Close the current sync window and tell everyone we reached `game_time`.
    pub fn advance_game_time(&mut self, game_time: u32) -> Result<(), NetError> {
        self.ensure_admitted()?;
        if game_time <= self.game_time {
            return Ok(());
        }
        let sync_time = self.game_time;
        let sync_crc = self.sync.next_debug_sync(sync_time);
        self.game_time = game_time;

        let local = self.mux.local();
        if let Some(player) = self.roster.get_mut(local) {
            player.reached_time = game_time;
        }
        let report = GameTimeReport {
            reached: game_time,
            sync_time,
            sync_crc,
        };
        let envelope = Envelope::game(
            GameMessageType::GameTime,
            local,
            Destination::All,
            sync_time,
            encode_payload(&report)?,
        );
        self.route_and_queue(envelope)?;

        for (peer, time, crc) in std::mem::take(&mut self.pending_checks) {
            self.check_sync(peer, time, crc);
        }
        Ok(())
    }

    // -- roster control ------------------------------------------------------

    /// Schedule `index` to be dropped after the kick grace period and ban it.
    pub fn kick(&mut self, index: PlayerIndex) -> Result<(), NetError> {
        self.ensure_host()?;
        if index.is_host() {
            return Err(NetError::UnknownPlayer(index));
        }
        let deadline = self.now + self.config.kick_grace;
        let player = self
            .roster
            .get_mut(index)
            .ok_or(NetError::UnknownPlayer(index))?;
        player.kick = true;
        player.kick_deadline = Some(deadline);
        let ban = Ban {
            name: player.name.clone(),
            address: player.ip_address.clone(),
        };
        if self.bans.len() >= MAX_BANS {
            self.bans.remove(0);
        }
        self.bans.push(ban);
        self.counters.kicks = self.counters.kicks.saturating_add(1);
        tracing::warn!("Kicking player {index}");
        self.send_control(NetMessageType::Kick, Destination::All, &PlayerNotice { index });
        Ok(())
    }

    /// Leave the session. On the host this closes it for everyone.
    pub fn leave(&mut self) {
        if self.mux.is_host() {
            self.close();
            return;
        }
        if self.ensure_admitted().is_ok() {
            let index = self.mux.local();
            self.send_control(
                NetMessageType::PlayerLeaving,
                Destination::HOST_ONLY,
                &PlayerNotice { index },
            );
            self.state = ConnectionState::Leaving;
            self.flush_outbound();
        }
        self.shutdown();
        tracing::info!("Left the session");
    }

    /// Tear the session down. The host tells everyone and unlists itself.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.mux.is_host() {
            let envelope = Envelope::net(
                NetMessageType::HostDropped,
                PlayerIndex::HOST,
                Destination::All,
                Vec::new(),
            );
            if let Err(e) = self.route_and_queue(envelope) {
                tracing::debug!("Could not announce shutdown: {e}");
            }
            self.flush_outbound();
            let game_id = self.game.game_id;
            if let Some(lobby) = &mut self.lobby {
                if let Err(e) = lobby.unlist(game_id) {
                    tracing::warn!("Could not unlist game: {e}");
                }
            }
            if let Err(e) = self.port_mapper.remove_redirect(self.port) {
                tracing::debug!("Could not remove port redirect: {e}");
            }
        }
        self.shutdown();
        tracing::info!("Session closed");
    }

    fn shutdown(&mut self) {
        let mut handles: Vec<ConnectionHandle> = self.pending.drain(..).map(|p| p.handle).collect();
        handles.extend(self.roster.iter().filter_map(|p| p.connection));
        handles.extend(self.host_connection.take());
        handles.sort();
        handles.dedup();
        for handle in handles {
            self.transport.close(handle);
        }
        self.decoders.clear();
        for player in self.roster.iter_mut() {
            player.files.cancel_all();
            player.connection = None;
        }
        self.queues.clear();
        self.pending_checks.clear();
        self.reported_desyncs.clear();
        self.join_request = None;
        self.sync.reset();
        self.counters = SyncCounters::default();
        self.stats = TrafficStats::default();
        self.state = ConnectionState::Closed;
    }

    /// Change the local player's name. Clashes are resolved by the host.
    pub fn change_player_name(&mut self, name: &str) -> Result<(), NetError> {
        self.ensure_admitted()?;
        let local = self.mux.local();
        let player = self.roster.get_mut(local).ok_or(NetError::NotConnected)?;
        player.name = truncate_to(name, STRING_SIZE - 1).to_string();
        let info = player.info();
        if self.mux.is_host() {
            let mut changed = vec![local];
            changed.extend(self.roster.fix_duplicate_names());
            for index in changed {
                self.broadcast_info(index);
            }
        } else {
            self.send_control(NetMessageType::PlayerInfo, Destination::HOST_ONLY, &info);
        }
        Ok(())
    }

    /// Mark the local player ready or not.
    pub fn set_ready(&mut self, ready: bool) -> Result<(), NetError> {
        self.ensure_admitted()?;
        let index = self.mux.local();
        let player = self.roster.get_mut(index).ok_or(NetError::NotConnected)?;
        player.ready = ready;
        if self.mux.is_host() {
            self.broadcast_info(index);
        } else {
            self.send_control(
                NetMessageType::ReadyRequest,
                Destination::HOST_ONLY,
                &ReadyRequest { index, ready },
            );
        }
        Ok(())
    }

    /// Assign start position, colour and team to a slot.
    pub fn set_player_slot_info(
        &mut self,
        index: PlayerIndex,
        position: i32,
        colour: i32,
        team: i32,
    ) -> Result<(), NetError> {
        self.ensure_host()?;
        let player = self
            .roster
            .get_mut(index)
            .ok_or(NetError::UnknownPlayer(index))?;
        player.position = position;
        player.colour = colour;
        player.team = team;
        self.broadcast_info(index);
        Ok(())
    }

    // -- session gating --------------------------------------------------------

    /// Set user flag `flag` (1..=4) and tell everyone.
    pub fn set_game_flag(&mut self, flag: usize, value: i32) -> Result<(), NetError> {
        self.ensure_host()?;
        let slot = flag_slot(flag)?;
        self.game.desc.user_flags[slot] = value;
        let flags = GameFlags {
            flags: self.game.desc.user_flags,
        };
        self.send_control(NetMessageType::GameFlags, Destination::All, &flags);
        self.lobby_dirty = true;
        Ok(())
    }

    /// Read user flag `flag` (1..=4).
    pub fn game_flag(&self, flag: usize) -> Result<i32, NetError> {
        Ok(self.game.desc.user_flags[flag_slot(flag)?])
    }

    /// Refuse all further joins.
    pub fn halt_joining(&mut self) -> Result<(), NetError> {
        self.ensure_host()?;
        self.game.desc.flags |= SESSION_JOINDISABLED;
        self.lobby_dirty = true;
        tracing::info!("Joining disabled");
        Ok(())
    }

    /// Require `password` from joiners.
    pub fn set_game_password(&mut self, password: &str) -> Result<(), NetError> {
        self.ensure_host()?;
        self.password = Some(truncate_to(password, PASSWORD_STRING_SIZE - 1).to_string());
        self.game.private_game = 1;
        self.lobby_dirty = true;
        Ok(())
    }

    /// Let anyone join again.
    pub fn reset_game_password(&mut self) -> Result<(), NetError> {
        self.ensure_host()?;
        self.password = None;
        self.game.private_game = 0;
        self.lobby_dirty = true;
        Ok(())
    }

    /// Set the map advertised to joiners.
    pub fn set_map_file(&mut self, map_file: Option<String>) -> Result<(), NetError> {
        self.ensure_host()?;
        self.map_file = map_file;
        Ok(())
    }

    /// Start the game: slots are frozen and joining stops.
    pub fn start_game(&mut self) -> Result<(), NetError> {
        self.ensure_host()?;
        self.started = true;
        self.roster.lock_slots();
        self.game.desc.flags |= SESSION_JOINDISABLED;
        self.lobby_dirty = true;
        self.send_control(NetMessageType::FireUp, Destination::All, &());
        tracing::info!("Game started with {} players", self.roster.len());
        Ok(())
    }

    // -- files -----------------------------------------------------------------

    /// Ask the host for `file_id`, resuming any partial copy.
    pub fn request_file(&mut self, file_id: &str, file_type: FileType) -> Result<(), NetError> {
        if self.mux.is_host() {
            return Err(NetError::IsHost);
        }
        self.ensure_admitted()?;
        let local = self.mux.local();
        let player = self.roster.get_mut(local).ok_or(NetError::NotConnected)?;
        let request = player
            .files
            .request(self.file_store.as_mut(), file_id, file_type)?;
        self.send_control(
            NetMessageType::FileRequested,
            Destination::HOST_ONLY,
            &request,
        );
        Ok(())
    }

    /// Stop transferring `file_id`. Returns whether anything was cancelled.
    pub fn cancel_file(&mut self, file_id: &str) -> bool {
        let notice = FileCancelled {
            file_id: file_id.to_string(),
            fault: None,
        };
        if !self.mux.is_host() {
            let local = self.mux.local();
            let cancelled = self
                .roster
                .get_mut(local)
                .and_then(|p| p.files.cancel(file_id))
                .is_some();
            if cancelled {
                if let Err(e) = self.file_store.discard(file_id) {
                    tracing::warn!("Could not discard partial {file_id}: {e}");
                }
                self.send_control(
                    NetMessageType::FileCancelled,
                    Destination::HOST_ONLY,
                    &notice,
                );
            }
            return cancelled;
        }

        let receivers: Vec<PlayerIndex> = self
            .roster
            .iter_mut()
            .filter_map(|p| p.files.cancel(file_id).map(|_| p.index))
            .collect();
        for &index in &receivers {
            self.send_control(
                NetMessageType::FileCancelled,
                Destination::Player(index),
                &notice,
            );
        }
        !receivers.is_empty()
    }

    /// Progress of every transfer in flight.
    pub fn file_status(&self) -> Vec<FileStatus> {
        self.roster
            .iter()
            .flat_map(|p| p.files.status(p.index))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Poll driver
    // -------------------------------------------------------------------------

    /// Run one cooperative step at `now`.
    pub fn poll(&mut self, now: Instant) {
        self.now = now;
        self.stats.roll(now);
        if !self.is_live() {
            return;
        }
        if self.mux.is_host() {
            self.accept_connections();
        } else {
            self.check_connecting();
        }
        for handle in self.connection_handles() {
            if !self.is_live() {
                break;
            }
            self.pump_connection(handle);
        }
        self.process_lost();
        self.check_join_timeouts();
        self.send_heartbeats();
        self.check_liveness();
        self.check_kicks();
        self.check_waiting();
        self.pump_files();
        self.flush_outbound();
        self.process_lost();
        self.republish();
    }

    fn check_connecting(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        let Some(handle) = self.host_connection else {
            return;
        };
        match self.transport.is_connected(handle) {
            Ok(true) => self.send_join_request(handle),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Could not reach the host: {e}");
                self.lost.push(handle);
            }
        }
    }

    fn send_join_request(&mut self, handle: ConnectionHandle) {
        if let Some(request) = self.join_request.take() {
            self.transmit(handle, &request);
        }
        self.state = ConnectionState::Joining;
    }

    fn connection_handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<ConnectionHandle> = self.pending.iter().map(|p| p.handle).collect();
        handles.extend(self.roster.iter().filter_map(|p| p.connection));
        handles.extend(self.host_connection);
        handles.sort();
        handles.dedup();
        handles
    }

    fn accept_connections(&mut self) {
        let incoming: Vec<ConnectionHandle> = self.transport.incoming().collect();
        for handle in incoming {
            if self.pending.len() >= MAX_TMP_SOCKETS {
                tracing::warn!("Too many pending joins, refusing {handle}");
                self.transport.close(handle);
                continue;
            }
            tracing::debug!(
                "Connection {handle} from {}",
                self.transport.peer_address(handle).unwrap_or_default()
            );
            self.pending.push(PendingJoin {
                handle,
                since: self.now,
            });
            self.decoders.insert(handle, FrameDecoder::new());
        }
    }

    fn pump_connection(&mut self, handle: ConnectionHandle) {
        loop {
            match self.transport.receive(handle) {
                Ok(bytes) => {
                    self.stats.record_received(bytes.len(), self.now);
                    self.decoders.entry(handle).or_default().push(&bytes);
                }
                Err(TransportError::WouldBlock) => break,
                Err(e) => {
                    tracing::debug!("Connection {handle} lost: {e}");
                    self.lost.push(handle);
                    break;
                }
            }
        }

        loop {
            let Some(frame) = self.decoders.get_mut(&handle).and_then(|d| d.next_frame()) else {
                break;
            };
            match frame {
                Ok(envelope) => self.dispatch(handle, envelope),
                Err(e) if e.is_fatal() => {
                    tracing::warn!("Unrecoverable framing on {handle}: {e}");
                    self.stats.malformed += 1;
                    self.lost.push(handle);
                    break;
                }
                Err(e) => self.malformed(handle, &e.to_string()),
            }
        }
    }

    fn malformed(&mut self, handle: ConnectionHandle, reason: &str) {
        self.stats.malformed += 1;
        let limit = self.config.malformed_limit;
        let index = self.roster.find_by_connection(handle);
        tracing::warn!("Malformed envelope on {handle}: {reason}");
        let Some(player) = index.and_then(|i| self.roster.get_mut(i)) else {
            return;
        };
        player.malformed += 1;
        if player.malformed > limit {
            tracing::warn!("Player {} exceeded the malformed limit", player.index);
            self.lost.push(handle);
        }
    }

    fn process_lost(&mut self) {
        while let Some(handle) = self.lost.pop() {
            self.on_connection_lost(handle);
        }
    }

    fn on_connection_lost(&mut self, handle: ConnectionHandle) {
        self.decoders.remove(&handle);
        if let Some(pos) = self.pending.iter().position(|p| p.handle == handle) {
            self.pending.remove(pos);
            self.transport.close(handle);
            return;
        }
        if self.mux.is_host() {
            if let Some(index) = self.roster.find_by_connection(handle) {
                let kicked = self.roster.get(index).is_some_and(|p| p.kick);
                tracing::info!("Player {index} disconnected");
                let departure = if kicked { Departure::Kicked } else { Departure::Dropped };
                self.remove_player(index, departure);
            }
        } else if self.host_connection == Some(handle) {
            if matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Joining
            ) {
                self.fail_join(LobbyError::Connection);
            } else {
                self.host_lost();
            }
        }
    }

    fn check_join_timeouts(&mut self) {
        let timeout = self.config.join_timeout;
        let now = self.now;
        if self.mux.is_host() {
            let expired: Vec<ConnectionHandle> = self
                .pending
                .iter()
                .filter(|p| now.saturating_duration_since(p.since) > timeout)
                .map(|p| p.handle)
                .collect();
            for handle in expired {
                tracing::info!("Join on {handle} timed out");
                self.drop_pending(handle);
            }
        } else if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Joining
        ) && now.saturating_duration_since(self.join_started) > timeout
        {
            tracing::warn!("No answer from the host");
            self.fail_join(LobbyError::Connection);
        }
    }

    fn send_heartbeats(&mut self) {
        if self.ensure_admitted().is_err() {
            return;
        }
        let now = self.now;
        if self
            .last_heartbeat
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.heartbeat_interval)
        {
            return;
        }
        self.last_heartbeat = Some(now);

        let local = self.mux.local();
        let targets: Vec<PlayerIndex> = self
            .roster
            .iter()
            .filter(|p| p.index != local && p.connection.is_some())
            .map(|p| p.index)
            .collect();
        for index in targets {
            let Some(player) = self.roster.get_mut(index) else {
                continue;
            };
            player.ping.expire(now);
            let sequence = player.ping.ping_sent(now);
            self.counters.record_check(CheckKind::Ping, true);
            self.send_control(
                NetMessageType::Ping,
                Destination::Player(index),
                &Ping {
                    sequence,
                    reply: false,
                },
            );
        }
    }

    fn check_liveness(&mut self) {
        let now = self.now;
        let timeout = self.config.heartbeat_timeout;
        let stale: Vec<PlayerIndex> = self
            .roster
            .iter_mut()
            .filter(|p| p.connection.is_some())
            .filter(|p| {
                p.heartbeat_at
                    .is_some_and(|t| now.saturating_duration_since(t) > timeout)
            })
            .map(|p| {
                p.heartbeat = false;
                p.index
            })
            .collect();
        for index in stale {
            if self.mux.is_host() {
                tracing::warn!("Player {index} timed out");
                self.remove_player(index, Departure::Dropped);
            } else if index.is_host() {
                tracing::warn!("Host timed out");
                self.host_lost();
            }
        }
    }

    fn check_kicks(&mut self) {
        if !self.mux.is_host() {
            return;
        }
        let now = self.now;
        let due: Vec<PlayerIndex> = self
            .roster
            .iter()
            .filter(|p| p.kick && p.kick_deadline.is_some_and(|d| now >= d))
            .map(|p| p.index)
            .collect();
        for index in due {
            self.remove_player(index, Departure::Kicked);
        }
    }

    fn check_waiting(&mut self) {
        if !self.started || self.ensure_admitted().is_err() {
            return;
        }
        let now = self.now;
        let local = self.mux.local();
        let game_time = self.game_time;
        let timeout = self.config.wait_timeout;
        let mut expired = Vec::new();

        for player in self
            .roster
            .iter_mut()
            .filter(|p| p.allocated && p.index != local)
        {
            if player.reached_time >= game_time {
                player.status.remove(ConnectionStatus::WAITING_FOR_PLAYER);
                player.wait_since = None;
                continue;
            }
            if !player.status.contains(ConnectionStatus::WAITING_FOR_PLAYER) {
                player.status.insert(ConnectionStatus::WAITING_FOR_PLAYER);
                self.events
                    .push_back(SessionEvent::WaitingForPlayer(player.index));
            }
            let since = *player.wait_since.get_or_insert(now);
            if now.saturating_duration_since(since) > timeout {
                expired.push(player.index);
            }
        }

        for index in expired {
            if self.mux.is_host() {
                tracing::warn!("Gave up waiting for player {index}");
                self.remove_player(index, Departure::Dropped);
            } else if index.is_host() {
                tracing::warn!("Gave up waiting for the host");
                self.host_lost();
            }
        }
    }

    fn pump_files(&mut self) {
        let chunk_size = self.config.file_chunk_size;
        let per_tick = self.config.file_chunks_per_tick;
        let backed_up: Vec<PlayerIndex> = self
            .roster
            .iter()
            .filter(|p| !p.files.is_empty())
            .filter(|p| {
                self.connection_of(p.index)
                    .is_some_and(|h| self.transport.backlog(h) > FILE_BACKLOG_LIMIT)
            })
            .map(|p| p.index)
            .collect();
        let mut out = Vec::new();
        for player in self.roster.iter_mut().filter(|p| !p.files.is_empty()) {
            let index = player.index;
            if backed_up.contains(&index) {
                tracing::trace!("Player {index} is backed up, holding file chunks");
                continue;
            }
            out.extend(
                player
                    .files
                    .next_chunks(chunk_size, per_tick)
                    .into_iter()
                    .map(|o| (index, o)),
            );
        }
        for (index, outgoing) in out {
            let to = Destination::Player(index);
            match outgoing {
                Outgoing::Chunk(chunk) => {
                    self.send_control(NetMessageType::FilePayload, to, &chunk);
                }
                Outgoing::Aborted { file_id, fault } => {
                    let notice = FileCancelled {
                        file_id,
                        fault: Some(fault),
                    };
                    self.send_control(NetMessageType::FileCancelled, to, &notice);
                }
            }
        }
    }

    fn connection_of(&self, index: PlayerIndex) -> Option<ConnectionHandle> {
        if self.mux.is_host() {
            self.roster.get(index).and_then(|p| p.connection)
        } else {
            self.host_connection
        }
    }

    fn flush_outbound(&mut self) {
        let targets: Vec<(PlayerIndex, Option<ConnectionHandle>)> = if self.mux.is_host() {
            self.roster
                .iter()
                .filter(|p| p.index != PlayerIndex::HOST)
                .map(|p| (p.index, p.connection))
                .collect()
        } else {
            vec![(PlayerIndex::HOST, self.host_connection)]
        };

        for (player, handle) in targets {
            let envelopes = self.queues.drain_outbound(player);
            let Some(handle) = handle else {
                if !envelopes.is_empty() {
                    tracing::debug!(
                        "Discarding {} envelopes for unconnected player {player}",
                        envelopes.len()
                    );
                }
                continue;
            };
            for envelope in &envelopes {
                self.transmit(handle, envelope);
            }
            if let Err(e) = self.transport.flush(handle) {
                tracing::debug!("Flush on {handle} failed: {e}");
                self.lost.push(handle);
            }
        }
    }

    fn republish(&mut self) {
        if !self.mux.is_host() || !self.lobby_dirty {
            return;
        }
        let record = self.game.encode();
        let Some(lobby) = &mut self.lobby else {
            return;
        };
        match lobby.publish(&record) {
            Ok(()) => self.lobby_dirty = false,
            Err(e) => tracing::warn!("Lobby publish failed: {e}"),
        }
    }

    // -------------------------------------------------------------------------
    // Sending helpers
    // -------------------------------------------------------------------------

    fn transmit(&mut self, handle: ConnectionHandle, envelope: &Envelope) {
        let bytes = match codec::encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cannot encode {}: {e}", envelope.message_type);
                return;
            }
        };
        tracing::trace!(
            "Sending {} ({} bytes) to {handle}",
            envelope.message_type,
            bytes.len()
        );
        match self.transport.send(handle, &bytes) {
            Ok(()) => self.stats.record_sent(bytes.len(), self.now),
            Err(e) => {
                tracing::debug!("Send on {handle} failed: {e}");
                self.lost.push(handle);
            }
        }
    }

    fn route_and_queue(&mut self, envelope: Envelope) -> Result<(), NetError> {
        let active = self.roster.indices();
        match self.mux.route_outgoing(envelope, &active) {
            Ok(route) => {
                self.apply_route(route);
                Ok(())
            }
            Err(e) => {
                self.stats.routing_dropped += 1;
                tracing::warn!("Dropping outgoing envelope: {e}");
                Err(e.into())
            }
        }
    }

    fn apply_route(&mut self, route: Route) {
        if route.relayed {
            self.stats.relayed += 1;
        }
        for (to, envelope) in route.forward {
            self.queues.push_outbound(to, envelope);
        }
        if let Some(envelope) = route.local {
            self.deliver_local(envelope);
        }
    }

    fn send_control<P: Serialize>(
        &mut self,
        kind: NetMessageType,
        destination: Destination,
        payload: &P,
    ) {
        let payload = match encode_payload(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Cannot encode {}: {e}", kind.name());
                return;
            }
        };
        let envelope = Envelope::net(kind, self.mux.local(), destination, payload);
        if let Err(e) = self.route_and_queue(envelope) {
            tracing::debug!("{} not sent: {e}", kind.name());
        }
    }

    /// Host only: queue straight onto `to`'s connection.
    fn queue_to<P: Serialize>(&mut self, to: PlayerIndex, kind: NetMessageType, payload: &P) {
        match encode_payload(payload) {
            Ok(bytes) => {
                let envelope =
                    Envelope::net(kind, PlayerIndex::HOST, Destination::Player(to), bytes);
                self.queues.push_outbound(to, envelope);
            }
            Err(e) => tracing::warn!("Cannot encode {}: {e}", kind.name()),
        }
    }

    fn broadcast_info(&mut self, index: PlayerIndex) {
        if let Some(info) = self.roster.get(index).map(Player::info) {
            self.send_control(NetMessageType::PlayerInfo, Destination::All, &info);
        }
    }

    // -------------------------------------------------------------------------
    // Inbound dispatch
    // -------------------------------------------------------------------------

    fn dispatch(&mut self, handle: ConnectionHandle, envelope: Envelope) {
        tracing::trace!(
            "Received {} from {} on {handle}",
            envelope.message_type,
            envelope.source
        );
        let now = self.now;
        if self.mux.is_host() {
            if self.pending.iter().any(|p| p.handle == handle) {
                self.handle_join(handle, envelope);
                return;
            }
            let Some(from) = self.roster.find_by_connection(handle) else {
                return;
            };
            if let Some(player) = self.roster.get_mut(from) {
                player.touch(now);
            }
            self.route_incoming(from, envelope);
        } else {
            if let Some(host) = self.roster.get_mut(PlayerIndex::HOST) {
                host.touch(now);
            }
            if self.state == ConnectionState::Joining {
                self.handle_join_reply(envelope);
                return;
            }
            self.route_incoming(PlayerIndex::HOST, envelope);
        }
    }

    fn route_incoming(&mut self, from: PlayerIndex, envelope: Envelope) {
        let active = self.roster.indices();
        match self.mux.route_incoming(from, envelope, &active) {
            Ok(route) => self.apply_route(route),
            Err(e) => {
                self.stats.routing_dropped += 1;
                tracing::warn!("Dropping envelope from player {from}: {e}");
            }
        }
    }

    fn deliver_local(&mut self, envelope: Envelope) {
        match envelope.message_type {
            MessageType::Game(GameMessageType::GameTime) => self.on_game_time(&envelope),
            MessageType::Game(_) => {
                self.queues.push_inbound(envelope);
            }
            MessageType::Net(kind) => self.handle_net(kind, envelope),
        }
    }

    fn handle_net(&mut self, kind: NetMessageType, envelope: Envelope) {
        let source = envelope.source;
        if host_authored(kind) && (self.mux.is_host() || !source.is_host()) {
            tracing::warn!("Ignoring {} from player {source}", kind.name());
            return;
        }
        let result = match kind {
            NetMessageType::Ping => self.on_ping(&envelope),
            NetMessageType::PlayerLeaving => self.on_player_leaving(&envelope),
            NetMessageType::PlayerInfo => self.on_player_info(&envelope),
            NetMessageType::ReadyRequest => self.on_ready_request(&envelope),
            NetMessageType::PlayerJoined => self.on_player_joined(&envelope),
            NetMessageType::PlayerDropped => self.on_player_dropped(&envelope),
            NetMessageType::Kick => self.on_kick(&envelope),
            NetMessageType::HostDropped => {
                self.host_lost();
                Ok(())
            }
            NetMessageType::GameFlags => self.on_game_flags(&envelope),
            NetMessageType::Options => self.on_options(&envelope),
            NetMessageType::FireUp => {
                self.on_game_started();
                Ok(())
            }
            NetMessageType::FileRequested => self.on_file_requested(&envelope),
            NetMessageType::FileCancelled => self.on_file_cancelled(&envelope),
            NetMessageType::FilePayload => self.on_file_payload(&envelope),
            NetMessageType::DebugSync => self.on_debug_sync(&envelope),
            NetMessageType::Join
            | NetMessageType::Accepted
            | NetMessageType::Rejected
            | NetMessageType::SendToPlayer => {
                tracing::debug!("Ignoring stray {} from player {source}", kind.name());
                Ok(())
            }
            _ => {
                self.queues.push_inbound(envelope);
                Ok(())
            }
        };
        if let Err(e) = result {
            self.stats.malformed += 1;
            tracing::warn!("Bad {} payload from player {source}: {e}", kind.name());
        }
    }

    // -- admission (host) ------------------------------------------------------

    fn handle_join(&mut self, handle: ConnectionHandle, envelope: Envelope) {
        if envelope.net_type() != Some(NetMessageType::Join) {
            tracing::debug!(
                "Ignoring {} from unadmitted connection {handle}",
                envelope.message_type
            );
            return;
        }
        let request: JoinRequest = match envelope.decode_payload() {
            Ok(request) => request,
            Err(e) => {
                self.stats.malformed += 1;
                tracing::warn!("Unreadable join request on {handle}: {e}");
                self.drop_pending(handle);
                return;
            }
        };
        let address = self.transport.peer_address(handle).unwrap_or_default();
        match self.check_join(&request, &address) {
            Ok(()) => self.admit(handle, &request, address),
            Err(reason) => self.reject(handle, &request.name, reason),
        }
    }

    /// First failing admission rule, in precedence order.
    fn check_join(&mut self, request: &JoinRequest, address: &str) -> Result<(), LobbyError> {
        if self.started || self.roster.is_full() || self.game.join_disabled() {
            self.counters.cantjoin = self.counters.cantjoin.saturating_add(1);
            return Err(LobbyError::Full);
        }
        let banned = self.bans.iter().any(|b| {
            if address.is_empty() || b.address.is_empty() {
                b.name == request.name
            } else {
                b.address == address
            }
        });
        if banned {
            self.counters.banned = self.counters.banned.saturating_add(1);
            return Err(LobbyError::Kicked);
        }
        if (request.version_major, request.version_minor) != self.config.version {
            return Err(LobbyError::WrongVersion);
        }
        if self
            .password
            .as_deref()
            .is_some_and(|pw| pw != request.password)
        {
            return Err(LobbyError::WrongPassword);
        }
        if self.config.data_hash != 0 && request.data_hash != self.config.data_hash {
            return Err(LobbyError::WrongData);
        }
        if request.name.trim().is_empty() {
            return Err(LobbyError::Cheat);
        }
        Ok(())
    }

    fn reject(&mut self, handle: ConnectionHandle, name: &str, reason: LobbyError) {
        tracing::warn!("Rejecting join from {name} on {handle}: {reason}");
        self.counters.rejected = self.counters.rejected.saturating_add(1);
        match encode_payload(&Rejected { reason }) {
            Ok(payload) => {
                let envelope = Envelope::net(
                    NetMessageType::Rejected,
                    PlayerIndex::HOST,
                    Destination::All,
                    payload,
                );
                self.transmit(handle, &envelope);
                if let Err(e) = self.transport.flush(handle) {
                    tracing::debug!("Flush on {handle} failed: {e}");
                }
            }
            Err(e) => tracing::warn!("Cannot encode rejection: {e}"),
        }
        self.drop_pending(handle);
    }

    fn drop_pending(&mut self, handle: ConnectionHandle) {
        self.pending.retain(|p| p.handle != handle);
        self.decoders.remove(&handle);
        self.transport.close(handle);
    }

    fn admit(&mut self, handle: ConnectionHandle, request: &JoinRequest, address: String) {
        let Some(index) = self.roster.allocate(&request.name) else {
            self.reject(handle, &request.name, LobbyError::Full);
            return;
        };
        self.pending.retain(|p| p.handle != handle);
        if let Some(player) = self.roster.get_mut(index) {
            player.connection = Some(handle);
            player.ip_address = address;
            player.touch(self.now);
            player.state = ConnectionState::Accepted;
            player.reached_time = self.game_time;
        }
        self.counters.joins = self.counters.joins.saturating_add(1);
        let renamed = self.roster.fix_duplicate_names();
        tracing::info!(
            "Player {index} ({}) joined from {}",
            request.name,
            self.transport.peer_address(handle).unwrap_or_default()
        );

        // The joiner gets the whole picture first.
        self.queue_to(index, NetMessageType::Accepted, &Accepted { index });
        let infos: Vec<PlayerInfo> = self.roster.iter().map(Player::info).collect();
        for info in &infos {
            self.queue_to(index, NetMessageType::PlayerInfo, info);
        }
        let options = SessionOptions {
            game: self.game.clone(),
            map_file: self.map_file.clone(),
        };
        self.queue_to(index, NetMessageType::Options, &options);

        let others: Vec<PlayerIndex> = self
            .roster
            .indices()
            .into_iter()
            .filter(|&p| !p.is_host() && p != index)
            .collect();
        for other in others {
            self.queue_to(other, NetMessageType::PlayerJoined, &PlayerNotice { index });
            for info in infos
                .iter()
                .filter(|i| i.index == index || renamed.contains(&i.index))
            {
                self.queue_to(other, NetMessageType::PlayerInfo, info);
            }
        }

        if let Some(player) = self.roster.get_mut(index) {
            player.state = ConnectionState::Active;
        }
        self.events.push_back(SessionEvent::PlayerJoined(index));
        for renamed_index in renamed {
            if let Some(player) = self.roster.get(renamed_index) {
                self.events.push_back(SessionEvent::PlayerRenamed {
                    index: renamed_index,
                    name: player.name.clone(),
                });
            }
        }
        self.refresh_game_struct();
    }

    fn refresh_game_struct(&mut self) {
        self.game.desc.current_players = self.roster.len() as i32;
        self.game.desc.max_players = self.roster.max_players() as i32;
        self.lobby_dirty = true;
    }

    // -- admission (client) ----------------------------------------------------

    fn handle_join_reply(&mut self, envelope: Envelope) {
        match envelope.net_type() {
            Some(NetMessageType::Accepted) => match envelope.decode_payload::<Accepted>() {
                Ok(Accepted { index }) => {
                    self.mux = Multiplexer::client(index);
                    self.sync.set_player(index);
                    self.state = ConnectionState::Accepted;
                    let mut host = Player::new(PlayerIndex::HOST, "");
                    host.connection = self.host_connection;
                    host.touch(self.now);
                    self.roster.insert(host);
                    tracing::info!("Joined as player {index}");
                    self.events.push_back(SessionEvent::Accepted(index));
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    tracing::warn!("Unreadable acceptance: {e}");
                }
            },
            Some(NetMessageType::Rejected) => match envelope.decode_payload::<Rejected>() {
                Ok(Rejected { reason }) => self.fail_join(reason),
                Err(e) => {
                    self.stats.malformed += 1;
                    tracing::warn!("Unreadable rejection: {e}");
                    self.fail_join(LobbyError::Connection);
                }
            },
            _ => tracing::debug!(
                "Ignoring {} before admission",
                envelope.message_type
            ),
        }
    }

    fn fail_join(&mut self, reason: LobbyError) {
        tracing::warn!("Join failed: {reason}");
        self.lobby_error = Some(reason);
        self.shutdown();
        self.events.push_back(SessionEvent::Rejected(reason));
    }

    // -- departures --------------------------------------------------------------

    fn remove_player(&mut self, index: PlayerIndex, departure: Departure) {
        let Some(mut player) = self.roster.vacate(index) else {
            return;
        };
        player.status.insert(match departure {
            Departure::Left => ConnectionStatus::LEAVING,
            Departure::Dropped | Departure::Kicked => ConnectionStatus::DROPPED,
        });
        player.state = ConnectionState::Closed;
        for file in player.files.cancel_all() {
            tracing::debug!("Cancelled {} for departing player {index}", file.file_id);
        }
        if let Some(handle) = player.connection.filter(|_| self.mux.is_host()) {
            self.transport.close(handle);
            self.decoders.remove(&handle);
        }
        if !self.roster.is_locked() {
            self.queues.clear_player(index);
        }

        match departure {
            Departure::Left => {
                self.counters.left = self.counters.left.saturating_add(1);
                self.events.push_back(SessionEvent::PlayerLeft(index));
            }
            Departure::Dropped => {
                self.counters.drops = self.counters.drops.saturating_add(1);
                self.events.push_back(SessionEvent::PlayerDropped(index));
            }
            Departure::Kicked => self.events.push_back(SessionEvent::PlayerKicked(index)),
        }

        if self.mux.is_host() {
            let notice = PlayerNotice { index };
            let kind = match departure {
                Departure::Left => NetMessageType::PlayerLeaving,
                Departure::Dropped | Departure::Kicked => NetMessageType::PlayerDropped,
            };
            self.send_control(kind, Destination::All, &notice);
            self.refresh_game_struct();
        }
    }

    fn host_lost(&mut self) {
        if !self.is_live() {
            return;
        }
        tracing::warn!("Lost the host, session over");
        self.lobby_error = Some(LobbyError::HostDropped);
        for player in self.roster.iter_mut() {
            player.status.insert(ConnectionStatus::DROPPED);
            player.state = ConnectionState::Dropped;
        }
        if let Some(handle) = self.host_connection.take() {
            self.transport.close(handle);
            self.decoders.remove(&handle);
        }
        self.state = ConnectionState::Dropped;
        self.events.push_back(SessionEvent::HostDropped);
    }

    /// Client side: the host has removed us.
    fn removed_by_host(&mut self, reason: LobbyError, event: SessionEvent) {
        self.lobby_error = Some(reason);
        if let Some(handle) = self.host_connection.take() {
            self.transport.close(handle);
            self.decoders.remove(&handle);
        }
        self.state = ConnectionState::Dropped;
        self.events.push_back(event);
    }

    // -- net handlers --------------------------------------------------------------

    fn on_ping(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let ping: Ping = envelope.decode_payload()?;
        if ping.reply {
            if let Some(player) = self.roster.get_mut(envelope.source) {
                player.ping.reply_received(ping.sequence, self.now);
            }
        } else {
            let reply = Ping {
                sequence: ping.sequence,
                reply: true,
            };
            self.send_control(
                NetMessageType::Ping,
                Destination::Player(envelope.source),
                &reply,
            );
        }
        Ok(())
    }

    fn on_player_leaving(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let PlayerNotice { index } = envelope.decode_payload()?;
        let source = envelope.source;
        if self.mux.is_host() {
            if index != source {
                tracing::warn!("Player {source} tried to remove player {index}");
                return Ok(());
            }
            tracing::info!("Player {index} left");
        } else if !source.is_host() {
            return Ok(());
        }
        self.remove_player(index, Departure::Left);
        Ok(())
    }

    fn on_player_info(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let info: PlayerInfo = envelope.decode_payload()?;
        let source = envelope.source;

        if self.mux.is_host() {
            // A client may only rename itself.
            if info.index != source {
                tracing::warn!("Player {source} sent a record for player {}", info.index);
                return Ok(());
            }
            let Some(player) = self.roster.get_mut(source) else {
                return Ok(());
            };
            let name = truncate_to(&info.name, STRING_SIZE - 1).to_string();
            if player.name == name {
                return Ok(());
            }
            player.name = name;
            let mut changed = vec![source];
            changed.extend(self.roster.fix_duplicate_names());
            for index in changed {
                self.broadcast_info(index);
                if let Some(player) = self.roster.get(index) {
                    self.events.push_back(SessionEvent::PlayerRenamed {
                        index,
                        name: player.name.clone(),
                    });
                }
            }
            return Ok(());
        }

        if !source.is_host() {
            return Ok(());
        }
        match self.roster.get_mut(info.index) {
            Some(player) => {
                let renamed = !player.name.is_empty() && player.name != info.name;
                player.apply_info(&info);
                self.events.push_back(if renamed {
                    SessionEvent::PlayerRenamed {
                        index: info.index,
                        name: player.name.clone(),
                    }
                } else {
                    SessionEvent::PlayerUpdated(info.index)
                });
            }
            None => {
                let mut player = Player::new(info.index, &info.name);
                player.apply_info(&info);
                player.reached_time = self.game_time;
                self.roster.insert(player);
                self.events.push_back(SessionEvent::PlayerUpdated(info.index));
            }
        }
        Ok(())
    }

    fn on_ready_request(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let request: ReadyRequest = envelope.decode_payload()?;
        if !self.mux.is_host() || request.index != envelope.source {
            return Ok(());
        }
        if let Some(player) = self.roster.get_mut(request.index) {
            player.ready = request.ready;
            self.broadcast_info(request.index);
            self.events
                .push_back(SessionEvent::PlayerUpdated(request.index));
        }
        Ok(())
    }

    fn on_player_joined(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let PlayerNotice { index } = envelope.decode_payload()?;
        self.events.push_back(SessionEvent::PlayerJoined(index));
        Ok(())
    }

    fn on_player_dropped(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let PlayerNotice { index } = envelope.decode_payload()?;
        if index == self.mux.local() {
            tracing::warn!("The host dropped us");
            self.removed_by_host(LobbyError::Connection, SessionEvent::PlayerDropped(index));
        } else {
            self.remove_player(index, Departure::Dropped);
        }
        Ok(())
    }

    fn on_kick(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let PlayerNotice { index } = envelope.decode_payload()?;
        if index == self.mux.local() {
            tracing::warn!("Kicked from the session");
            self.removed_by_host(LobbyError::Kicked, SessionEvent::Kicked);
        } else {
            self.events.push_back(SessionEvent::PlayerKicked(index));
        }
        Ok(())
    }

    fn on_game_flags(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let GameFlags { flags } = envelope.decode_payload()?;
        self.game.desc.user_flags = flags;
        self.events.push_back(SessionEvent::GameFlagsChanged(flags));
        Ok(())
    }

    fn on_options(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let options: SessionOptions = envelope.decode_payload()?;
        self.game = options.game;
        self.map_file = options.map_file;
        if self.state == ConnectionState::Accepted {
            self.state = ConnectionState::Active;
        }
        self.events.push_back(SessionEvent::OptionsReceived);
        Ok(())
    }

    fn on_game_started(&mut self) {
        self.started = true;
        self.roster.lock_slots();
        self.events.push_back(SessionEvent::GameStarted);
    }

    fn on_file_requested(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let request: FileRequest = envelope.decode_payload()?;
        let source = envelope.source;
        let Some(player) = self.roster.get_mut(source) else {
            return Ok(());
        };
        match player
            .files
            .accept_request(self.file_store.as_mut(), &request)
        {
            Ok(true) => self.events.push_back(SessionEvent::FileRequested {
                player: source,
                file_id: request.file_id,
            }),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Refusing {} to player {source}: {e}", request.file_id);
                let notice = FileCancelled {
                    file_id: request.file_id,
                    fault: Some(e.fault().unwrap_or(FileFault::Unavailable)),
                };
                self.send_control(
                    NetMessageType::FileCancelled,
                    Destination::Player(source),
                    &notice,
                );
            }
        }
        Ok(())
    }

    fn on_file_cancelled(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let notice: FileCancelled = envelope.decode_payload()?;
        let source = envelope.source;
        let local = self.mux.local();
        let receiving = self
            .roster
            .get(local)
            .and_then(|p| p.files.get(&notice.file_id))
            .is_some_and(|f| !f.is_sending);

        if receiving {
            if let Some(player) = self.roster.get_mut(local) {
                player.files.cancel(&notice.file_id);
            }
            if let Err(e) = self.file_store.discard(&notice.file_id) {
                tracing::warn!("Could not discard partial {}: {e}", notice.file_id);
            }
        } else if let Some(player) = self.roster.get_mut(source) {
            if player.files.cancel(&notice.file_id).is_some() {
                tracing::info!("Player {source} cancelled {}", notice.file_id);
            }
        }

        if receiving || notice.fault.is_some() {
            self.events.push_back(SessionEvent::FileFailed {
                file_id: notice.file_id,
                fault: notice.fault,
            });
        }
        Ok(())
    }

    fn on_file_payload(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let chunk: FilePayload = envelope.decode_payload()?;
        let local = self.mux.local();
        let Some(player) = self.roster.get_mut(local) else {
            return Ok(());
        };
        match player.files.receive_chunk(self.file_store.as_mut(), &chunk) {
            Ok(true) => self.events.push_back(SessionEvent::FileReceived {
                file_id: chunk.file_id,
            }),
            Ok(false) => {}
            Err(FileTransferError::UnknownTransfer(file_id)) => {
                tracing::debug!("Late chunk for {file_id}");
            }
            Err(e) => {
                tracing::warn!("Transfer of {} failed: {e}", chunk.file_id);
                player.files.cancel(&chunk.file_id);
                if let Err(e) = self.file_store.discard(&chunk.file_id) {
                    tracing::warn!("Could not discard partial {}: {e}", chunk.file_id);
                }
                let fault = e.fault();
                self.send_control(
                    NetMessageType::FileCancelled,
                    Destination::Player(envelope.source),
                    &FileCancelled {
                        file_id: chunk.file_id.clone(),
                        fault: None,
                    },
                );
                self.events.push_back(SessionEvent::FileFailed {
                    file_id: chunk.file_id,
                    fault,
                });
            }
        }
        Ok(())
    }

    fn on_debug_sync(&mut self, envelope: &Envelope) -> Result<(), codec::CodecError> {
        let dump: DebugSync = envelope.decode_payload()?;
        if self.mux.is_host() {
            let lines = dump.lines()?;
            self.sync.dump_remote(dump.game_time, envelope.source, &lines);
        }
        Ok(())
    }

    // -- game time and sync --------------------------------------------------------

    fn on_game_time(&mut self, envelope: &Envelope) {
        let report: GameTimeReport = match envelope.decode_payload() {
            Ok(report) => report,
            Err(e) => {
                self.stats.malformed += 1;
                tracing::warn!("Bad game time from player {}: {e}", envelope.source);
                return;
            }
        };
        let source = envelope.source;
        if let Some(player) = self.roster.get_mut(source) {
            player.reached_time = player.reached_time.max(report.reached);
        }
        if source != self.mux.local() {
            self.check_sync(source, report.sync_time, report.sync_crc);
        }
    }

    fn check_sync(&mut self, peer: PlayerIndex, game_time: u32, crc: u32) {
        if self.sync.latest_time().is_none_or(|latest| latest < game_time) {
            if self.pending_checks.len() >= MAX_SYNC_HISTORY * MAX_CONNECTED_PLAYERS {
                self.pending_checks.pop_front();
            }
            self.pending_checks.push_back((peer, game_time, crc));
            return;
        }
        if let SyncCheck::Mismatch { lines, .. } = self.sync.check_debug_sync(game_time, crc, peer)
        {
            self.on_desync(peer, game_time, lines);
        }
    }

    fn on_desync(&mut self, peer: PlayerIndex, game_time: u32, lines: Vec<String>) {
        for index in [self.mux.local(), peer] {
            if let Some(player) = self.roster.get_mut(index) {
                player.status.insert(ConnectionStatus::DESYNC);
            }
        }
        self.events.push_back(SessionEvent::Desync {
            player: peer,
            game_time,
        });
        if !self.mux.is_host() && self.reported_desyncs.insert(game_time) {
            self.send_control(
                NetMessageType::DebugSync,
                Destination::HOST_ONLY,
                &DebugSync::pack(game_time, &lines),
            );
        }
    }
}

fn flag_slot(flag: usize) -> Result<usize, NetError> {
    if (1..=4).contains(&flag) {
        Ok(flag - 1)
    } else {
        Err(NetError::InvalidFlag(flag))
    }
}

fn check_payload_size(payload: &[u8]) -> Result<(), NetError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(codec::CodecError::TooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        }
        .into());
    }
    Ok(())
}
