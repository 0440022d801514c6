//! The canonical player table.
//!
//! Slot indices are player identities: routing, queues and game messages all
//! refer to players by slot. Once the game has started, a vacated slot is
//! retired for the rest of the session so a late message can never be
//! attributed to a newcomer.

use std::collections::HashSet;
use std::fmt;
use std::ops::BitOr;
use std::time::Instant;

use crate::diagnostics::PingTracker;
use crate::file_transfer::Transfers;
use crate::gamestruct::{STRING_SIZE, truncate_to};
use crate::messages::{MAX_CONNECTED_PLAYERS, PlayerIndex, PlayerInfo};
use crate::transport::ConnectionHandle;

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

/// Combinable per-player status bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionStatus(pub u8);

impl ConnectionStatus {
    pub const NORMAL: Self = Self(0);
    pub const LEAVING: Self = Self(1);
    pub const DROPPED: Self = Self(2);
    pub const WAITING_FOR_PLAYER: Self = Self(4);
    pub const DESYNC: Self = Self(8);

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// No bits set.
    pub fn is_normal(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ConnectionStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_normal() {
            return f.write_str("NORMAL");
        }
        let names = [
            (Self::LEAVING, "LEAVING"),
            (Self::DROPPED, "DROPPED"),
            (Self::WAITING_FOR_PLAYER, "WAITING_FOR_PLAYER"),
            (Self::DESYNC, "DESYNC"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&set.join(" | "))
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport connection in progress.
    Connecting,
    /// Connected, join request pending.
    Joining,
    /// Join accepted, roster being transferred.
    Accepted,
    /// Full member of the session.
    Active,
    /// Leaving cleanly.
    Leaving,
    /// Lost by the transport, a timeout or a kick.
    Dropped,
    /// Torn down.
    Closed,
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// One occupied slot.
#[derive(Debug)]
pub struct Player {
    pub index: PlayerIndex,
    pub name: String,
    /// Map start position.
    pub position: i32,
    pub colour: i32,
    pub team: i32,
    /// Human (true) or computer player.
    pub allocated: bool,
    pub ready: bool,
    /// Last time anything was heard from this player.
    pub heartbeat_at: Option<Instant>,
    /// Still considered alive.
    pub heartbeat: bool,
    /// A kick is pending.
    pub kick: bool,
    pub kick_deadline: Option<Instant>,
    /// Connection carrying this player's traffic, if directly connected.
    pub connection: Option<ConnectionHandle>,
    pub ip_address: String,
    pub status: ConnectionStatus,
    pub state: ConnectionState,
    /// Latest game time this player reported having reached.
    pub reached_time: u32,
    /// Since when this player has been holding up game-time release.
    pub wait_since: Option<Instant>,
    /// Malformed envelopes received from this player.
    pub malformed: u32,
    /// Files in flight to or from this player.
    pub files: Transfers,
    pub ping: PingTracker,
}

impl Player {
    /// A fresh human player in `index`.
    pub fn new(index: PlayerIndex, name: &str) -> Self {
        Self {
            index,
            name: clamp_name(name).to_string(),
            position: index.0 as i32,
            colour: index.0 as i32,
            team: index.0 as i32,
            allocated: true,
            ready: false,
            heartbeat_at: None,
            heartbeat: true,
            kick: false,
            kick_deadline: None,
            connection: None,
            ip_address: String::new(),
            status: ConnectionStatus::NORMAL,
            state: ConnectionState::Active,
            reached_time: 0,
            wait_since: None,
            malformed: 0,
            files: Transfers::default(),
            ping: PingTracker::default(),
        }
    }

    /// Refresh liveness.
    pub fn touch(&mut self, now: Instant) {
        self.heartbeat_at = Some(now);
        self.heartbeat = true;
    }

    /// Roster record broadcast to peers.
    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            index: self.index,
            name: self.name.clone(),
            position: self.position,
            colour: self.colour,
            team: self.team,
            allocated: self.allocated,
            ready: self.ready,
        }
    }

    /// Overwrite the public attributes from a roster record.
    pub fn apply_info(&mut self, info: &PlayerInfo) {
        self.name = clamp_name(&info.name).to_string();
        self.position = info.position;
        self.colour = info.colour;
        self.team = info.team;
        self.allocated = info.allocated;
        self.ready = info.ready;
    }
}

fn clamp_name(name: &str) -> &str {
    truncate_to(name, STRING_SIZE - 1)
}

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// Slot table for one session.
#[derive(Debug)]
pub struct Roster {
    slots: Vec<Option<Player>>,
    retired: Vec<bool>,
    max_players: usize,
    locked: bool,
}

impl Roster {
    /// Empty table with `max_players` usable slots.
    pub fn new(max_players: usize) -> Self {
        let max_players = max_players.clamp(1, MAX_CONNECTED_PLAYERS);
        Self {
            slots: (0..MAX_CONNECTED_PLAYERS).map(|_| None).collect(),
            retired: vec![false; MAX_CONNECTED_PLAYERS],
            max_players,
            locked: false,
        }
    }

    /// Usable slots.
    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a join would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_players || self.free_slot().is_none()
    }

    /// Place a player at a specific slot, replacing any occupant.
    pub fn insert(&mut self, player: Player) -> bool {
        let Some(slot) = self.slots.get_mut(player.index.as_usize()) else {
            return false;
        };
        *slot = Some(player);
        true
    }

    /// Take the lowest free slot above the host's.
    pub fn allocate(&mut self, name: &str) -> Option<PlayerIndex> {
        if self.len() >= self.max_players {
            return None;
        }
        let index = self.free_slot()?;
        self.slots[index.as_usize()] = Some(Player::new(index, name));
        Some(index)
    }

    fn free_slot(&self) -> Option<PlayerIndex> {
        (1..self.max_players)
            .find(|&i| self.slots[i].is_none() && !self.retired[i])
            .map(|i| PlayerIndex(i as u8))
    }

    /// Empty a slot. After [`Roster::lock_slots`] the slot is never reused.
    pub fn vacate(&mut self, index: PlayerIndex) -> Option<Player> {
        let player = self.slots.get_mut(index.as_usize())?.take()?;
        if self.locked {
            self.retired[index.as_usize()] = true;
        }
        Some(player)
    }

    /// Forbid slot reuse from now on.
    pub fn lock_slots(&mut self) {
        self.locked = true;
    }

    /// Whether slot reuse is forbidden.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn get(&self, index: PlayerIndex) -> Option<&Player> {
        self.slots.get(index.as_usize())?.as_ref()
    }

    pub fn get_mut(&mut self, index: PlayerIndex) -> Option<&mut Player> {
        self.slots.get_mut(index.as_usize())?.as_mut()
    }

    /// Whether `index` is occupied.
    pub fn contains(&self, index: PlayerIndex) -> bool {
        self.get(index).is_some()
    }

    /// Occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.slots.iter_mut().flatten()
    }

    /// Indices of occupied slots.
    pub fn indices(&self) -> Vec<PlayerIndex> {
        self.iter().map(|p| p.index).collect()
    }

    /// Player whose traffic arrives on `handle`.
    pub fn find_by_connection(&self, handle: ConnectionHandle) -> Option<PlayerIndex> {
        self.iter()
            .find(|p| p.connection == Some(handle))
            .map(|p| p.index)
    }

    /// Rename players whose name is already taken by a lower slot.
    ///
    /// The lower slot keeps its name; the other gets the first free
    /// `<name><n>` with `n >= 2`. Returns the renamed slots.
    pub fn fix_duplicate_names(&mut self) -> Vec<PlayerIndex> {
        let mut taken: HashSet<String> = self.iter().map(|p| p.name.clone()).collect();
        let mut seen: HashSet<String> = HashSet::new();
        let mut renamed = Vec::new();

        for player in self.slots.iter_mut().flatten() {
            if seen.insert(player.name.clone()) {
                continue;
            }
            let fresh = (2u32..)
                .map(|n| {
                    let suffix = n.to_string();
                    let base = truncate_to(&player.name, STRING_SIZE - 1 - suffix.len());
                    format!("{base}{suffix}")
                })
                .find(|candidate| !taken.contains(candidate))
                .unwrap_or_default();
            tracing::info!(
                "Player {} renamed from {} to {fresh} to resolve a name clash",
                player.index,
                player.name
            );
            taken.insert(fresh.clone());
            seen.insert(fresh.clone());
            player.name = fresh;
            renamed.push(player.index);
        }
        renamed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits_combine() {
        let mut s = ConnectionStatus::NORMAL;
        assert!(s.is_normal());
        s.insert(ConnectionStatus::DESYNC);
        s.insert(ConnectionStatus::WAITING_FOR_PLAYER);
        assert!(s.contains(ConnectionStatus::DESYNC));
        assert!(!s.contains(ConnectionStatus::DROPPED));
        assert_eq!(s, ConnectionStatus::DESYNC | ConnectionStatus::WAITING_FOR_PLAYER);
        s.remove(ConnectionStatus::DESYNC);
        assert_eq!(s, ConnectionStatus::WAITING_FOR_PLAYER);
        assert_eq!(format!("{s:?}"), "WAITING_FOR_PLAYER");
    }

    #[test]
    fn test_allocate_skips_host_and_fills_lowest() {
        let mut r = Roster::new(4);
        r.insert(Player::new(PlayerIndex::HOST, "host"));
        assert_eq!(r.allocate("a"), Some(PlayerIndex(1)));
        assert_eq!(r.allocate("b"), Some(PlayerIndex(2)));
        r.vacate(PlayerIndex(1));
        assert_eq!(r.allocate("c"), Some(PlayerIndex(1)));
    }

    #[test]
    fn test_full_at_max_players() {
        let mut r = Roster::new(2);
        r.insert(Player::new(PlayerIndex::HOST, "host"));
        assert!(!r.is_full());
        r.allocate("a").unwrap();
        assert!(r.is_full());
        assert_eq!(r.allocate("b"), None);
    }

    #[test]
    fn test_locked_slots_are_not_reused() {
        let mut r = Roster::new(3);
        r.insert(Player::new(PlayerIndex::HOST, "host"));
        r.allocate("a").unwrap();
        r.lock_slots();
        r.vacate(PlayerIndex(1));
        assert_eq!(r.allocate("b"), Some(PlayerIndex(2)));
        assert_eq!(r.allocate("c"), None);
        assert!(r.is_full());
    }

    #[test]
    fn test_duplicate_names_resolved_once() {
        let mut r = Roster::new(4);
        r.insert(Player::new(PlayerIndex::HOST, "Commander"));
        r.allocate("Commander").unwrap();
        let renamed = r.fix_duplicate_names();
        assert_eq!(renamed, vec![PlayerIndex(1)]);
        assert_eq!(r.get(PlayerIndex(0)).unwrap().name, "Commander");
        assert_eq!(r.get(PlayerIndex(1)).unwrap().name, "Commander2");
        assert!(r.fix_duplicate_names().is_empty());
    }

    #[test]
    fn test_duplicate_names_avoid_existing_suffix() {
        let mut r = Roster::new(4);
        r.insert(Player::new(PlayerIndex::HOST, "bob"));
        r.allocate("bob2").unwrap();
        r.allocate("bob").unwrap();
        r.allocate("bob").unwrap();
        r.fix_duplicate_names();
        let names: HashSet<String> = r.iter().map(|p| p.name.clone()).collect();
        assert_eq!(names.len(), 4);
        assert_eq!(r.get(PlayerIndex(2)).unwrap().name, "bob3");
        assert_eq!(r.get(PlayerIndex(3)).unwrap().name, "bob4");
    }

    #[test]
    fn test_find_by_connection() {
        let mut r = Roster::new(4);
        let i = r.allocate("a").unwrap();
        r.get_mut(i).unwrap().connection = Some(ConnectionHandle(9));
        assert_eq!(r.find_by_connection(ConnectionHandle(9)), Some(i));
        assert_eq!(r.find_by_connection(ConnectionHandle(1)), None);
    }

    #[test]
    fn test_info_roundtrip() {
        let mut p = Player::new(PlayerIndex(3), "zed");
        p.team = 1;
        p.ready = true;
        let info = p.info();
        let mut q = Player::new(PlayerIndex(3), "");
        q.apply_info(&info);
        assert_eq!(q.info(), info);
    }

    #[test]
    fn test_long_names_are_clamped() {
        let p = Player::new(PlayerIndex(1), &"x".repeat(200));
        assert_eq!(p.name.len(), STRING_SIZE - 1);
    }
}
