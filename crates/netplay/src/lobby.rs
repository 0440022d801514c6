//! Session advertisement and discovery.
//!
//! The lobby only ever sees encoded [`GameStruct`] records. Version gating is
//! an exact match on the netcode major and minor numbers.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::gamestruct::{GameStruct, GameStructError};

/// Netcode major version compiled into this build.
pub const NETCODE_VERSION_MAJOR: u32 = 2;
/// Netcode minor version compiled into this build.
pub const NETCODE_VERSION_MINOR: u32 = 3;
/// Maximum number of games returned by a lobby query.
pub const MAX_GAMES: usize = 12;

/// Errors from a lobby directory.
#[derive(Debug, thiserror::Error)]
pub enum LobbyDirectoryError {
    /// The directory could not be reached.
    #[error("lobby unreachable: {0}")]
    Unreachable(String),

    /// A stored or supplied record is invalid.
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] GameStructError),
}

/// Whether a peer's netcode version is compatible with this build.
pub fn is_correct_version(major: u32, minor: u32) -> bool {
    major == NETCODE_VERSION_MAJOR && minor == NETCODE_VERSION_MINOR
}

/// Whether an advertised game is compatible with this build.
pub fn game_is_correct_version(game: &GameStruct) -> bool {
    is_correct_version(game.game_version_major, game.game_version_minor)
}

/// Draw a fresh non-zero game identifier.
pub fn new_game_id() -> u32 {
    loop {
        let id = rand::random::<u32>();
        if id != 0 {
            return id;
        }
    }
}

/// Capability to publish and query session records.
pub trait LobbyDirectory {
    /// Publish or refresh the record for `record.game_id`.
    fn publish(&mut self, record: &[u8]) -> Result<(), LobbyDirectoryError>;

    /// Remove the record for `game_id`. Unknown ids are not an error.
    fn unlist(&mut self, game_id: u32) -> Result<(), LobbyDirectoryError>;

    /// Every record currently listed.
    fn list(&self) -> Result<Vec<Vec<u8>>, LobbyDirectoryError>;
}

/// In-process lobby keyed by game id.
#[derive(Debug, Default)]
pub struct MemoryLobby {
    records: BTreeMap<u32, Vec<u8>>,
}

impl MemoryLobby {
    /// Create an empty lobby.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of listed games.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no game is listed.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl LobbyDirectory for MemoryLobby {
    fn publish(&mut self, record: &[u8]) -> Result<(), LobbyDirectoryError> {
        let game = GameStruct::decode(record)?;
        self.records.insert(game.game_id, record.to_vec());
        Ok(())
    }

    fn unlist(&mut self, game_id: u32) -> Result<(), LobbyDirectoryError> {
        self.records.remove(&game_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Vec<u8>>, LobbyDirectoryError> {
        Ok(self.records.values().cloned().collect())
    }
}

impl<L: LobbyDirectory> LobbyDirectory for Rc<RefCell<L>> {
    fn publish(&mut self, record: &[u8]) -> Result<(), LobbyDirectoryError> {
        self.borrow_mut().publish(record)
    }

    fn unlist(&mut self, game_id: u32) -> Result<(), LobbyDirectoryError> {
        self.borrow_mut().unlist(game_id)
    }

    fn list(&self) -> Result<Vec<Vec<u8>>, LobbyDirectoryError> {
        self.borrow().list()
    }
}

/// Query the lobby for joinable games compatible with this build.
///
/// Undecodable records are skipped. At most [`MAX_GAMES`] are returned.
pub fn find_games(lobby: &dyn LobbyDirectory) -> Result<Vec<GameStruct>, LobbyDirectoryError> {
    let games = lobby
        .list()?
        .iter()
        .filter_map(|record| match GameStruct::decode(record) {
            Ok(game) => Some(game),
            Err(e) => {
                tracing::debug!("Skipping lobby record: {e}");
                None
            }
        })
        .filter(|game| game_is_correct_version(game) && !game.join_disabled())
        .take(MAX_GAMES)
        .collect();
    Ok(games)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamestruct::SESSION_JOINDISABLED;

    fn game(id: u32) -> GameStruct {
        GameStruct {
            name: format!("game {id}"),
            game_id: id,
            game_version_major: NETCODE_VERSION_MAJOR,
            game_version_minor: NETCODE_VERSION_MINOR,
            ..GameStruct::default()
        }
    }

    #[test]
    fn test_version_gate_is_exact() {
        assert!(is_correct_version(NETCODE_VERSION_MAJOR, NETCODE_VERSION_MINOR));
        assert!(!is_correct_version(NETCODE_VERSION_MAJOR, NETCODE_VERSION_MINOR + 1));
        assert!(!is_correct_version(NETCODE_VERSION_MAJOR + 1, NETCODE_VERSION_MINOR));
    }

    #[test]
    fn test_publish_replaces_same_game_id() {
        let mut lobby = MemoryLobby::new();
        let mut g = game(5);
        lobby.publish(&g.encode()).unwrap();
        g.desc.current_players = 3;
        lobby.publish(&g.encode()).unwrap();
        assert_eq!(lobby.len(), 1);
        let found = find_games(&lobby).unwrap();
        assert_eq!(found[0].desc.current_players, 3);
    }

    #[test]
    fn test_find_games_filters_incompatible_and_closed() {
        let mut lobby = MemoryLobby::new();
        lobby.publish(&game(1).encode()).unwrap();

        let mut old = game(2);
        old.game_version_minor = 0;
        lobby.publish(&old.encode()).unwrap();

        let mut closed = game(3);
        closed.desc.flags |= SESSION_JOINDISABLED;
        lobby.publish(&closed.encode()).unwrap();

        let found = find_games(&lobby).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].game_id, 1);
    }

    #[test]
    fn test_find_games_caps_results() {
        let mut lobby = MemoryLobby::new();
        for id in 1..=20 {
            lobby.publish(&game(id).encode()).unwrap();
        }
        assert_eq!(find_games(&lobby).unwrap().len(), MAX_GAMES);
    }

    #[test]
    fn test_unlist() {
        let mut lobby = MemoryLobby::new();
        lobby.publish(&game(9).encode()).unwrap();
        lobby.unlist(9).unwrap();
        lobby.unlist(42).unwrap();
        assert!(lobby.is_empty());
    }

    #[test]
    fn test_publish_rejects_garbage() {
        let mut lobby = MemoryLobby::new();
        assert!(lobby.publish(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_new_game_id_is_non_zero() {
        for _ in 0..100 {
            assert_ne!(new_game_id(), 0);
        }
    }
}
