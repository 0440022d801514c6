//! Per-game-time checksums of simulation debug lines.
//!
//! The simulation records formatted lines with [`sync_debug!`]. At every game
//! time step the open window is closed into a checksum which peers exchange.
//! A mismatch means the simulations diverged; the retained lines for that
//! window are dumped for offline diffing. Nothing is ever resynchronized.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::messages::PlayerIndex;

/// Closed windows kept for comparison.
pub const MAX_SYNC_HISTORY: usize = 12;

/// Record a formatted debug line tagged with the calling module.
///
/// ```ignore
/// sync_debug!(session.sync_debug_mut(), "droid {} at ({}, {})", id, x, y);
/// ```
#[macro_export]
macro_rules! sync_debug {
    ($sync:expr, $($arg:tt)*) => {
        $sync.record(module_path!(), format_args!($($arg)*))
    };
}

/// Render a float by its bit pattern so rounding differences show up.
pub fn sync_debug_float(value: f32) -> String {
    format!("{:08x}", value.to_bits())
}

#[derive(Debug, Clone)]
struct Window {
    game_time: u32,
    lines: Vec<String>,
    crc: u32,
}

/// Result of comparing a peer's checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCheck {
    /// Checksums agree.
    Match,
    /// Checksums differ. `lines` is the local window that was dumped.
    Mismatch {
        /// Where the dump was written, if a dump directory is configured
        /// and this time had not been dumped before.
        dump: Option<PathBuf>,
        /// Local lines for that window.
        lines: Vec<String>,
    },
    /// No local window for that time (not closed yet, or too old).
    Unknown,
}

/// Debug line accumulator and checksum history.
#[derive(Debug)]
pub struct SyncDebug {
    player: PlayerIndex,
    current: Vec<String>,
    history: VecDeque<Window>,
    dumped: HashSet<(u32, PlayerIndex)>,
    dump_dir: Option<PathBuf>,
}

impl SyncDebug {
    /// Accumulator for `player`, dumping into `dump_dir` when set.
    pub fn new(player: PlayerIndex, dump_dir: Option<PathBuf>) -> Self {
        Self {
            player,
            current: Vec::new(),
            history: VecDeque::with_capacity(MAX_SYNC_HISTORY),
            dumped: HashSet::new(),
            dump_dir,
        }
    }

    /// Change the local player, e.g. once a join is accepted.
    pub fn set_player(&mut self, player: PlayerIndex) {
        self.player = player;
    }

    /// Append one line to the open window.
    pub fn record(&mut self, function: &str, args: fmt::Arguments<'_>) {
        self.current.push(format!("{function}: {args}"));
    }

    /// Lines in the open window.
    pub fn pending_lines(&self) -> &[String] {
        &self.current
    }

    /// Close the open window as `game_time` and return its checksum.
    pub fn next_debug_sync(&mut self, game_time: u32) -> u32 {
        let lines = std::mem::take(&mut self.current);
        let crc = checksum(&lines);
        if self.history.len() >= MAX_SYNC_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(Window {
            game_time,
            lines,
            crc,
        });
        crc
    }

    /// Game time of the newest closed window.
    pub fn latest_time(&self) -> Option<u32> {
        self.history.back().map(|w| w.game_time)
    }

    /// Lines retained for `game_time`.
    pub fn lines_for(&self, game_time: u32) -> Option<&[String]> {
        self.window(game_time).map(|w| w.lines.as_slice())
    }

    fn window(&self, game_time: u32) -> Option<&Window> {
        self.history.iter().rev().find(|w| w.game_time == game_time)
    }

    /// Compare `remote_crc` from `peer` against the local window.
    pub fn check_debug_sync(
        &mut self,
        game_time: u32,
        remote_crc: u32,
        peer: PlayerIndex,
    ) -> SyncCheck {
        let Some(window) = self.window(game_time) else {
            return SyncCheck::Unknown;
        };
        if window.crc == remote_crc {
            return SyncCheck::Match;
        }
        let (local_crc, lines) = (window.crc, window.lines.clone());
        tracing::warn!(
            "Desync at game time {game_time}: local {local_crc:08x}, player {peer} {remote_crc:08x}"
        );
        let dump = self.dump(game_time, self.player, &lines);
        SyncCheck::Mismatch { dump, lines }
    }

    /// Dump lines received from another player.
    pub fn dump_remote(
        &mut self,
        game_time: u32,
        player: PlayerIndex,
        lines: &[String],
    ) -> Option<PathBuf> {
        self.dump(game_time, player, lines)
    }

    fn dump(&mut self, game_time: u32, player: PlayerIndex, lines: &[String]) -> Option<PathBuf> {
        if !self.dumped.insert((game_time, player)) {
            return None;
        }
        let Some(dir) = &self.dump_dir else {
            for line in lines {
                tracing::warn!("desync {game_time} p{player}: {line}");
            }
            return None;
        };
        match write_dump(dir, game_time, player, lines) {
            Ok(path) => {
                tracing::warn!("Desync dump written to {}", path.display());
                Some(path)
            }
            Err(e) => {
                tracing::warn!("Could not write desync dump: {e}");
                None
            }
        }
    }

    /// Drop all state, e.g. at session teardown.
    pub fn reset(&mut self) {
        self.current.clear();
        self.history.clear();
        self.dumped.clear();
    }
}

fn write_dump(
    dir: &Path,
    game_time: u32,
    player: PlayerIndex,
    lines: &[String],
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("desync{game_time}_p{player}.txt"));
    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(&path, text)?;
    Ok(path)
}

/// First four bytes of the BLAKE3 digest of the newline-joined lines.
fn checksum(lines: &[String]) -> u32 {
    let mut hasher = blake3::Hasher::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
