//! The fixed-layout session descriptor exchanged with the lobby and peers.
//!
//! The record is 814 bytes in network byte order and starts with a 4-byte
//! version tag. Fields after `mod_list` are append-only extensions: they are
//! never reordered, and the reserved `future` words stay zero until assigned.

use serde::{Deserialize, Serialize};

/// Current layout version.
pub const GAMESTRUCT_VERSION: u32 = 3;
/// Width of name, description and version string fields.
pub const STRING_SIZE: usize = 64;
/// Width of host address fields.
pub const HOST_ADDRESS_SIZE: usize = 40;
/// Width of the free-form extra field.
pub const EXTRA_STRING_SIZE: usize = 239;
/// Width of the mod list field.
pub const MODLIST_STRING_SIZE: usize = 255;
/// Width of a session password.
pub const PASSWORD_STRING_SIZE: usize = 64;
/// Number of secondary host slots.
pub const SECONDARY_HOSTS: usize = 2;
/// Encoded size of a [`GameStruct`].
pub const GAMESTRUCT_SIZE: usize = 4
    + STRING_SIZE
    + SESSION_DESC_SIZE
    + SECONDARY_HOSTS * HOST_ADDRESS_SIZE
    + EXTRA_STRING_SIZE
    + STRING_SIZE
    + MODLIST_STRING_SIZE
    + 9 * 4;

const SESSION_DESC_SIZE: usize = 4 + 4 + HOST_ADDRESS_SIZE + 4 + 4 + 4 * 4;

/// `SessionDesc::flags` bit: joining is halted.
pub const SESSION_JOINDISABLED: i32 = 1;

/// Errors from encoding or decoding a [`GameStruct`].
#[derive(Debug, thiserror::Error)]
pub enum GameStructError {
    /// Buffer is not exactly one record long.
    #[error("game struct must be {expected} bytes, got {actual}")]
    WrongSize {
        /// [`GAMESTRUCT_SIZE`].
        expected: usize,
        /// Bytes supplied.
        actual: usize,
    },

    /// The leading version tag is not one this build understands.
    #[error("unsupported game struct version {0}")]
    UnsupportedVersion(u32),
}

/// Size and occupancy block of the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDesc {
    /// Record size as advertised.
    pub size: i32,
    /// Session flags, see [`SESSION_JOINDISABLED`].
    pub flags: i32,
    /// Primary host address.
    pub host: String,
    /// Maximum number of players.
    pub max_players: i32,
    /// Players currently in the session.
    pub current_players: i32,
    /// The four user game flags.
    pub user_flags: [i32; 4],
}

/// Session descriptor advertised through the lobby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStruct {
    /// Session name.
    pub name: String,
    /// Size and occupancy block.
    pub desc: SessionDesc,
    /// Alternative host addresses (other address families).
    pub secondary_hosts: [String; SECONDARY_HOSTS],
    /// Free-form extra text.
    pub extra: String,
    /// Human-readable game version.
    pub version_string: String,
    /// Loaded mods.
    pub mod_list: String,
    /// Netcode major version.
    pub game_version_major: u32,
    /// Netcode minor version.
    pub game_version_minor: u32,
    /// Password protected.
    pub private_game: u32,
    /// Unmodified game data.
    pub pure_game: u32,
    /// Number of loaded mods.
    pub mods: u32,
    /// Identifies the same game across address families.
    pub game_id: u32,
    /// Reserved, zero until assigned.
    pub future: [u32; 3],
}

impl Default for GameStruct {
    fn default() -> Self {
        Self {
            name: String::new(),
            desc: SessionDesc {
                size: GAMESTRUCT_SIZE as i32,
                ..SessionDesc::default()
            },
            secondary_hosts: [String::new(), String::new()],
            extra: String::new(),
            version_string: String::new(),
            mod_list: String::new(),
            game_version_major: 0,
            game_version_minor: 0,
            private_game: 0,
            pure_game: 1,
            mods: 0,
            game_id: 0,
            future: [0; 3],
        }
    }
}

impl GameStruct {
    /// Whether joining has been halted.
    pub fn join_disabled(&self) -> bool {
        self.desc.flags & SESSION_JOINDISABLED != 0
    }

    /// Encode to the fixed network layout.
    ///
    /// Strings longer than their field are truncated on a character boundary.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FixedWriter::with_capacity(GAMESTRUCT_SIZE);
        w.u32(GAMESTRUCT_VERSION);
        w.string(&self.name, STRING_SIZE);

        w.i32(self.desc.size);
        w.i32(self.desc.flags);
        w.string(&self.desc.host, HOST_ADDRESS_SIZE);
        w.i32(self.desc.max_players);
        w.i32(self.desc.current_players);
        for flag in self.desc.user_flags {
            w.i32(flag);
        }

        for host in &self.secondary_hosts {
            w.string(host, HOST_ADDRESS_SIZE);
        }
        w.string(&self.extra, EXTRA_STRING_SIZE);
        w.string(&self.version_string, STRING_SIZE);
        w.string(&self.mod_list, MODLIST_STRING_SIZE);
        w.u32(self.game_version_major);
        w.u32(self.game_version_minor);
        w.u32(self.private_game);
        w.u32(self.pure_game);
        w.u32(self.mods);
        w.u32(self.game_id);
        for word in self.future {
            w.u32(word);
        }
        w.finish()
    }

    /// Decode from the fixed network layout.
    pub fn decode(buf: &[u8]) -> Result<Self, GameStructError> {
        if buf.len() != GAMESTRUCT_SIZE {
            return Err(GameStructError::WrongSize {
                expected: GAMESTRUCT_SIZE,
                actual: buf.len(),
            });
        }
        let mut r = FixedReader::new(buf);
        let version = r.u32();
        if version != GAMESTRUCT_VERSION {
            return Err(GameStructError::UnsupportedVersion(version));
        }
        let name = r.string(STRING_SIZE);
        let desc = SessionDesc {
            size: r.i32(),
            flags: r.i32(),
            host: r.string(HOST_ADDRESS_SIZE),
            max_players: r.i32(),
            current_players: r.i32(),
            user_flags: [r.i32(), r.i32(), r.i32(), r.i32()],
        };
        let secondary_hosts = [r.string(HOST_ADDRESS_SIZE), r.string(HOST_ADDRESS_SIZE)];
        Ok(Self {
            name,
            desc,
            secondary_hosts,
            extra: r.string(EXTRA_STRING_SIZE),
            version_string: r.string(STRING_SIZE),
            mod_list: r.string(MODLIST_STRING_SIZE),
            game_version_major: r.u32(),
            game_version_minor: r.u32(),
            private_game: r.u32(),
            pure_game: r.u32(),
            mods: r.u32(),
            game_id: r.u32(),
            future: [r.u32(), r.u32(), r.u32()],
        })
    }
}

/// Truncate `s` to at most `max_bytes` bytes without splitting a character.
pub fn truncate_to(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Fixed-width helpers
// ---------------------------------------------------------------------------

struct FixedWriter {
    buf: Vec<u8>,
}

impl FixedWriter {
    fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// NUL-padded; always leaves room for a terminator.
    fn string(&mut self, s: &str, width: usize) {
        let bytes = truncate_to(s, width - 1).as_bytes();
        self.buf.extend_from_slice(bytes);
        self.buf.resize(self.buf.len() + (width - bytes.len()), 0);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reader over a buffer whose length was checked up front.
struct FixedReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FixedReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_be_bytes(self.take())
    }

    fn string(&mut self, width: usize) -> String {
        let field = &self.buf[self.pos..self.pos + width];
        self.pos += width;
        let end = field.iter().position(|&b| b == 0).unwrap_or(width);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GameStruct {
        GameStruct {
            name: "Sk-Rush 4p".to_string(),
            desc: SessionDesc {
                size: GAMESTRUCT_SIZE as i32,
                flags: 0,
                host: "192.168.1.20".to_string(),
                max_players: 4,
                current_players: 2,
                user_flags: [1, 0, 3, -1],
            },
            secondary_hosts: ["::1".to_string(), String::new()],
            extra: "no tanks".to_string(),
            version_string: "4.0.0".to_string(),
            mod_list: "nullbot".to_string(),
            game_version_major: 2,
            game_version_minor: 3,
            private_game: 1,
            pure_game: 0,
            mods: 1,
            game_id: 0xDEAD_BEEF,
            future: [0; 3],
        }
    }

    #[test]
    fn test_layout_size() {
        assert_eq!(GAMESTRUCT_SIZE, 814);
        assert_eq!(sample().encode().len(), GAMESTRUCT_SIZE);
    }

    #[test]
    fn test_version_tag_leads() {
        let bytes = sample().encode();
        assert_eq!(&bytes[..4], &GAMESTRUCT_VERSION.to_be_bytes());
        assert_eq!(&bytes[4..14], b"Sk-Rush 4p");
        assert_eq!(bytes[14], 0);
    }

    #[test]
    fn test_roundtrip() {
        let gs = sample();
        assert_eq!(GameStruct::decode(&gs.encode()).unwrap(), gs);
    }

    #[test]
    fn test_game_id_offset() {
        // version + name + desc + hosts + extra + version string + mods + 5 words
        let offset = 4 + 64 + 72 + 80 + 239 + 64 + 255 + 5 * 4;
        let bytes = sample().encode();
        assert_eq!(&bytes[offset..offset + 4], &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn test_long_strings_truncate_on_char_boundary() {
        let mut gs = sample();
        gs.name = "é".repeat(40);
        let decoded = GameStruct::decode(&gs.encode()).unwrap();
        assert_eq!(decoded.name, "é".repeat(31));
    }

    #[test]
    fn test_wrong_size_rejected() {
        let bytes = sample().encode();
        assert!(matches!(
            GameStruct::decode(&bytes[..100]),
            Err(GameStructError::WrongSize { actual: 100, .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = sample().encode();
        bytes[3] = 9;
        assert!(matches!(
            GameStruct::decode(&bytes),
            Err(GameStructError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_truncate_to() {
        assert_eq!(truncate_to("abc", 10), "abc");
        assert_eq!(truncate_to("abcdef", 3), "abc");
        assert_eq!(truncate_to("aé", 2), "a");
    }
}
