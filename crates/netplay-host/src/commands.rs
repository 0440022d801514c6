//! Console input: chat lines and slash commands.

use netplay::PlayerIndex;

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Broadcast chat.
    Say(String),
    /// Chat to a single player: `/msg <slot> <text>`.
    Whisper(PlayerIndex, String),
    /// Host only: lock the roster and fire up the game.
    Start,
    /// Host only: `/kick <slot>`.
    Kick(PlayerIndex),
    /// Print the roster.
    Players,
    /// Leave (or close, when hosting).
    Quit,
}

/// Parse one line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };
    let (word, arg) = match rest.split_once(char::is_whitespace) {
        Some((word, arg)) => (word, arg.trim()),
        None => (rest, ""),
    };
    let command = match word {
        "start" => Command::Start,
        "players" => Command::Players,
        "quit" | "exit" => Command::Quit,
        "kick" => Command::Kick(slot(arg)?),
        "msg" => {
            let (to, text) = arg
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: /msg <slot> <text>".to_string())?;
            Command::Whisper(slot(to)?, text.trim().to_string())
        }
        other => return Err(format!("unknown command /{other}")),
    };
    Ok(Some(command))
}

fn slot(arg: &str) -> Result<PlayerIndex, String> {
    arg.parse::<u8>()
        .map(PlayerIndex)
        .map_err(|_| format!("not a player slot: {arg:?}"))
}
