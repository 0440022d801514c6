//! Console netplay peer: hosts or joins a session over TCP and drives it.
//!
//! Lines typed on stdin are broadcast as chat; see [`commands`] for the slash
//! commands. Ctrl-C leaves the session, or closes it when hosting.
//!
//! Run with: `cargo run -p netplay-host -- --host --name Alice`

mod commands;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use netplay::messages::TextMessage;
use netplay::{
    ConnectionState, Destination, DirectoryStore, FileType, HostOptions, MessageType, NetError,
    NetMessageType, PlayerIndex, Session, SessionEvent, SocketConfig, TcpTransport,
    TransportError,
};
use netplay_config::{CliArgs, Config, default_config_dir};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::commands::Command;

/// How often the session is polled.
const TICK: Duration = Duration::from_millis(50);

type TcpSession = Session<TcpTransport>;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(|| default_config_dir().ok())
        .unwrap_or_else(|| PathBuf::from(".netplay"));
    let (mut config, load_error) = match Config::load_or_create(&config_dir) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    config.apply_cli_overrides(&args);

    netplay_log::init_logging(
        Some(&config_dir.join("logs")),
        cfg!(debug_assertions),
        Some(&config),
    );
    if let Some(e) = load_error {
        warn!("Using default config: {e}");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(&args, &config, &config_dir)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &CliArgs, config: &Config, config_dir: &Path) -> Result<(), NetError> {
    let mut session = open_session(args, config).await?;
    match DirectoryStore::new(config_dir.join("data")) {
        Ok(store) => session.attach_file_store(Box::new(store)),
        Err(e) => warn!("File transfer limited to memory: {e}"),
    }

    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                session.poll(Instant::now());
                drain(&mut session);
                if is_over(&session) {
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_line(&mut session, &line) {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Console input closed: {e}");
                    stdin_open = false;
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    if !is_over(&session) {
        session.leave();
    }
    Ok(())
}

/// Resolve `address` off the session thread; the transport only takes literal addresses.
async fn resolve(address: &str) -> Result<String, NetError> {
    let failed = |reason: String| TransportError::ConnectionFailed {
        address: address.to_string(),
        reason,
    };
    let mut candidates = tokio::net::lookup_host(address)
        .await
        .map_err(|e| failed(e.to_string()))?;
    let resolved = candidates
        .next()
        .ok_or_else(|| failed("no addresses resolved".to_string()))?;
    Ok(resolved.to_string())
}

async fn open_session(args: &CliArgs, config: &Config) -> Result<TcpSession, NetError> {
    let transport = TcpTransport::new(SocketConfig {
        connect_timeout: Duration::from_secs(config.network.connect_timeout_secs),
        ..SocketConfig::default()
    });
    let name = &config.player.name;

    if let Some(address) = args.join_address(config) {
        let resolved = resolve(&address).await?;
        info!("Joining {address} ({resolved}) as {name}");
        return Session::join(
            transport,
            config.session_config(),
            &resolved,
            name,
            config.password().unwrap_or_default(),
        );
    }
    if !args.host {
        info!("No --join address given, hosting");
    }
    let options = HostOptions {
        session_name: format!("{name}'s game"),
        player_name: name.clone(),
        port: config.network.game_port,
        password: config.password().map(str::to_string),
        map_file: args.map.clone(),
        version_string: format!("netplay-host {}", env!("CARGO_PKG_VERSION")),
        ..HostOptions::default()
    };
    info!("Hosting on port {}", options.port);
    Session::host(transport, config.session_config(), options)
}

fn is_over(session: &TcpSession) -> bool {
    matches!(
        session.state(),
        ConnectionState::Closed | ConnectionState::Dropped
    )
}

fn player_name(session: &TcpSession, index: PlayerIndex) -> String {
    session
        .roster()
        .get(index)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| format!("player {index}"))
}

/// Report events and incoming chat. Game traffic has no consumer here and is discarded.
fn drain(session: &mut TcpSession) {
    while let Some(event) = session.next_event() {
        on_event(session, event);
    }
    while let Some(envelope) = session.recv_net() {
        if envelope.message_type != MessageType::Net(NetMessageType::TextMsg) {
            continue;
        }
        match envelope.decode_payload::<TextMessage>() {
            Ok(message) => info!("<{}> {}", player_name(session, envelope.source), message.text),
            Err(e) => warn!("Unreadable chat from player {}: {e}", envelope.source),
        }
    }
    while session.recv_game().is_some() {}
}

fn on_event(session: &mut TcpSession, event: SessionEvent) {
    match event {
        SessionEvent::Accepted(index) => info!("Joined as player {index}"),
        SessionEvent::Rejected(reason) => warn!("Join refused: {reason}"),
        SessionEvent::PlayerJoined(index) => {
            info!("{} joined", player_name(session, index));
        }
        SessionEvent::OptionsReceived => request_map(session),
        SessionEvent::FileReceived { file_id } => info!("Received {file_id}"),
        SessionEvent::FileFailed { file_id, fault } => {
            warn!("Transfer of {file_id} failed: {fault:?}");
        }
        SessionEvent::Desync { player, game_time } => {
            warn!("Out of sync with player {player} at game time {game_time}");
        }
        SessionEvent::HostDropped => warn!("Host left, session over"),
        SessionEvent::Kicked => warn!("Kicked from the session"),
        other => info!("{other:?}"),
    }
}

fn request_map(session: &mut TcpSession) {
    let Some(map) = session.map_file().map(str::to_string) else {
        return;
    };
    if session.is_host() || session.file_store().contains(&map) {
        return;
    }
    info!("Requesting map {map}");
    if let Err(e) = session.request_file(&map, FileType::Map) {
        warn!("Cannot request {map}: {e}");
    }
}

/// Apply one console line. Returns `false` when the user asked to quit.
fn handle_line(session: &mut TcpSession, line: &str) -> bool {
    let command = match commands::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(e) => {
            warn!("{e}");
            return true;
        }
    };
    let result = match command {
        Command::Say(text) => session.send_text(Destination::All, &text),
        Command::Whisper(to, text) => session.send_text(Destination::Player(to), &text),
        Command::Start => session.start_game(),
        Command::Kick(index) => session.kick(index),
        Command::Players => {
            for player in session.roster().iter() {
                info!(
                    "{}: {} ({:?}, status {:?})",
                    player.index, player.name, player.state, player.status
                );
            }
            Ok(())
        }
        Command::Quit => return false,
    };
    if let Err(e) = result {
        warn!("{e}");
    }
    true
}
