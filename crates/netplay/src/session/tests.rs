use std::cell::RefCell;
use std::rc::Rc;

use super::*;
use crate::file_transfer::{FileTransferError, MemoryStore};
use crate::lobby::{MemoryLobby, find_games};
use crate::messages::{FileRequest, TextMessage};
use crate::transport::PortMappingError;
use crate::transport::memory::{MemoryNetwork, MemoryTransport};

type TestSession = Session<MemoryTransport>;

const ADDRESS: &str = "host:2100";

fn config() -> SessionConfig {
    SessionConfig {
        max_players: 4,
        ..SessionConfig::default()
    }
}

fn options() -> HostOptions {
    HostOptions {
        session_name: "test game".to_string(),
        player_name: "Host".to_string(),
        port: 2100,
        ..HostOptions::default()
    }
}

fn host(net: &MemoryNetwork, config: SessionConfig) -> TestSession {
    Session::host(net.transport("host"), config, options()).unwrap()
}

fn join(net: &MemoryNetwork, machine: &str, name: &str) -> TestSession {
    Session::join(net.transport(machine), config(), ADDRESS, name, "").unwrap()
}

/// Poll every session a few rounds at `now`.
fn settle(now: Instant, sessions: &mut [&mut TestSession]) {
    for _ in 0..4 {
        for session in sessions.iter_mut() {
            session.poll(now);
        }
    }
}

fn events(session: &mut TestSession) -> Vec<SessionEvent> {
    std::iter::from_fn(|| session.next_event()).collect()
}

fn released(session: &mut TestSession) -> Vec<(u32, Vec<u8>)> {
    std::iter::from_fn(|| session.recv_game())
        .map(|e| (e.game_time, e.payload))
        .collect()
}

fn try_join(
    host_config: SessionConfig,
    host_password: Option<&str>,
    joiner_config: SessionConfig,
    name: &str,
    password: &str,
) -> Option<LobbyError> {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, host_config);
    if let Some(pw) = host_password {
        h.set_game_password(pw).unwrap();
    }
    let mut j =
        Session::join(net.transport("joiner"), joiner_config, ADDRESS, name, password).unwrap();
    settle(t0, &mut [&mut h, &mut j]);
    j.lobby_error()
}

// -- admission ----------------------------------------------------------------

#[test]
fn test_join_populates_roster_everywhere() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    let mut b = join(&net, "beta", "Bob");
    settle(t0, &mut [&mut h, &mut a, &mut b]);

    assert_eq!(h.roster().len(), 3);
    assert_eq!(a.local_player(), PlayerIndex(1));
    assert_eq!(b.local_player(), PlayerIndex(2));
    for client in [&a, &b] {
        assert_eq!(client.state(), ConnectionState::Active);
        assert_eq!(client.roster().len(), 3);
        assert_eq!(client.roster().get(PlayerIndex::HOST).unwrap().name, "Host");
    }
    assert_eq!(a.roster().get(PlayerIndex(2)).unwrap().name, "Bob");
    assert_eq!(b.roster().get(PlayerIndex(1)).unwrap().name, "Alice");
    assert_eq!(h.counters().joins, 2);
    assert_eq!(h.game_struct().desc.current_players, 3);

    assert!(events(&mut a).contains(&SessionEvent::Accepted(PlayerIndex(1))));
    assert!(events(&mut a).is_empty());
    let host_events = events(&mut h);
    assert!(host_events.contains(&SessionEvent::PlayerJoined(PlayerIndex(1))));
    assert!(host_events.contains(&SessionEvent::PlayerJoined(PlayerIndex(2))));
}

#[test]
fn test_full_session_rejects_before_version_check() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(
        &net,
        SessionConfig {
            max_players: 2,
            ..config()
        },
    );
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    let old = SessionConfig {
        version: (99, 0),
        ..config()
    };
    let mut late = Session::join(net.transport("gamma"), old, ADDRESS, "Late", "").unwrap();
    settle(t0, &mut [&mut h, &mut late]);

    assert_eq!(late.lobby_error(), Some(LobbyError::Full));
    assert_eq!(late.state(), ConnectionState::Closed);
    assert!(events(&mut late).contains(&SessionEvent::Rejected(LobbyError::Full)));
    assert_eq!(h.counters().cantjoin, 1);
    assert_eq!(h.counters().rejected, 1);
    assert_eq!(h.roster().len(), 2);
}

#[test]
fn test_rejection_reasons() {
    let old = SessionConfig {
        version: (1, 0),
        ..config()
    };
    assert_eq!(
        try_join(config(), Some("secret"), old, "Alice", "wrong"),
        Some(LobbyError::WrongVersion)
    );
    assert_eq!(
        try_join(config(), Some("secret"), config(), "Alice", "wrong"),
        Some(LobbyError::WrongPassword)
    );
    assert_eq!(
        try_join(config(), Some("secret"), config(), "Alice", "secret"),
        None
    );

    let hashed = SessionConfig {
        data_hash: 7,
        ..config()
    };
    let other = SessionConfig {
        data_hash: 8,
        ..config()
    };
    assert_eq!(
        try_join(hashed, None, other, "Alice", ""),
        Some(LobbyError::WrongData)
    );
    assert_eq!(
        try_join(config(), None, config(), "   ", ""),
        Some(LobbyError::Cheat)
    );
}

#[test]
fn test_unreachable_host() {
    let net = MemoryNetwork::new();
    let Err(err) = Session::join(net.transport("alpha"), config(), ADDRESS, "Alice", "") else {
        panic!("join should fail without a listener");
    };
    assert!(matches!(
        err,
        NetError::Transport(TransportError::ConnectionFailed { .. })
    ));
}

#[test]
fn test_unanswered_join_times_out() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let _silent = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    a.poll(t0);
    assert_eq!(a.state(), ConnectionState::Joining);
    a.poll(t0 + Duration::from_secs(11));
    assert_eq!(a.lobby_error(), Some(LobbyError::Connection));
    assert!(events(&mut a).contains(&SessionEvent::Rejected(LobbyError::Connection)));
}

#[test]
fn test_join_request_waits_for_connection() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    net.hold_connects(true);
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    assert_eq!(a.state(), ConnectionState::Connecting);
    a.poll(t0);
    assert_eq!(a.state(), ConnectionState::Connecting);

    h.poll(t0);
    a.poll(t0);
    assert_eq!(a.state(), ConnectionState::Joining);
    settle(t0, &mut [&mut h, &mut a]);
    assert_eq!(a.state(), ConnectionState::Active);
    assert_eq!(h.roster().len(), 2);
}

#[test]
fn test_pending_connect_times_out() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    net.hold_connects(true);
    let _never_polled = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    a.poll(t0);
    assert_eq!(a.state(), ConnectionState::Connecting);
    a.poll(t0 + Duration::from_secs(11));
    assert_eq!(a.lobby_error(), Some(LobbyError::Connection));
    assert_eq!(a.state(), ConnectionState::Closed);
}

#[test]
fn test_failed_connect_fails_join() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    net.hold_connects(true);
    let _h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    net.sever("host");
    a.poll(t0);
    assert_eq!(a.lobby_error(), Some(LobbyError::Connection));
    assert!(events(&mut a).contains(&SessionEvent::Rejected(LobbyError::Connection)));
}

#[test]
fn test_operations_need_admission() {
    let net = MemoryNetwork::new();
    let _h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    assert!(matches!(a.advance_game_time(1), Err(NetError::NotConnected)));
    assert!(matches!(
        a.send_text(Destination::All, "hello?"),
        Err(NetError::NotConnected)
    ));
}

#[test]
fn test_options_reach_joiner() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = Session::host(
        net.transport("host"),
        config(),
        HostOptions {
            password: Some("pw".to_string()),
            map_file: Some("Sk-Rush".to_string()),
            user_flags: [1, 2, 3, 4],
            ..options()
        },
    )
    .unwrap();
    let mut a = Session::join(net.transport("alpha"), config(), ADDRESS, "Alice", "pw").unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    assert_eq!(a.map_file(), Some("Sk-Rush"));
    assert_eq!(a.game_struct().private_game, 1);
    assert_eq!(a.game_struct().game_id, h.game_struct().game_id);
    assert_eq!(a.game_struct().desc.user_flags, [1, 2, 3, 4]);
    assert!(events(&mut a).contains(&SessionEvent::OptionsReceived));
}

// -- roster changes -----------------------------------------------------------------

#[test]
fn test_duplicate_names_are_resolved() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Host");
    let mut b = join(&net, "beta", "Bob");
    settle(t0, &mut [&mut h, &mut a, &mut b]);

    assert_eq!(h.roster().get(PlayerIndex(1)).unwrap().name, "Host2");
    assert_eq!(a.roster().get(PlayerIndex(1)).unwrap().name, "Host2");
    events(&mut b);

    // The lower slot keeps a clashing name.
    a.change_player_name("Bob").unwrap();
    settle(t0, &mut [&mut a, &mut h, &mut b]);
    assert_eq!(h.roster().get(PlayerIndex(1)).unwrap().name, "Bob");
    assert_eq!(h.roster().get(PlayerIndex(2)).unwrap().name, "Bob2");
    assert_eq!(b.roster().get(PlayerIndex(2)).unwrap().name, "Bob2");
    assert!(events(&mut b).contains(&SessionEvent::PlayerRenamed {
        index: PlayerIndex(2),
        name: "Bob2".to_string()
    }));
}

#[test]
fn test_ready_and_slot_info_propagate() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    let mut b = join(&net, "beta", "Bob");
    settle(t0, &mut [&mut h, &mut a, &mut b]);

    a.set_ready(true).unwrap();
    h.set_player_slot_info(PlayerIndex(2), 3, 5, 1).unwrap();
    settle(t0, &mut [&mut a, &mut h, &mut b]);

    assert!(h.roster().get(PlayerIndex(1)).unwrap().ready);
    assert!(b.roster().get(PlayerIndex(1)).unwrap().ready);
    let bob = a.roster().get(PlayerIndex(2)).unwrap();
    assert_eq!((bob.position, bob.colour, bob.team), (3, 5, 1));
    assert!(matches!(
        a.set_player_slot_info(PlayerIndex(1), 0, 0, 0),
        Err(NetError::NotHost)
    ));
}

#[test]
fn test_leaving_player_is_announced_and_slot_reused() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    let mut b = join(&net, "beta", "Bob");
    settle(t0, &mut [&mut h, &mut a, &mut b]);

    a.leave();
    assert_eq!(a.state(), ConnectionState::Closed);
    settle(t0, &mut [&mut h, &mut b]);

    assert!(!h.roster().contains(PlayerIndex(1)));
    assert_eq!(h.counters().left, 1);
    assert!(!b.roster().contains(PlayerIndex(1)));
    assert!(events(&mut b).contains(&SessionEvent::PlayerLeft(PlayerIndex(1))));

    let mut c = join(&net, "gamma", "Carol");
    settle(t0, &mut [&mut h, &mut b, &mut c]);
    assert_eq!(c.local_player(), PlayerIndex(1));
}

#[test]
fn test_no_joins_after_start() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    h.start_game().unwrap();
    settle(t0, &mut [&mut h, &mut a]);
    assert!(a.has_started());
    assert!(events(&mut a).contains(&SessionEvent::GameStarted));

    let mut late = join(&net, "gamma", "Late");
    settle(t0, &mut [&mut h, &mut late]);
    assert_eq!(late.lobby_error(), Some(LobbyError::Full));
}

#[test]
fn test_kicked_player_is_banned() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    h.kick(PlayerIndex(1)).unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    assert_eq!(a.lobby_error(), Some(LobbyError::Kicked));
    assert!(events(&mut a).contains(&SessionEvent::Kicked));
    assert!(!h.roster().contains(PlayerIndex(1)));
    assert!(events(&mut h).contains(&SessionEvent::PlayerKicked(PlayerIndex(1))));
    assert_eq!(h.counters().kicks, 1);
    assert_eq!(h.bans().len(), 1);

    let mut again = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut again]);
    assert_eq!(again.lobby_error(), Some(LobbyError::Kicked));
    assert_eq!(h.counters().banned, 1);
}

#[test]
fn test_kick_grace_expires() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    h.poll(t0);

    h.kick(PlayerIndex(1)).unwrap();
    h.poll(t0 + Duration::from_secs(1));
    assert!(h.roster().contains(PlayerIndex(1)));
    h.poll(t0 + Duration::from_secs(3));
    assert!(!h.roster().contains(PlayerIndex(1)));
    assert!(matches!(
        h.kick(PlayerIndex::HOST),
        Err(NetError::UnknownPlayer(_))
    ));
}

// -- routing ------------------------------------------------------------------------

#[test]
fn test_direct_message_is_relayed_by_host() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    let mut b = join(&net, "beta", "Bob");
    settle(t0, &mut [&mut h, &mut a, &mut b]);

    a.send_text(Destination::Player(PlayerIndex(2)), "hi bob")
        .unwrap();
    a.poll(t0);
    b.poll(t0);
    assert!(b.recv_net().is_none());
    assert_eq!(h.stats().relayed, 0);

    h.poll(t0);
    assert_eq!(h.stats().relayed, 1);
    assert!(h.recv_net().is_none());

    b.poll(t0);
    let envelope = b.recv_net().unwrap();
    assert_eq!(envelope.source, PlayerIndex(1));
    assert_eq!(envelope.net_type(), Some(NetMessageType::TextMsg));
    let text: TextMessage = envelope.decode_payload().unwrap();
    assert_eq!(text.text, "hi bob");
}

#[test]
fn test_broadcast_reaches_everyone_but_sender() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    let mut b = join(&net, "beta", "Bob");
    settle(t0, &mut [&mut h, &mut a, &mut b]);

    a.send_text(Destination::All, "gg").unwrap();
    settle(t0, &mut [&mut a, &mut h, &mut b]);

    assert!(h.recv_net().is_some());
    assert!(b.recv_net().is_some());
    assert!(a.recv_net().is_none());
}

#[test]
fn test_spoofed_and_garbage_frames_are_dropped() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    h.poll(t0);

    let payload = encode_payload(&TextMessage {
        text: "i am bob".to_string(),
    })
    .unwrap();
    let forged = Envelope::net(
        NetMessageType::TextMsg,
        PlayerIndex(2),
        Destination::All,
        payload,
    );
    let link = ConnectionHandle(1);
    a.transport_mut()
        .send(link, &codec::encode(&forged).unwrap())
        .unwrap();
    a.transport_mut()
        .send(link, &[200, 1, 0, 0, 0, 0, 0, 0, 0])
        .unwrap();
    h.poll(t0);

    assert_eq!(h.stats().routing_dropped, 1);
    assert_eq!(h.stats().malformed, 1);
    assert!(h.recv_net().is_none());
    assert!(h.roster().contains(PlayerIndex(1)));
}

#[test]
fn test_repeated_malformed_frames_drop_player() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(
        &net,
        SessionConfig {
            malformed_limit: 2,
            ..config()
        },
    );
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    events(&mut h);

    let link = ConnectionHandle(1);
    for _ in 0..2 {
        a.transport_mut()
            .send(link, &[200, 1, 0, 0, 0, 0, 0, 0, 0])
            .unwrap();
    }
    h.poll(t0);
    assert!(h.roster().contains(PlayerIndex(1)));

    a.transport_mut()
        .send(link, &[200, 1, 0, 0, 0, 0, 0, 0, 0])
        .unwrap();
    h.poll(t0);
    assert_eq!(h.stats().malformed, 3);
    assert!(!h.roster().contains(PlayerIndex(1)));
    assert!(events(&mut h).contains(&SessionEvent::PlayerDropped(PlayerIndex(1))));
}

#[test]
fn test_oversized_length_prefix_drops_connection() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    events(&mut h);

    // A header claiming 65535 payload bytes can never be framed.
    a.transport_mut()
        .send(ConnectionHandle(1), &[200, 1, 0, 0, 0, 0, 0, 0xff, 0xff])
        .unwrap();
    h.poll(t0);

    assert_eq!(h.stats().malformed, 1);
    assert!(!h.roster().contains(PlayerIndex(1)));
    assert!(events(&mut h).contains(&SessionEvent::PlayerDropped(PlayerIndex(1))));
    a.poll(t0);
    assert_eq!(a.lobby_error(), Some(LobbyError::HostDropped));
}

#[test]
fn test_oversized_payload_is_refused() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    let result = a.send(
        NetMessageType::TextMsg,
        Destination::All,
        vec![0; codec::MAX_MSG_SIZE],
    );
    assert!(matches!(
        result,
        Err(NetError::Codec(codec::CodecError::TooLarge { .. }))
    ));
}

// -- game time ----------------------------------------------------------------------

#[test]
fn test_game_messages_wait_for_every_player() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    h.send_game(GameMessageType::Droid, Destination::All, vec![1])
        .unwrap();
    a.send_game(GameMessageType::StructureInfo, Destination::All, vec![2])
        .unwrap();
    h.advance_game_time(100).unwrap();
    settle(t0, &mut [&mut h, &mut a]);
    assert!(h.recv_game().is_none());
    assert!(a.recv_game().is_none());

    a.advance_game_time(100).unwrap();
    h.send_game(GameMessageType::Droid, Destination::All, vec![3])
        .unwrap();
    a.send_game(GameMessageType::StructureInfo, Destination::All, vec![4])
        .unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    // Only the time-0 messages are past everyone; the local copy arrived first.
    let first = released(&mut h);
    assert_eq!(first, vec![(0, vec![1]), (0, vec![2])]);

    h.advance_game_time(200).unwrap();
    a.advance_game_time(200).unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    let rest = released(&mut h);
    assert_eq!(rest, vec![(100, vec![3]), (100, vec![4])]);

    let everything = released(&mut a);
    assert_eq!(
        everything,
        vec![
            (0, vec![2]),
            (0, vec![1]),
            (100, vec![4]),
            (100, vec![3]),
        ]
    );
}

#[test]
fn test_waiting_for_lagging_player() {
    let t0 = Instant::now();
    let t1 = t0 + Duration::from_secs(1);
    let net = MemoryNetwork::new();
    let mut h = host(
        &net,
        SessionConfig {
            wait_timeout: Duration::from_secs(3),
            ..config()
        },
    );
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    h.start_game().unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    h.advance_game_time(100).unwrap();
    settle(t1, &mut [&mut h, &mut a]);
    let waiting = ConnectionStatus::WAITING_FOR_PLAYER;
    assert!(h.connection_status(PlayerIndex(1)).unwrap().contains(waiting));
    assert!(events(&mut h).contains(&SessionEvent::WaitingForPlayer(PlayerIndex(1))));

    a.advance_game_time(100).unwrap();
    settle(t1, &mut [&mut a, &mut h]);
    assert!(!h.connection_status(PlayerIndex(1)).unwrap().contains(waiting));

    h.advance_game_time(200).unwrap();
    settle(t1, &mut [&mut h, &mut a]);
    h.poll(t1 + Duration::from_secs(4));
    assert!(!h.roster().contains(PlayerIndex(1)));
    assert!(events(&mut h).contains(&SessionEvent::PlayerDropped(PlayerIndex(1))));
}

// -- sync debug -----------------------------------------------------------------------

#[test]
fn test_matching_sync_is_quiet_even_when_deferred() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    events(&mut h);

    crate::sync_debug!(h.sync_debug_mut(), "power {}", 100);
    crate::sync_debug!(a.sync_debug_mut(), "power {}", 100);

    // The client's report arrives before the host closed its own window.
    a.advance_game_time(100).unwrap();
    settle(t0, &mut [&mut a, &mut h]);
    h.advance_game_time(100).unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    assert!(h.connection_status(PlayerIndex(1)).unwrap().is_normal());
    assert!(
        !events(&mut h)
            .iter()
            .any(|e| matches!(e, SessionEvent::Desync { .. }))
    );
}

#[test]
fn test_desync_marks_players_and_play_continues() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    crate::sync_debug!(h.sync_debug_mut(), "power {}", 100);
    crate::sync_debug!(a.sync_debug_mut(), "power {}", 101);
    h.advance_game_time(100).unwrap();
    a.advance_game_time(100).unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    let desync = ConnectionStatus::DESYNC;
    assert!(h.connection_status(PlayerIndex(1)).unwrap().contains(desync));
    assert!(h.connection_status(PlayerIndex::HOST).unwrap().contains(desync));
    assert!(a.connection_status(PlayerIndex(1)).unwrap().contains(desync));
    assert!(events(&mut h).contains(&SessionEvent::Desync {
        player: PlayerIndex(1),
        game_time: 0
    }));

    h.send_text(Destination::All, "still here").unwrap();
    settle(t0, &mut [&mut h, &mut a]);
    assert!(a.recv_net().is_some());
}

#[test]
fn test_client_dump_reaches_host() {
    let t0 = Instant::now();
    let dir = tempfile::tempdir().unwrap();
    let net = MemoryNetwork::new();
    let mut h = host(
        &net,
        SessionConfig {
            sync_dump_dir: Some(dir.path().to_path_buf()),
            ..config()
        },
    );
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    crate::sync_debug!(h.sync_debug_mut(), "droid {} hp {}", 7, 90);
    crate::sync_debug!(a.sync_debug_mut(), "droid {} hp {}", 7, 89);
    h.advance_game_time(100).unwrap();
    a.advance_game_time(100).unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    let own = std::fs::read_to_string(dir.path().join("desync0_p0.txt")).unwrap();
    assert!(own.contains("droid 7 hp 90"));
    let remote = std::fs::read_to_string(dir.path().join("desync0_p1.txt")).unwrap();
    assert!(remote.contains("droid 7 hp 89"));
}

#[test]
fn test_teardown_clears_diagnostics() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    crate::sync_debug!(a.sync_debug_mut(), "power {}", 100);
    a.advance_game_time(100).unwrap();
    crate::sync_debug!(a.sync_debug_mut(), "power {}", 90);
    assert_eq!(a.sync_debug().latest_time(), Some(0));
    assert!(a.stats().bytes_sent > 0);

    a.leave();
    assert_eq!(a.state(), ConnectionState::Closed);
    assert_eq!(a.sync_debug().latest_time(), None);
    assert!(a.sync_debug().pending_lines().is_empty());
    assert_eq!(a.stats().bytes_sent, 0);
    assert_eq!(a.counters(), &SyncCounters::default());

    assert_eq!(h.counters().joins, 1);
    h.close();
    assert_eq!(h.counters(), &SyncCounters::default());
}

// -- liveness -------------------------------------------------------------------------

#[test]
fn test_silent_player_times_out() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    h.poll(t0);

    h.poll(t0 + Duration::from_secs(11));
    assert!(!h.roster().contains(PlayerIndex(1)));
    assert!(events(&mut h).contains(&SessionEvent::PlayerDropped(PlayerIndex(1))));
    assert_eq!(h.counters().drops, 1);
}

#[test]
fn test_silent_host_is_lost() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    a.poll(t0 + Duration::from_secs(11));
    assert_eq!(a.lobby_error(), Some(LobbyError::HostDropped));
    assert_eq!(a.state(), ConnectionState::Dropped);
}

#[test]
fn test_host_loss_halts_game_release() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    h.send_game(GameMessageType::Droid, Destination::All, vec![9])
        .unwrap();
    h.advance_game_time(100).unwrap();
    a.advance_game_time(100).unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    net.sever("host");
    a.poll(t0);

    assert_eq!(a.lobby_error(), Some(LobbyError::HostDropped));
    assert!(a.recv_game().is_none());
    assert!(
        a.roster()
            .iter()
            .all(|p| p.status.contains(ConnectionStatus::DROPPED))
    );
    assert!(events(&mut a).contains(&SessionEvent::HostDropped));
    assert!(a.send_text(Destination::All, "anyone?").is_err());
}

#[test]
fn test_ping_measures_round_trip() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    settle(t0 + Duration::from_secs(1), &mut [&mut h, &mut a]);

    assert!(h.counters().sent_ping > 0);
    let alice = h.roster().get(PlayerIndex(1)).unwrap();
    assert!(alice.ping.snapshot().samples > 0);
    let host_seen_by_a = a.roster().get(PlayerIndex::HOST).unwrap();
    assert!(host_seen_by_a.ping.snapshot().samples > 0);
}

// -- lobby and flags --------------------------------------------------------------------

#[test]
fn test_lobby_record_tracks_session() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let lobby = Rc::new(RefCell::new(MemoryLobby::new()));
    let mut h = host(&net, config());
    h.attach_lobby(Box::new(lobby.clone()));
    assert_eq!(find_games(&lobby).unwrap()[0].desc.current_players, 1);

    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    assert_eq!(find_games(&lobby).unwrap()[0].desc.current_players, 2);

    h.halt_joining().unwrap();
    h.poll(t0);
    assert!(find_games(&lobby).unwrap().is_empty());
    assert_eq!(lobby.borrow().len(), 1);

    h.close();
    assert!(lobby.borrow().is_empty());
    a.poll(t0);
    assert_eq!(a.lobby_error(), Some(LobbyError::HostDropped));
}

#[test]
fn test_game_flags_propagate() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    events(&mut a);

    h.set_game_flag(2, 7).unwrap();
    settle(t0, &mut [&mut h, &mut a]);

    assert_eq!(h.game_flag(2).unwrap(), 7);
    assert_eq!(a.game_flag(2).unwrap(), 7);
    assert!(events(&mut a).contains(&SessionEvent::GameFlagsChanged([0, 7, 0, 0])));
    assert!(matches!(h.set_game_flag(5, 1), Err(NetError::InvalidFlag(5))));
    assert!(matches!(a.set_game_flag(1, 1), Err(NetError::NotHost)));
}

#[test]
fn test_password_can_be_reset() {
    let net = MemoryNetwork::new();
    let mut h = host(&net, config());
    h.set_game_password("pw").unwrap();
    assert_eq!(h.game_struct().private_game, 1);
    h.reset_game_password().unwrap();
    assert_eq!(h.game_struct().private_game, 0);
}

struct FailingMapper {
    removed: Rc<RefCell<Vec<u16>>>,
}

impl PortMapper for FailingMapper {
    fn add_redirect(&mut self, _port: u16) -> Result<(), PortMappingError> {
        Err(PortMappingError::Unavailable)
    }

    fn remove_redirect(&mut self, port: u16) -> Result<(), PortMappingError> {
        self.removed.borrow_mut().push(port);
        Err(PortMappingError::Refused("gateway busy".to_string()))
    }
}

#[test]
fn test_port_mapping_failures_are_ignored() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let removed = Rc::new(RefCell::new(Vec::new()));
    let mut h = host(&net, config());
    h.attach_port_mapper(Box::new(FailingMapper {
        removed: removed.clone(),
    }));
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    assert_eq!(h.roster().len(), 2);
    assert_eq!(a.state(), ConnectionState::Active);

    h.close();
    assert_eq!(*removed.borrow(), vec![2100]);
    assert_eq!(h.state(), ConnectionState::Closed);
    a.poll(t0);
    assert_eq!(a.lobby_error(), Some(LobbyError::HostDropped));
}

// -- files ------------------------------------------------------------------------------

fn map_data() -> Vec<u8> {
    (0..20_000u32).map(|i| (i % 251) as u8).collect()
}

fn with_map(net: &MemoryNetwork) -> TestSession {
    let mut store = MemoryStore::new();
    store.insert("Sk-Rush.wz", map_data());
    let mut h = host(net, config());
    h.attach_file_store(Box::new(store));
    h
}

#[test]
fn test_file_transfer_end_to_end() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = with_map(&net);
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    a.request_file("Sk-Rush.wz", FileType::Map).unwrap();
    for _ in 0..5 {
        settle(t0, &mut [&mut a, &mut h]);
    }

    assert!(events(&mut a).contains(&SessionEvent::FileReceived {
        file_id: "Sk-Rush.wz".to_string()
    }));
    assert!(events(&mut h).contains(&SessionEvent::FileRequested {
        player: PlayerIndex(1),
        file_id: "Sk-Rush.wz".to_string()
    }));
    assert!(a.file_store().contains("Sk-Rush.wz"));
    assert!(h.file_status().is_empty());
    assert!(a.file_status().is_empty());
    assert!(matches!(
        a.request_file("Sk-Rush.wz", FileType::Map),
        Err(NetError::FileTransfer(FileTransferError::AlreadyHaveFile(_)))
    ));
    assert!(matches!(
        h.request_file("Sk-Rush.wz", FileType::Map),
        Err(NetError::IsHost)
    ));
}

#[test]
fn test_repeated_range_is_refused_as_loop() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = with_map(&net);
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);
    a.request_file("Sk-Rush.wz", FileType::Map).unwrap();
    for _ in 0..5 {
        settle(t0, &mut [&mut a, &mut h]);
    }
    events(&mut a);

    let again = FileRequest {
        file_id: "Sk-Rush.wz".to_string(),
        file_type: FileType::Map,
        offset: 0,
    };
    a.send(
        NetMessageType::FileRequested,
        Destination::HOST_ONLY,
        encode_payload(&again).unwrap(),
    )
    .unwrap();
    settle(t0, &mut [&mut a, &mut h]);

    assert!(events(&mut a).contains(&SessionEvent::FileFailed {
        file_id: "Sk-Rush.wz".to_string(),
        fault: Some(FileFault::StuckInFileLoop)
    }));
}

#[test]
fn test_missing_file_is_refused() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = with_map(&net);
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    a.request_file("nope.wz", FileType::Map).unwrap();
    assert_eq!(a.file_status().len(), 1);
    settle(t0, &mut [&mut a, &mut h]);

    assert!(events(&mut a).contains(&SessionEvent::FileFailed {
        file_id: "nope.wz".to_string(),
        fault: Some(FileFault::Unavailable)
    }));
    assert!(a.file_status().is_empty());
    assert!(!a.file_store().contains("nope.wz"));
}

#[test]
fn test_cancel_stops_sending() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    let mut h = Session::host(
        net.transport("host"),
        SessionConfig {
            file_chunks_per_tick: 1,
            ..config()
        },
        options(),
    )
    .unwrap();
    let mut store = MemoryStore::new();
    store.insert("Sk-Rush.wz", map_data());
    h.attach_file_store(Box::new(store));
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    a.request_file("Sk-Rush.wz", FileType::Map).unwrap();
    a.poll(t0);
    h.poll(t0);
    assert_eq!(h.file_status().len(), 1);

    assert!(a.cancel_file("Sk-Rush.wz"));
    settle(t0, &mut [&mut a, &mut h]);
    assert!(h.file_status().is_empty());
    assert!(!a.file_store().contains("Sk-Rush.wz"));
}

#[test]
fn test_file_chunks_pause_for_backed_up_player() {
    let t0 = Instant::now();
    let net = MemoryNetwork::new();
    // Noise, so chunks stay full size after compression.
    let mut seed = 0x2545_f491_u32;
    let big: Vec<u8> = (0..512 * 1024)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed >> 24) as u8
        })
        .collect();
    let mut store = MemoryStore::new();
    store.insert("big.wz", big.clone());
    let mut h = host(&net, config());
    h.attach_file_store(Box::new(store));
    let mut a = join(&net, "alpha", "Alice");
    settle(t0, &mut [&mut h, &mut a]);

    a.request_file("big.wz", FileType::Map).unwrap();
    a.poll(t0);
    // Alice stops reading while the host keeps polling.
    for _ in 0..100 {
        h.poll(t0);
    }
    assert!(net.in_flight("alpha") <= FILE_BACKLOG_LIMIT + 2 * MAX_MSG_SIZE);
    assert_eq!(h.file_status().len(), 1);
    assert!(h.file_status()[0].byte_count < big.len() as u64);

    for _ in 0..30 {
        settle(t0, &mut [&mut a, &mut h]);
    }
    assert!(events(&mut a).contains(&SessionEvent::FileReceived {
        file_id: "big.wz".to_string()
    }));
    assert!(h.file_status().is_empty());
}
