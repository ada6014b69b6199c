//! Protocol engine behaviour over a socket pair.

#![allow(clippy::unwrap_used)]

mod common;

use std::cell::RefCell;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use common::{Peer, pair, shm_key};
use rts::status::BOP_EXPOSURE;
use rts::{
    Command, CommandStatus, ConnId, ConnState, Connection, ConnectionConfig, DataType,
    E_CONNECTION, Error, Event, Originator, Outcome, SharedSegment, Value, ValueData, ValueOp,
};

#[derive(Default)]
struct Recorder {
    outcomes: RefCell<Vec<(String, Outcome)>>,
}

impl Originator for Recorder {
    fn command_returned(&self, command: &Command, outcome: Outcome) {
        self.outcomes
            .borrow_mut()
            .push((command.text().to_owned(), outcome));
    }
}

fn connection(config: &ConnectionConfig) -> (Connection, Peer) {
    let (socket, peer) = pair();
    let conn = Connection::new(ConnId::new(1), "T0", socket, config).unwrap();
    (conn, peer)
}

fn connected_pair() -> (Connection, Connection) {
    let (a, b) = UnixStream::pair().unwrap();
    let config = ConnectionConfig::default();
    let sender = Connection::new(ConnId::new(1), "C0", Box::new(a), &config).unwrap();
    let receiver = Connection::new(ConnId::new(2), "client", Box::new(b), &config).unwrap();
    (sender, receiver)
}

#[test]
fn commands_are_serialized_and_gated() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    conn.que_command(Command::new("expose 10").with_not_bop(BOP_EXPOSURE));
    conn.que_command(Command::new("filter 2"));
    assert_eq!(peer.line(), "expose 10");
    assert!(peer.quiet(), "second command pipelined");

    peer.send(&format!("S {BOP_EXPOSURE} exposing"));
    peer.send("+000");
    conn.receive();
    assert_eq!(peer.line(), "filter 2");
    assert_eq!(conn.bop_state(), BOP_EXPOSURE);

    conn.que_command(Command::new("expose 5").with_not_bop(BOP_EXPOSURE));
    peer.send("+000");
    conn.receive();
    assert!(peer.quiet(), "gated command sent while exposing");
    assert_eq!(
        conn.queue().running().map(|(c, s)| (c.text(), s)),
        Some(("expose 5", CommandStatus::Waiting))
    );
    assert!(!conn.que_empty());

    peer.send("S 0");
    conn.receive();
    assert_eq!(peer.line(), "expose 5");
    peer.send("+000");
    conn.receive();
    assert!(conn.que_empty());

    let returned: Vec<String> = conn
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            Event::CommandReturned { command, .. } => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(returned, ["expose 10", "filter 2", "expose 5"]);
}

#[test]
fn state_change_is_reported_once() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    peer.send(&format!("S {BOP_EXPOSURE} exposing"));
    peer.send(&format!("S {BOP_EXPOSURE}"));
    conn.receive();
    let changes: Vec<Event> = conn
        .take_events()
        .into_iter()
        .filter(|e| matches!(e, Event::StateChanged { .. }))
        .collect();
    assert_eq!(changes.len(), 1, "unchanged state reported");
    assert!(matches!(
        &changes[0],
        Event::StateChanged { old, new, message }
            if old.bits() == 0 && new.bits() == BOP_EXPOSURE && message.as_deref() == Some("exposing")
    ));
    assert!(conn.is_idle());
    assert_eq!(conn.state_string(), conn.state().to_string());
}

#[test]
fn immediate_command_bypasses_bop() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    peer.send(&format!("S {BOP_EXPOSURE}"));
    conn.receive();
    conn.que_command(Command::new("move 10 20").with_not_bop(BOP_EXPOSURE));
    assert!(peer.quiet());
    conn.que_send(Command::new("stop"));
    assert_eq!(peer.line(), "stop");
    peer.send("+000");
    conn.receive();
    assert!(peer.quiet());
    assert_eq!(conn.queue().len(), 1);
}

#[test]
fn cleared_queue_swallows_orphan_reply() {
    let recorder = Rc::new(Recorder::default());
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    conn.que_command(Command::new("a").with_originator(recorder.clone()));
    conn.que_command(Command::new("b").with_originator(recorder.clone()));
    assert_eq!(peer.line(), "a");

    conn.que_clear();
    assert!(conn.que_empty());
    conn.que_command(Command::new("c"));
    assert!(peer.quiet(), "command sent before the cleared one returned");

    peer.send("+000");
    conn.receive();
    assert_eq!(peer.line(), "c");
    assert!(recorder.outcomes.borrow().is_empty());
    assert!(
        !conn
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::CommandReturned { command, .. } if command == "a"))
    );
}

#[test]
fn originator_receives_reply_code() {
    let recorder = Rc::new(Recorder::default());
    let originator: Rc<dyn Originator> = recorder.clone();
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    conn.que_command(Command::new("expose -1").with_originator(originator.clone()));
    assert!(conn.command_originator_pending(&originator));
    assert_eq!(peer.line(), "expose -1");
    peer.send("-003 invalid exposure time");
    conn.receive();
    assert!(conn.que_empty_for_originator(&originator));
    assert_eq!(
        *recorder.outcomes.borrow(),
        [("expose -1".to_owned(), Outcome::Failed(-3))]
    );
}

#[test]
fn eof_fails_every_command() {
    let recorder = Rc::new(Recorder::default());
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    conn.que_command(Command::new("expose 10").with_originator(recorder.clone()));
    conn.que_command(Command::new("readout").with_originator(recorder.clone()));
    assert_eq!(peer.line(), "expose 10");
    drop(peer);

    conn.receive();
    assert_eq!(conn.conn_state(), ConnState::Broken);
    assert!(conn.que_empty());
    assert_eq!(
        *recorder.outcomes.borrow(),
        [
            ("expose 10".to_owned(), Outcome::Failed(E_CONNECTION)),
            ("readout".to_owned(), Outcome::Failed(E_CONNECTION)),
        ]
    );
    let events = conn.take_events();
    assert!(events.iter().any(|e| matches!(e, Event::Broken { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::CommandReturned { .. }))
            .count(),
        2
    );
    assert!(matches!(conn.send_line("info"), Err(Error::NotConnected(_))));
}

#[test]
fn binary_channels_track_progress() {
    let (mut sender, mut receiver) = connected_pair();
    let dc = sender.start_binary_data(DataType::I16, &[100, 200]).unwrap();
    assert!(!sender.send_binary_data(dc, 1, &[1; 100]).unwrap());
    assert!(!sender.send_binary_data(dc, 1, &[2; 50]).unwrap());
    assert!(matches!(
        sender.send_binary_data(dc, 1, &[3; 150]),
        Err(Error::ChannelOverflow { remaining: 50, .. })
    ));
    assert_eq!(sender.write_binary_data_size_channel(dc, 1), 50);
    assert!(sender.send_binary_data(dc, 1, &[4; 50]).unwrap());
    assert_eq!(sender.write_binary_data_size_channel(dc, 1), 0);
    assert_eq!(sender.write_binary_data_size_channel(dc, 0), 100);
    assert_eq!(sender.write_binary_data_size(dc), 100);
    assert_eq!(sender.write_binary_data_size(dc + 1), 0);

    receiver.receive();
    let events = receiver.take_events();
    assert!(events.contains(&Event::DataStart {
        data_conn: dc,
        data_type: DataType::I16,
        sizes: vec![100, 200],
    }));
    let complete: Vec<(usize, Vec<u8>)> = events
        .into_iter()
        .filter_map(|e| match e {
            Event::DataComplete { chan, data, .. } => Some((chan, data)),
            _ => None,
        })
        .collect();
    let mut expected = vec![1; 100];
    expected.extend([2; 50]);
    expected.extend([4; 50]);
    assert_eq!(complete, [(1, expected)]);
    let open = receiver.read_channels().channel(dc, 0).unwrap();
    assert_eq!((open.transferred(), open.size()), (0, 100));
    assert!(receiver.read_channels().channel(dc, 1).is_none());
}

#[test]
fn concurrent_transfers_get_distinct_ids() {
    let (mut sender, mut receiver) = connected_pair();
    let first = sender.start_binary_data(DataType::U8, &[3]).unwrap();
    let second = sender.start_binary_data(DataType::U8, &[2]).unwrap();
    assert_ne!(first, second);
    sender.send_binary_data(second, 0, b"yz").unwrap();
    sender.send_binary_data(first, 0, b"abc").unwrap();
    receiver.receive();
    let data: Vec<(i32, Vec<u8>)> = receiver
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            Event::DataComplete {
                data_conn, data, ..
            } => Some((data_conn, data)),
            _ => None,
        })
        .collect();
    assert_eq!(data, [(second, b"yz".to_vec()), (first, b"abc".to_vec())]);
    assert!(receiver.read_channels().is_empty());
}

#[test]
fn rejected_chunk_keeps_stream_aligned() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    peer.send("D 7 8 1 4");
    peer.send("C 7 0 6");
    peer.send_raw(b"xxxxxx");
    peer.send("C 7 0 4");
    peer.send_raw(b"abcd");
    conn.receive();

    let report = peer.line();
    assert!(report.starts_with("M "), "{report}");
    assert!(report.contains("protocol error"), "{report}");
    let events = conn.take_events();
    assert!(events.contains(&Event::DataComplete {
        data_conn: 7,
        chan: 0,
        data_type: DataType::U8,
        data: b"abcd".to_vec(),
    }));
    assert_eq!(conn.conn_state(), ConnState::Connected);
}

#[test]
fn keepalive_probe_and_deadline() {
    let mut config = ConnectionConfig::default();
    config.connection_timeout = 5.0;
    config.keepalive_grace = 2.0;
    let (mut conn, mut peer) = connection(&config);
    let start = Instant::now();

    conn.idle(start + Duration::from_secs(1));
    assert!(peer.quiet());
    conn.idle(start + Duration::from_secs(6));
    assert_eq!(peer.line(), "T ready");
    conn.idle(start + Duration::from_secs(7));
    assert_eq!(conn.conn_state(), ConnState::Connected);
    conn.idle(start + Duration::from_secs(9));
    assert_eq!(conn.conn_state(), ConnState::Broken);
}

#[test]
fn answered_keepalive_keeps_connection() {
    let mut config = ConnectionConfig::default();
    config.connection_timeout = 5.0;
    config.keepalive_grace = 2.0;
    let (mut conn, mut peer) = connection(&config);
    let start = Instant::now();

    conn.idle(start + Duration::from_secs(6));
    assert_eq!(peer.line(), "T ready");
    peer.send("T OK");
    conn.receive();
    conn.idle(start + Duration::from_secs(9));
    assert_eq!(conn.conn_state(), ConnState::Connected);
}

#[test]
fn negative_timeout_disables_keepalive() {
    let mut config = ConnectionConfig::default();
    config.connection_timeout = -1.0;
    let (mut conn, mut peer) = connection(&config);
    conn.idle(Instant::now() + Duration::from_secs(100_000));
    assert!(peer.quiet());
    assert_eq!(conn.conn_state(), ConnState::Connected);
}

#[test]
fn keepalive_request_is_answered() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    peer.send("T ready");
    conn.receive();
    assert_eq!(peer.line(), "T OK");
}

#[test]
fn values_mirror_peer_declarations() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    let focpos = Value::new("focpos", "focuser position", ValueData::Integer(0)).writable();
    let filter = Value::new(
        "filter",
        "filter wheel",
        ValueData::Selection {
            index: 0,
            options: vec!["R".into(), "G".into(), "B".into()],
        },
    );
    let infotime = Value::new("infotime", "", ValueData::Time(0.0));
    for value in [&focpos, &filter, &infotime] {
        for line in value.meta_lines() {
            peer.send(&line);
        }
    }
    peer.send("V focpos 120");
    peer.send("V filter 1");
    peer.send("V infotime 1000.5");
    conn.receive();

    let value = conn.value("focpos").unwrap();
    assert_eq!(value.as_integer().unwrap(), 120);
    assert!(value.is_writable());
    assert!(value.changed_at().is_some());
    assert!(matches!(value.as_double(), Err(Error::ValueType { .. })));
    assert_eq!(conn.value("filter").unwrap().selection_label().unwrap(), "G");
    assert!(matches!(conn.value("nosuch"), Err(Error::UnknownValue(_))));

    let events = conn.take_events();
    assert!(events.contains(&Event::ValueDeclared("focpos".into())));
    assert!(events.contains(&Event::ValueChanged("focpos".into())));

    assert_eq!(conn.info_time(), Some(1000.5));
    assert!(conn.info_time_changed());
    assert!(!conn.info_time_changed());
    peer.send("V infotime 1001");
    conn.receive();
    assert!(conn.info_time_changed());
    assert!(!conn.info_time_changed());
    conn.reset_info_time();
    assert!(conn.info_time_changed());
}

#[test]
fn peer_requests_become_events() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    peer.send("expose 3");
    peer.send("X focpos += 10");
    conn.receive();
    let events = conn.take_events();
    assert!(events.contains(&Event::Command("expose 3".into())));
    assert!(events.contains(&Event::SetValue {
        name: "focpos".into(),
        op: ValueOp::Add,
        raw: "10".into(),
    }));
}

#[test]
fn repeated_protocol_errors_break_connection() {
    let mut config = ConnectionConfig::default();
    config.max_protocol_errors = 2;
    let (mut conn, mut peer) = connection(&config);

    peer.send("V nosuch 1");
    peer.send("+000");
    peer.send("T OK");
    peer.send("Q 1");
    peer.send("V nosuch 2");
    conn.receive();
    assert_eq!(conn.conn_state(), ConnState::Connected);
    assert_eq!(peer.until("M ").len(), 1);

    peer.send("Q 2");
    conn.receive();
    assert_eq!(conn.conn_state(), ConnState::Broken);
}

#[test]
fn overlong_line_breaks_connection() {
    let mut config = ConnectionConfig::default();
    config.max_line = 16;
    let (mut conn, mut peer) = connection(&config);
    peer.send_raw(&[b'a'; 64]);
    conn.receive();
    assert_eq!(conn.conn_state(), ConnState::Broken);
}

#[test]
fn client_waits_for_authorization() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    conn.authorize(5, 1, 1234).unwrap();
    assert_eq!(peer.line(), "A auth 5 1 1234");
    assert_eq!(conn.conn_state(), ConnState::AuthPending);
    assert_eq!(conn.key(), Some(1234));
    assert!(!conn.set_key(99));

    conn.que_command(Command::info());
    assert!(peer.quiet());
    peer.send("A authorization_ok 5");
    conn.receive();
    assert_eq!(conn.conn_state(), ConnState::Connected);
    assert_eq!(peer.line(), "info");
}

#[test]
fn refused_authorization_is_terminal() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    conn.authorize(5, 1, 1234).unwrap();
    assert_eq!(peer.line(), "A auth 5 1 1234");
    peer.send("A authorization_failed 5");
    conn.receive();
    assert_eq!(conn.conn_state(), ConnState::AuthFailed);
}

#[test]
fn refused_authorization_fails_queued_commands() {
    let recorder = Rc::new(Recorder::default());
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    conn.authorize(5, 1, 99).unwrap();
    assert_eq!(peer.line(), "A auth 5 1 99");
    conn.que_command(Command::new("expose 1").with_originator(recorder.clone()));
    assert!(peer.quiet());

    peer.send("A authorization_failed 5");
    conn.receive();
    assert_eq!(conn.conn_state(), ConnState::AuthFailed);
    assert!(conn.que_empty());
    assert_eq!(
        *recorder.outcomes.borrow(),
        [("expose 1".to_owned(), Outcome::Failed(E_CONNECTION))]
    );
    assert!(conn.take_events().contains(&Event::CommandReturned {
        command: "expose 1".into(),
        outcome: Outcome::Failed(E_CONNECTION),
    }));
}

#[test]
fn unauthorized_commands_are_refused() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    peer.send("A auth 7 1 42");
    conn.receive();
    assert_eq!(conn.conn_state(), ConnState::AuthPending);
    assert_eq!(conn.centrald_id(), Some(7));
    peer.send("expose 1");
    conn.receive();
    assert_eq!(peer.line(), "-006 not authorized");

    conn.auth_ok().unwrap();
    assert_eq!(peer.line(), "A authorization_ok 7");
    peer.send("expose 1");
    conn.receive();
    assert!(
        conn.take_events()
            .contains(&Event::Command("expose 1".into()))
    );
}

#[test]
fn shared_segment_is_detached_once() {
    let (mut sender, mut receiver) = connected_pair();
    let mut segment = SharedSegment::create(shm_key(1), 64).unwrap();
    segment.write_at(0, b"hello").unwrap();
    let dc = sender
        .start_shared_data(&segment, DataType::U8, &[5])
        .unwrap();
    receiver.receive();
    assert!(receiver.take_events().contains(&Event::SharedStart {
        data_conn: dc,
        key: shm_key(1),
        data_type: DataType::U8,
        sizes: vec![5],
    }));
    let mapped = receiver.shared_segment(dc).unwrap();
    assert_eq!(&mapped.as_slice().unwrap()[..5], b"hello");

    sender.end_shared_data(dc).unwrap();
    receiver.receive();
    assert!(
        receiver
            .take_events()
            .contains(&Event::SharedEnd {
                data_conn: dc,
                key: shm_key(1)
            })
    );
    assert!(receiver.shared_segment(dc).is_none());
    assert!(matches!(
        sender.end_shared_data(dc),
        Err(Error::UnknownTransfer(_))
    ));
    segment.detach().unwrap();
    assert!(matches!(segment.detach(), Err(Error::SharedDetached(_))));
}

#[test]
fn oversized_shared_transfer_is_rejected() {
    let (mut sender, _receiver) = connected_pair();
    let segment = SharedSegment::create(shm_key(2), 8).unwrap();
    assert!(matches!(
        sender.start_shared_data(&segment, DataType::U8, &[4, 8]),
        Err(Error::SharedBounds { .. })
    ));
}

#[test]
fn outgoing_lines_follow_wire_format() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    conn.send_command_end(0, "OK").unwrap();
    conn.send_command_end(-2, "missing parameter").unwrap();
    conn.send_bop_state(BOP_EXPOSURE).unwrap();
    conn.send_progress(10.0, 20.5).unwrap();
    conn.send_value_raw("focpos", "12").unwrap();
    assert_eq!(peer.line(), "+000 OK");
    assert_eq!(peer.line(), "-002 missing parameter");
    assert_eq!(peer.line(), format!("B {BOP_EXPOSURE}"));
    assert_eq!(peer.line(), "R 10 20.5");
    assert_eq!(peer.line(), "V focpos 12");
}

#[test]
fn progress_is_relative_to_span() {
    let (mut conn, mut peer) = connection(&ConnectionConfig::default());
    assert_eq!(conn.progress(5.0), None);
    peer.send("R 100 200");
    conn.receive();
    assert_eq!(conn.progress(150.0), Some(0.5));
    assert_eq!(conn.progress(300.0), Some(1.0));
}
