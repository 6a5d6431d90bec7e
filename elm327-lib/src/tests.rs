use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Elm327;
use crate::device::ConnectionState;
use crate::error::Elm327Error;
use crate::frame::{Frame, FrameBuffer, PidReply};
use crate::pid::{Pid, decode_temperature};
use crate::transport::{DeviceInfo, Transport};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("trace")
        .with_test_writer()
        .try_init();
}

/// One scripted exchange: the command the adapter expects, and the
/// chunks it replies with (each chunk delivered separately).
type ScriptEntry = (&'static str, Vec<&'static str>);

#[derive(Default)]
struct MockState {
    script: VecDeque<ScriptEntry>,
    written: Vec<String>,
    tx: Option<mpsc::Sender<Bytes>>,
    connects: usize,
    subscriptions: usize,
    fail_connect: bool,
}

/// Scripted in-memory adapter, shared handle kept by the test for
/// assertions and fault injection.
#[derive(Clone, Default)]
struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn scripted(script: Vec<ScriptEntry>) -> (Self, Arc<Mutex<MockState>>) {
        let transport = Self::default();
        transport.state.lock().unwrap().script = script.into();
        let handle = Arc::clone(&transport.state);
        (transport, handle)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, Elm327Error> {
        Ok(vec![DeviceInfo {
            address: "AA:BB:CC:11:22:33".into(),
            name: Some("OBDII".into()),
        }])
    }

    async fn connect(&mut self, address: &str) -> Result<(), Elm327Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(Elm327Error::Connect {
                address: address.to_owned(),
                reason: "connection refused".into(),
            });
        }
        state.connects += 1;
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Bytes>, Elm327Error> {
        let (tx, rx) = mpsc::channel(32);
        let mut state = self.state.lock().unwrap();
        state.subscriptions += 1;
        state.tx = Some(tx);
        Ok(rx)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), Elm327Error> {
        let command = String::from_utf8_lossy(data).trim().to_string();
        let (entry, tx) = {
            let mut state = self.state.lock().unwrap();
            state.written.push(command.clone());
            (state.script.pop_front(), state.tx.clone())
        };
        if let Some((expected, chunks)) = entry {
            assert_eq!(command, expected, "adapter got an unexpected command");
            if let Some(tx) = tx {
                for chunk in chunks {
                    tx.send(Bytes::from_static(chunk.as_bytes()))
                        .await
                        .expect("subscriber gone");
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.lock().unwrap().tx = None;
    }
}

fn handshake() -> Vec<ScriptEntry> {
    vec![
        ("ATZ", vec!["\r\rELM327 v2.1\r\r>"]),
        ("ATSP0", vec!["OK\r\r>"]),
        ("0100", vec!["41 00 BE 3F A8 13 \r\r>"]),
    ]
}

async fn connected(extra: Vec<ScriptEntry>) -> (Elm327<MockTransport>, Arc<Mutex<MockState>>) {
    init_tracing();
    let mut script = handshake();
    script.extend(extra);
    let (transport, handle) = MockTransport::scripted(script);
    let mut session = Elm327::new(transport);
    session
        .connect("AA:BB:CC:11:22:33")
        .await
        .expect("connect should succeed");
    (session, handle)
}

#[test]
fn frame_assembles_across_chunks() {
    let mut buffer = FrameBuffer::new();
    buffer.push(b"41 0");
    assert!(buffer.take_frame().is_none(), "no prompt yet");

    buffer.push(b"5 5F \r\r>");
    let frame = buffer.take_frame().expect("frame should be complete");
    assert_eq!(frame.last_data_byte(), Some(0x5F));
    assert!(buffer.is_empty(), "buffer cleared after frame");
}

#[test]
fn frame_grammar_classifies_lines() {
    let searching = Frame::from_bytes(b"SEARCHING...\r");
    assert!(searching.is_searching());
    assert!(!searching.is_pid_data());

    let data = Frame::from_bytes(b"41 00 BE 3F A8 13 \r");
    assert!(!data.is_searching());
    assert!(data.is_pid_data());

    let status = Frame::from_bytes(b"NO DATA\r");
    assert!(!status.is_pid_data());

    // Two hex pairs are not enough for a PID reply.
    let short = Frame::from_bytes(b"41 05\r");
    assert!(!short.is_pid_data());
}

#[test]
fn pid_reply_tolerates_command_echo() {
    let frame = Frame::from_bytes(b"0105\r41 05 5F\r\r");
    assert_eq!(
        frame.pid_reply(),
        Some(PidReply {
            mode: 0x41,
            pid: 0x05,
            data: vec![0x5F],
        })
    );
    assert_eq!(frame.last_data_byte(), Some(0x5F));
}

#[test]
fn temperature_decoding_follows_sae_offset() {
    assert_eq!(decode_temperature(0x00), -40);
    assert_eq!(decode_temperature(0x5F), 55);
    assert_eq!(decode_temperature(0xFF), 215);

    for byte in [0x00u8, 0x28, 0x5F, 0x87, 0xFF] {
        let text = format!("41 05 {byte:02X} \r\r");
        let frame = Frame::from_bytes(text.as_bytes());
        assert_eq!(
            frame.last_data_byte().map(decode_temperature),
            Some(i16::from(byte) - 40)
        );
    }
}

#[test]
fn pid_commands_render_mode_01() {
    assert_eq!(Pid::SupportedPids.command(), "0100");
    assert_eq!(Pid::CoolantTemp.command(), "0105");
    assert_eq!(Pid::IntakeAirTemp.command(), "010F");
}

#[tokio::test]
async fn connect_initializes_and_reads_temperature() {
    let (mut session, handle) = connected(vec![("0105", vec!["41 05 5F \r\r>"])]).await;
    assert_eq!(session.state(), ConnectionState::Ready);

    let celsius = session.read_temperature().await.expect("read should succeed");
    assert_eq!(celsius, Some(55));

    let written = handle.lock().unwrap().written.clone();
    assert_eq!(written, ["ATZ", "ATSP0", "0100", "0105"]);
}

#[tokio::test]
async fn init_discards_searching_frames() {
    init_tracing();
    let script = vec![
        ("ATZ", vec!["\r\rELM327 v2.1\r\r>"]),
        ("ATSP0", vec!["OK\r\r>"]),
        (
            "0100",
            vec![
                "SEARCHING...\r\r>",
                "SEARCHING...\r\r>",
                "41 00 BE 3F A8 13 \r\r>",
            ],
        ),
    ];
    let (transport, _) = MockTransport::scripted(script);
    let mut session = Elm327::new(transport);

    session
        .connect("AA:BB:CC:11:22:33")
        .await
        .expect("searching frames should be discarded");
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn init_fails_after_probe_bound() {
    init_tracing();
    let script = vec![
        ("ATZ", vec!["\r\rELM327 v2.1\r\r>"]),
        ("ATSP0", vec!["OK\r\r>"]),
        ("0100", vec!["SEARCHING...\r\r>"; 12]),
    ];
    let (transport, _) = MockTransport::scripted(script);
    let mut session = Elm327::new(transport);

    let err = session
        .connect("AA:BB:CC:11:22:33")
        .await
        .expect_err("handshake should not converge");
    assert!(matches!(err, Elm327Error::InitializationFailed { .. }));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn busy_while_request_outstanding() {
    let (mut session, handle) = connected(vec![("0100", vec![])]).await;

    // Poll the command once so it writes and suspends awaiting a reply,
    // then abandon it.
    let outcome = futures_lite::future::poll_once(session.send_raw("0100")).await;
    assert!(outcome.is_none(), "no reply scripted, must stay pending");

    let err = session
        .read_temperature()
        .await
        .expect_err("slot is still claimed");
    assert!(matches!(err, Elm327Error::Busy { ref command } if command == "0100"));

    // The outstanding request was not disturbed: nothing further was
    // written to the adapter.
    let written = handle.lock().unwrap().written.clone();
    assert_eq!(written.last().map(String::as_str), Some("0100"));
    assert!(!written.contains(&"0105".to_string()));
}

#[tokio::test(start_paused = true)]
async fn timeout_returns_session_to_ready() {
    let (mut session, _) = connected(vec![
        ("0105", vec![]),
        ("0105", vec!["41 05 5F \r\r>"]),
    ])
    .await;

    let err = session
        .read_temperature()
        .await
        .expect_err("no frame was delivered");
    assert!(matches!(err, Elm327Error::Timeout(_)));
    assert_eq!(session.state(), ConnectionState::Ready);

    // The same command may be retried immediately.
    let celsius = session.read_temperature().await.expect("retry should work");
    assert_eq!(celsius, Some(55));
}

#[tokio::test(start_paused = true)]
async fn late_reply_is_not_attributed_to_next_command() {
    let (mut session, handle) = connected(vec![
        ("0105", vec![]),
        ("ATI", vec!["ELM327 v2.1\r\r>"]),
    ])
    .await;

    let err = session
        .read_temperature()
        .await
        .expect_err("no reply within the deadline");
    assert!(matches!(err, Elm327Error::Timeout(_)));

    // The reply to 0105 arrives only after the deadline has passed.
    let tx = handle.lock().unwrap().tx.clone().expect("still connected");
    tx.send(Bytes::from_static(b"41 05 5F \r\r>"))
        .await
        .expect("subscriber gone");

    // The next, different command must get its own reply, not the
    // stale temperature frame.
    let reply = session.send_raw("ATI").await.expect("send should succeed");
    assert_eq!(reply, "ELM327 v2.1");
}

#[tokio::test]
async fn malformed_reply_is_not_available() {
    let (mut session, _) = connected(vec![
        ("0105", vec!["NO DATA\r\r>"]),
        ("0105", vec!["\r\r>"]),
        ("0105", vec!["41 05 ZZ\r\r>"]),
    ])
    .await;

    for _ in 0..3 {
        let celsius = session
            .read_temperature()
            .await
            .expect("malformed replies are benign");
        assert_eq!(celsius, None);
    }
    assert_eq!(session.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    init_tracing();
    let (transport, _) = MockTransport::scripted(Vec::new());
    let mut session = Elm327::new(transport);

    // Never connected: disconnecting is a no-op, twice.
    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let err = session.send_raw("ATI").await.expect_err("not connected");
    assert!(matches!(err, Elm327Error::NotConnected));
}

#[tokio::test]
async fn reconnect_round_trip() {
    init_tracing();
    let mut script = handshake();
    script.push(("0105", vec!["41 05 5F \r\r>"]));
    script.extend(handshake());
    script.push(("0105", vec!["41 05 60 \r\r>"]));
    let (transport, handle) = MockTransport::scripted(script);
    let mut session = Elm327::new(transport);

    session.connect("AA:BB:CC:11:22:33").await.expect("first connect");
    assert_eq!(session.read_temperature().await.expect("first read"), Some(55));
    session.disconnect().await;

    session.connect("AA:BB:CC:11:22:33").await.expect("second connect");
    assert_eq!(session.read_temperature().await.expect("second read"), Some(56));
    session.disconnect().await;

    let state = handle.lock().unwrap();
    assert_eq!(state.connects, 2);
    // Each connect registered a fresh subscription; the stale one was
    // replaced, so nothing is delivered twice after a reconnect.
    assert_eq!(state.subscriptions, 2);
}

#[tokio::test]
async fn connect_failure_rolls_back() {
    init_tracing();
    let (transport, handle) = MockTransport::scripted(Vec::new());
    handle.lock().unwrap().fail_connect = true;
    let mut session = Elm327::new(transport);

    let err = session
        .connect("AA:BB:CC:11:22:33")
        .await
        .expect_err("transport refuses");
    assert!(matches!(err, Elm327Error::Connect { .. }));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn transport_death_forces_disconnect() {
    let (mut session, handle) = connected(vec![("0105", vec![])]).await;

    // Sever the stream mid-session; the subscription channel closes.
    handle.lock().unwrap().tx = None;

    let err = session
        .read_temperature()
        .await
        .expect_err("stream is gone");
    assert!(matches!(err, Elm327Error::Io(_)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn query_pid_checks_mode_and_pid_echo() {
    let (mut session, _) = connected(vec![
        ("010F", vec!["41 0F 3C \r\r>"]),
        ("0105", vec!["41 0C 12 34 \r\r>"]),
    ])
    .await;

    let reply = session
        .query_pid(Pid::IntakeAirTemp)
        .await
        .expect("query should succeed");
    assert_eq!(
        reply,
        Some(PidReply {
            mode: 0x41,
            pid: 0x0F,
            data: vec![0x3C],
        })
    );

    // A reply for some other PID does not match.
    let mismatched = session
        .query_pid(Pid::CoolantTemp)
        .await
        .expect("query should succeed");
    assert_eq!(mismatched, None);
}

#[tokio::test]
async fn list_devices_reports_paired_adapters() {
    init_tracing();
    let (transport, _) = MockTransport::scripted(Vec::new());
    let session = Elm327::new(transport);

    let devices = session.list_devices().await.expect("discovery works");
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name.as_deref(), Some("OBDII"));
}
