//! End-to-end tests for `Connection` against a scripted local server.
//!
//! Each test binds a plain-TCP listener on a free port, performs the server
//! side of the upgrade by hand and then exchanges raw frames with the client.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use relay_ws::codec::{build_close_payload, encode_with_key};
use relay_ws::handshake::handshake_key_from_nonce;
use relay_ws::{
    CloseStatus, Connection, ConnectionHandler, ConnectionState, Decoded, Error, FrameDecoder,
    Message, Opcode, TransportError,
};
use tracing_subscriber::EnvFilter;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Route library logs to the test output; `RUST_LOG=relay_ws=trace` for detail.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, PartialEq)]
enum Event {
    Connect,
    Open,
    Message(Message),
    Close(CloseStatus, String),
    Disconnect,
}

struct ChannelHandler(Sender<Event>);

impl ConnectionHandler for ChannelHandler {
    fn on_connect(&self, _conn: &Connection) {
        let _ = self.0.send(Event::Connect);
    }
    fn on_open(&self, _conn: &Connection) {
        let _ = self.0.send(Event::Open);
    }
    fn on_message(&self, _conn: &Connection, message: Message) {
        let _ = self.0.send(Event::Message(message));
    }
    fn on_close(&self, _conn: &Connection, status: CloseStatus, reason: &str) {
        let _ = self.0.send(Event::Close(status, reason.to_string()));
    }
    fn on_disconnect(&self, _conn: &Connection) {
        let _ = self.0.send(Event::Disconnect);
    }
}

fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

fn handler() -> (ChannelHandler, Receiver<Event>) {
    let (tx, rx) = unbounded();
    (ChannelHandler(tx), rx)
}

fn next(rx: &Receiver<Event>) -> Event {
    rx.recv_timeout(TIMEOUT).expect("timed out waiting for event")
}

/// Accept one client, read its upgrade request and answer 101.
/// Returns the socket and the raw request text.
fn accept_upgrade(listener: &TcpListener) -> (TcpStream, String) {
    let (mut stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();

    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        request.push(byte[0]);
    }
    let request = String::from_utf8(request).unwrap();
    let key = request
        .lines()
        .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
        .unwrap()
        .trim()
        .to_string();

    write!(
        stream,
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        handshake_key_from_nonce(&key)
    )
    .unwrap();
    (stream, request)
}

/// Read from the client until `decoder` has produced at least one event.
fn read_client_frame(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Decoded {
    let mut out = Vec::new();
    let mut buf = [0u8; 512];
    while out.is_empty() {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "client hung up");
        decoder.decode(&buf[..n], &mut out).unwrap();
    }
    out.remove(0)
}

#[test]
fn test_full_session_over_tcp() {
    init_tracing();
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, request) = accept_upgrade(&listener);
        assert!(request.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(request.contains(&format!("Host: 127.0.0.1:{port}\r\n")));
        let mut decoder = FrameDecoder::default();

        // Echo the first text message back, unmasked.
        match read_client_frame(&mut stream, &mut decoder) {
            Decoded::Data { opcode, payload } => {
                assert_eq!(opcode, Opcode::Text);
                stream
                    .write_all(&encode_with_key(Opcode::Text, &payload, None))
                    .unwrap();
            }
            other => panic!("expected text, got {:?}", other),
        }

        stream
            .write_all(&encode_with_key(Opcode::Ping, b"are you there", None))
            .unwrap();
        assert_eq!(
            read_client_frame(&mut stream, &mut decoder),
            Decoded::Pong(b"are you there".to_vec())
        );

        let close = build_close_payload(CloseStatus::Normal, "done");
        stream
            .write_all(&encode_with_key(Opcode::Close, &close, None))
            .unwrap();
        assert_eq!(
            read_client_frame(&mut stream, &mut decoder),
            Decoded::Close {
                status: CloseStatus::Normal,
                reason: String::new()
            }
        );
    });

    let (handler, events) = handler();
    let url = format!("ws://127.0.0.1:{port}/chat?room=1");
    let conn = Connection::connect(&url, handler).unwrap();

    assert_eq!(next(&events), Event::Connect);
    assert_eq!(next(&events), Event::Open);
    conn.write("hello").unwrap();
    assert_eq!(next(&events), Event::Message(Message::Text("hello".into())));
    assert_eq!(
        next(&events),
        Event::Close(CloseStatus::Normal, "done".into())
    );

    server.join().unwrap();
    assert_eq!(next(&events), Event::Disconnect);
    conn.join();
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[test]
fn test_large_frame_trickled_in_pieces_is_reassembled() {
    init_tracing();
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 253) as u8).collect();
    let expected = payload.clone();

    let server = thread::spawn(move || {
        let (mut stream, _) = accept_upgrade(&listener);
        let frame = encode_with_key(Opcode::Binary, &payload, None);
        for piece in frame.chunks(7_919) {
            stream.write_all(piece).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        thread::sleep(Duration::from_millis(200));
    });

    let (handler, events) = handler();
    let conn = Connection::connect(&format!("ws://127.0.0.1:{port}/"), handler).unwrap();
    assert_eq!(next(&events), Event::Connect);
    assert_eq!(next(&events), Event::Open);
    assert_eq!(next(&events), Event::Message(Message::Binary(expected)));

    conn.close(CloseStatus::Normal);
    conn.join();
    server.join().unwrap();
}

#[test]
fn test_local_close_sends_close_frame() {
    init_tracing();
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let (done_tx, done_rx) = unbounded();

    let server = thread::spawn(move || {
        let (mut stream, _) = accept_upgrade(&listener);
        let mut decoder = FrameDecoder::default();
        let frame = read_client_frame(&mut stream, &mut decoder);
        done_tx.send(frame).unwrap();
    });

    let (handler, events) = handler();
    let conn = Connection::connect(&format!("ws://127.0.0.1:{port}/"), handler).unwrap();
    assert_eq!(next(&events), Event::Connect);
    assert_eq!(next(&events), Event::Open);

    conn.close(CloseStatus::GoingAway);
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(
        conn.write("after close"),
        Err(Error::NotOpen {
            state: ConnectionState::Closed
        })
    ));
    assert_eq!(
        done_rx.recv_timeout(TIMEOUT).unwrap(),
        Decoded::Close {
            status: CloseStatus::GoingAway,
            reason: String::new()
        }
    );
    conn.join();
    server.join().unwrap();
}

#[test]
fn test_refused_connection_is_reported_synchronously() {
    let port = free_port();
    let (handler, _events) = handler();
    let err = Connection::connect(&format!("ws://127.0.0.1:{port}/"), handler)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::Transport(TransportError::ConnectFailed { .. })
    ));
}

#[test]
fn test_unsupported_scheme_is_rejected() {
    let (handler, _events) = handler();
    let err = Connection::connect("gopher://127.0.0.1/", handler)
        .err()
        .unwrap();
    assert!(matches!(err, Error::UnsupportedScheme(_)));
}
