//! Gateway session on top of a [`relay_ws::Connection`].
//!
//! Inbound text messages are parsed as gateway payloads. Every payload
//! carrying `s` updates the stored sequence. Hello triggers a single
//! Identify from the reader thread and starts the heartbeat task; dispatches
//! are routed to the [`GatewayHandler`] by event name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_ws::{
    ByteStream, CloseStatus, Connection, ConnectionConfig, ConnectionHandler, ConnectionState,
    Message, Target, Task, UpgradeRequest,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::heartbeat::{self, HeartbeatSchedule};
use crate::opcode::GatewayOpcode;
use crate::payload::{heartbeat_data, identify_data, packet, GatewayEvent};

/// Session callbacks, invoked on the connection's reader thread.
pub trait GatewayHandler: Send + Sync + 'static {
    fn on_connect(&self, _client: &GatewayClient) {}
    fn on_open(&self, _client: &GatewayClient) {}
    fn on_close(&self, _client: &GatewayClient, _status: CloseStatus, _reason: &str) {}
    fn on_disconnect(&self, _client: &GatewayClient) {}

    /// `READY` dispatch.
    fn on_ready(&self, _client: &GatewayClient, _data: &Value) {}

    /// `GUILD_CREATE` dispatch.
    fn on_guild_create(&self, _client: &GatewayClient, _data: &Value) {}

    /// Any other dispatch.
    fn on_dispatch(&self, _client: &GatewayClient, _name: &str, _data: &Value) {}

    /// The server asked us to reconnect (op 7). Reconnecting is up to the
    /// caller.
    fn on_reconnect_requested(&self, _client: &GatewayClient) {}

    /// The session was invalidated (op 9).
    fn on_invalid_session(&self, _client: &GatewayClient, _resumable: bool) {}
}

/// Session state shared by the client handle, the reader callbacks and the
/// heartbeat task.
pub(crate) struct Shared {
    config: GatewayConfig,
    last_sequence: Mutex<Option<u64>>,
    session_id: Mutex<Option<String>>,
    identified: AtomicBool,
    pub(crate) heartbeat: Mutex<Option<HeartbeatSchedule>>,
    heartbeat_task: Mutex<Option<Task>>,
}

impl Shared {
    fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            last_sequence: Mutex::new(None),
            session_id: Mutex::new(None),
            identified: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
        }
    }

    pub(crate) fn last_sequence(&self) -> Option<u64> {
        *self.last_sequence.lock()
    }

    /// Drop the schedule and signal the heartbeat task. The task is handed
    /// back so callers off the reader thread can join it.
    fn stop_heartbeat(&self) -> Option<Task> {
        self.heartbeat.lock().take();
        let task = self.heartbeat_task.lock().take();
        if let Some(task) = &task {
            task.cancel();
        }
        task
    }

    /// The heartbeat task is exiting on its own.
    pub(crate) fn heartbeat_exited(&self) {
        self.heartbeat.lock().take();
        let task = self.heartbeat_task.lock().take();
        drop(task);
    }
}

/// Handle to a gateway session. Cheap to clone.
#[derive(Clone)]
pub struct GatewayClient {
    conn: Connection,
    shared: Arc<Shared>,
}

impl GatewayClient {
    /// Connect to `config.url`.
    pub fn connect<H: GatewayHandler>(config: GatewayConfig, handler: H) -> Result<GatewayClient> {
        Self::connect_with(config, handler, ConnectionConfig::default())
    }

    pub fn connect_with<H: GatewayHandler>(
        config: GatewayConfig,
        handler: H,
        conn_config: ConnectionConfig,
    ) -> Result<GatewayClient> {
        let url = config.url.clone();
        let shared = Arc::new(Shared::new(config));
        let driver = Driver {
            shared: shared.clone(),
            handler,
        };
        info!(%url, "connecting to gateway");
        let conn = Connection::connect_with(&url, driver, conn_config)?;
        Ok(GatewayClient { conn, shared })
    }

    /// Run a session over an already-connected stream. `config.url` still
    /// provides the request target and `Host` header.
    pub fn start<S, H>(
        stream: S,
        config: GatewayConfig,
        handler: H,
        conn_config: ConnectionConfig,
    ) -> Result<GatewayClient>
    where
        S: ByteStream + 'static,
        H: GatewayHandler,
    {
        let target = Target::parse(&config.url)?;
        let request = UpgradeRequest::new(&target);
        let shared = Arc::new(Shared::new(config));
        let driver = Driver {
            shared: shared.clone(),
            handler,
        };
        let conn = Connection::start(stream, &request, driver, conn_config)?;
        Ok(GatewayClient { conn, shared })
    }

    /// Send `{"op": opcode, "d": data}`.
    pub fn send(&self, opcode: GatewayOpcode, data: Value) -> Result<()> {
        debug!(%opcode, "sending gateway payload");
        self.conn.write(&packet(opcode, data))?;
        Ok(())
    }

    pub fn update_presence(&self, presence: Value) -> Result<()> {
        self.send(GatewayOpcode::PresenceUpdate, presence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.shared.last_sequence()
    }

    /// Session id from the `READY` dispatch, if one was received.
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().clone()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// True while a heartbeat schedule is live.
    pub fn is_heartbeating(&self) -> bool {
        self.shared.heartbeat.lock().is_some()
    }

    /// Close with status 1000 and stop the heartbeat.
    pub fn close(&self) {
        self.conn.close(CloseStatus::Normal);
        if let Some(task) = self.shared.stop_heartbeat() {
            task.join();
        }
    }

    pub fn wait_closed(&self, poll_interval: Duration) {
        self.conn.wait_closed(poll_interval);
    }

    pub fn join(&self) {
        self.conn.join();
    }
}

/// Adapts [`GatewayHandler`] to the connection's callbacks.
struct Driver<H> {
    shared: Arc<Shared>,
    handler: H,
}

impl<H: GatewayHandler> Driver<H> {
    fn client(&self, conn: &Connection) -> GatewayClient {
        GatewayClient {
            conn: conn.clone(),
            shared: self.shared.clone(),
        }
    }

    fn on_payload(&self, client: &GatewayClient, event: GatewayEvent) {
        if let Some(sequence) = event.sequence {
            *self.shared.last_sequence.lock() = Some(sequence);
        }

        let Some(opcode) = event.opcode() else {
            warn!(op = event.op, "unknown gateway opcode");
            return;
        };
        debug!(%opcode, s = ?event.sequence, t = ?event.event_name, "gateway payload");

        match opcode {
            GatewayOpcode::Hello => self.on_hello(client, &event),
            GatewayOpcode::Dispatch => self.on_dispatch(client, &event),
            GatewayOpcode::Heartbeat => {
                let data = heartbeat_data(self.shared.last_sequence());
                if let Err(e) = client.send(GatewayOpcode::Heartbeat, data) {
                    warn!(error = %e, "requested heartbeat not sent");
                }
            }
            GatewayOpcode::HeartbeatAck => {
                if let Some(schedule) = self.shared.heartbeat.lock().as_mut() {
                    schedule.ack();
                }
            }
            GatewayOpcode::Reconnect => {
                info!("server requested reconnect");
                self.handler.on_reconnect_requested(client);
            }
            GatewayOpcode::InvalidSession => {
                let resumable = event.data.as_bool().unwrap_or(false);
                warn!(resumable, "session invalidated");
                self.handler.on_invalid_session(client, resumable);
            }
            other => debug!(opcode = %other, "ignoring client-only opcode"),
        }
    }

    fn on_hello(&self, client: &GatewayClient, event: &GatewayEvent) {
        let Some(interval_ms) = event.data_at("/heartbeat_interval").and_then(Value::as_u64) else {
            warn!("hello without heartbeat_interval");
            return;
        };
        if interval_ms == 0 {
            warn!("hello with zero heartbeat_interval ignored");
            return;
        }
        if self.shared.identified.swap(true, Ordering::SeqCst) {
            warn!("duplicate hello ignored");
            return;
        }

        let interval = Duration::from_millis(interval_ms);
        info!(interval_ms, "hello received, identifying");
        if let Err(e) = client.send(GatewayOpcode::Identify, identify_data(&self.shared.config)) {
            warn!(error = %e, "identify not sent");
            return;
        }

        *self.shared.heartbeat.lock() = Some(HeartbeatSchedule::new(interval));
        let conn = client.conn.clone();
        let shared = self.shared.clone();
        match Task::spawn("relay-gateway-heartbeat", move |token| {
            heartbeat::run(conn, shared, interval, token)
        }) {
            Ok(task) => *self.shared.heartbeat_task.lock() = Some(task),
            Err(e) => {
                warn!(error = %e, "heartbeat task not started");
                self.shared.heartbeat.lock().take();
            }
        }
    }

    fn on_dispatch(&self, client: &GatewayClient, event: &GatewayEvent) {
        let name = event.event_name.as_deref().unwrap_or_default();
        match name {
            "READY" => {
                if let Some(id) = event.data_at("/session_id").and_then(Value::as_str) {
                    *self.shared.session_id.lock() = Some(id.to_string());
                }
                info!("session ready");
                self.handler.on_ready(client, &event.data);
            }
            "GUILD_CREATE" => self.handler.on_guild_create(client, &event.data),
            _ => self.handler.on_dispatch(client, name, &event.data),
        }
    }
}

impl<H: GatewayHandler> ConnectionHandler for Driver<H> {
    fn on_connect(&self, conn: &Connection) {
        self.handler.on_connect(&self.client(conn));
    }

    fn on_open(&self, conn: &Connection) {
        self.handler.on_open(&self.client(conn));
    }

    fn on_message(&self, conn: &Connection, message: Message) {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => {
                warn!(len = bytes.len(), "ignoring binary gateway message");
                return;
            }
        };
        match GatewayEvent::parse(&text) {
            Ok(event) => self.on_payload(&self.client(conn), event),
            Err(e) => warn!(error = %e, "malformed gateway payload"),
        }
    }

    fn on_close(&self, conn: &Connection, status: CloseStatus, reason: &str) {
        self.shared.stop_heartbeat();
        self.handler.on_close(&self.client(conn), status, reason);
    }

    fn on_disconnect(&self, conn: &Connection) {
        self.shared.stop_heartbeat();
        self.handler.on_disconnect(&self.client(conn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_ws::codec::{encode_with_key, Opcode};
    use relay_ws::{Decoded, FrameDecoder, MemoryStream};
    use serde_json::json;
    use std::time::Instant;

    const ACCEPTED: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\r\n";
    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl GatewayHandler for Arc<Recorder> {
        fn on_ready(&self, _client: &GatewayClient, data: &Value) {
            self.events.lock().push(format!("ready:{}", data["user"]));
        }
        fn on_guild_create(&self, _client: &GatewayClient, data: &Value) {
            self.events.lock().push(format!("guild:{}", data["id"]));
        }
        fn on_dispatch(&self, _client: &GatewayClient, name: &str, _data: &Value) {
            self.events.lock().push(format!("dispatch:{name}"));
        }
        fn on_reconnect_requested(&self, _client: &GatewayClient) {
            self.events.lock().push("reconnect".into());
        }
        fn on_invalid_session(&self, _client: &GatewayClient, resumable: bool) {
            self.events.lock().push(format!("invalid:{resumable}"));
        }
        fn on_disconnect(&self, _client: &GatewayClient) {
            self.events.lock().push("disconnect".into());
        }
    }

    /// Server side of a scripted session.
    struct Server {
        script: MemoryStream,
        decoder: FrameDecoder,
        received: Vec<Value>,
    }

    impl Server {
        fn send(&self, payload: Value) {
            self.script.push_inbound(encode_with_key(
                Opcode::Text,
                payload.to_string().as_bytes(),
                None,
            ));
        }

        /// Wait until the client has written at least `n` payloads in total.
        fn expect(&mut self, n: usize) -> &[Value] {
            let deadline = Instant::now() + TIMEOUT;
            while self.received.len() < n {
                assert!(Instant::now() < deadline, "timed out waiting for payload {n}");
                let mut out = Vec::new();
                self.decoder
                    .decode(&self.script.take_outbound(), &mut out)
                    .unwrap();
                for event in out {
                    if let Decoded::Data { payload, .. } = event {
                        self.received.push(serde_json::from_slice(&payload).unwrap());
                    }
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            &self.received
        }
    }

    fn start(recorder: Arc<Recorder>) -> (GatewayClient, Server) {
        let script = MemoryStream::new();
        let config = GatewayConfig::new("token-123").with_url("ws://gateway.test/?v=9&encoding=json");
        let client = GatewayClient::start(
            script.clone(),
            config,
            recorder,
            ConnectionConfig::default(),
        )
        .unwrap();

        let request = String::from_utf8(script.take_outbound()).unwrap();
        assert!(request.starts_with("GET /?v=9&encoding=json HTTP/1.1\r\n"));
        assert!(request.contains("Host: gateway.test\r\n"));
        script.push_inbound(ACCEPTED);

        let server = Server {
            script,
            decoder: FrameDecoder::default(),
            received: Vec::new(),
        };
        (client, server)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_hello_identifies_once_then_heartbeats_null_then_sequence() {
        let recorder = Arc::new(Recorder::default());
        let (client, mut server) = start(recorder.clone());

        server.send(json!({"op": 10, "d": {"heartbeat_interval": 30}}));
        let identify = server.expect(1)[0].clone();
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "token-123");
        assert_eq!(identify["d"]["intents"], 513);
        assert!(client.is_heartbeating());

        let first_beat = server.expect(2)[1].clone();
        assert_eq!(first_beat, json!({"op": 1, "d": null}));

        server.send(json!({"op": 11}));
        server.send(json!({"op": 0, "s": 42, "t": "MESSAGE_CREATE", "d": {}}));
        wait_for(|| client.last_sequence() == Some(42));

        // Any beat written after the sequence landed must carry it.
        let already = server.expect(2).len();
        let next = server.expect(already + 1)[already].clone();
        assert_eq!(next["op"], 1);
        if next["d"].is_null() {
            let again = server.expect(already + 2)[already + 1].clone();
            assert_eq!(again, json!({"op": 1, "d": 42}));
        } else {
            assert_eq!(next, json!({"op": 1, "d": 42}));
        }

        // A second hello does not identify again. Payloads are handled in
        // order, so once the requested heartbeat for s=99 shows up the hello
        // has been processed.
        server.send(json!({"op": 10, "d": {"heartbeat_interval": 30}}));
        server.send(json!({"op": 0, "s": 99, "t": "MARK", "d": {}}));
        server.send(json!({"op": 1, "d": null}));
        let mut n = server.expect(already + 1).len();
        while !server.received.contains(&json!({"op": 1, "d": 99})) {
            n = server.expect(n + 1).len();
        }
        let identifies = server.received.iter().filter(|p| p["op"] == 2).count();
        assert_eq!(identifies, 1);

        client.close();
        assert!(!client.is_heartbeating());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(recorder.events().contains(&"dispatch:MESSAGE_CREATE".to_string()));
    }

    #[test]
    fn test_dispatches_are_routed_by_name() {
        let recorder = Arc::new(Recorder::default());
        let (client, server) = start(recorder.clone());

        server.send(json!({"op": 0, "s": 1, "t": "READY", "d": {"user": "bot", "session_id": "sess-9"}}));
        server.send(json!({"op": 0, "s": 2, "t": "GUILD_CREATE", "d": {"id": "77"}}));
        server.send(json!({"op": 0, "s": 3, "t": "TYPING_START", "d": {}}));
        server.send(json!({"op": 7, "d": null}));
        server.send(json!({"op": 9, "d": true}));
        wait_for(|| recorder.events().len() == 5);

        assert_eq!(
            recorder.events(),
            vec![
                "ready:\"bot\"",
                "guild:\"77\"",
                "dispatch:TYPING_START",
                "reconnect",
                "invalid:true",
            ]
        );
        assert_eq!(client.session_id().as_deref(), Some("sess-9"));
        assert_eq!(client.last_sequence(), Some(3));
        client.close();
    }

    #[test]
    fn test_server_heartbeat_request_is_answered_immediately() {
        let recorder = Arc::new(Recorder::default());
        let (client, mut server) = start(recorder);

        server.send(json!({"op": 0, "s": 5, "t": "X", "d": {}}));
        server.send(json!({"op": 1, "d": null}));
        assert_eq!(server.expect(1)[0], json!({"op": 1, "d": 5}));
        client.close();
    }

    #[test]
    fn test_malformed_payloads_are_skipped() {
        let recorder = Arc::new(Recorder::default());
        let (client, server) = start(recorder.clone());

        server
            .script
            .push_inbound(encode_with_key(Opcode::Text, b"{not json", None));
        server.send(json!({"op": 5, "s": 8}));
        server.send(json!({"op": 0, "s": 9, "t": "AFTER", "d": {}}));
        wait_for(|| recorder.events().len() == 1);
        assert_eq!(recorder.events(), vec!["dispatch:AFTER"]);
        assert_eq!(client.last_sequence(), Some(9));
        client.close();
    }

    #[test]
    fn test_disconnect_stops_heartbeat() {
        let recorder = Arc::new(Recorder::default());
        let (client, mut server) = start(recorder.clone());

        server.send(json!({"op": 10, "d": {"heartbeat_interval": 10_000}}));
        server.expect(1);
        wait_for(|| client.is_heartbeating());

        server.script.push_disconnect();
        client.wait_closed(Duration::from_millis(1));
        wait_for(|| !client.is_heartbeating());
        assert_eq!(recorder.events(), vec!["disconnect"]);
        assert!(client.update_presence(json!({"status": "online"})).is_err());
        client.join();
    }

    #[test]
    fn test_heartbeat_stops_when_connection_closes_without_callback() {
        let recorder = Arc::new(Recorder::default());
        let (client, mut server) = start(recorder);

        server.send(json!({"op": 10, "d": {"heartbeat_interval": 20}}));
        server.expect(1);
        wait_for(|| client.is_heartbeating());

        client.connection().close(CloseStatus::Normal);
        assert_eq!(client.state(), ConnectionState::Closed);
        wait_for(|| !client.is_heartbeating());
        assert!(client.shared.heartbeat_task.lock().is_none());
        client.join();
    }

    #[test]
    fn test_zero_heartbeat_interval_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let (client, mut server) = start(recorder);

        server.send(json!({"op": 10, "d": {"heartbeat_interval": 0}}));
        server.send(json!({"op": 0, "s": 3, "t": "X", "d": {}}));
        server.send(json!({"op": 1, "d": null}));
        // Handled in order: the requested beat is the first thing written.
        assert_eq!(server.expect(1)[0], json!({"op": 1, "d": 3}));
        assert!(!client.is_heartbeating());

        std::thread::sleep(Duration::from_millis(20));
        assert!(server.script.take_outbound().is_empty());
        client.close();
    }
}
