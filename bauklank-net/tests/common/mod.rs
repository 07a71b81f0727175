#![allow(dead_code)]
//! Test harness utilities for bauklank-net integration tests.

use std::net::TcpStream;
use std::time::{Duration, Instant};

use tungstenite::{Message, WebSocket};

use bauklank_net::framing::{encode_frame, parse_hub_frame};
use bauklank_net::protocol::{ClientMessage, HubMessage};
use bauklank_net::server::{ClientEvent, FanoutServer};
use bauklank_net::{ConnectionState, HubConnection, HubEvent};
use bauklank_types::SlotId;

pub fn slot(name: &str) -> SlotId {
    SlotId::parse(name).unwrap()
}

pub fn set_msg(engine: &str, key: &str, value: serde_json::Value) -> HubMessage {
    HubMessage::Set {
        engine: slot(engine),
        key: key.to_string(),
        value,
    }
}

/// Bind a server on an ephemeral local port.
pub fn bind_local(capacity: usize) -> (FanoutServer, String) {
    let server = FanoutServer::bind_with_capacity("127.0.0.1:0", capacity).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (server, addr)
}

/// Bind a server that drops clients once they have been behind for `lag_limit`.
pub fn bind_local_with_lag(capacity: usize, lag_limit: Duration) -> (FanoutServer, String) {
    let server = FanoutServer::bind_with_limits("127.0.0.1:0", capacity, lag_limit).unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (server, addr)
}

/// A port nothing is listening on.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Drive the server (accept + poll) until the expected client count is reached, or timeout.
pub fn drive_until_clients(server: &mut FanoutServer, expected: usize, timeout: Duration) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        server.accept_connections();
        server.poll_events();
        if server.client_count() >= expected {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!(
        "Timed out waiting for {} clients (have {})",
        expected,
        server.client_count()
    );
}

/// Drive the server until a session event matching `pred` arrives.
pub fn drive_until_event<F>(server: &mut FanoutServer, timeout: Duration, pred: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        server.accept_connections();
        if let Some(event) = server.poll_events().into_iter().find(|e| pred(e)) {
            return event;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out waiting for client event");
}

/// Poll a connection (and optionally a server) until `pred` matches a state.
pub fn drive_until_state<F>(
    conn: &mut HubConnection,
    mut server: Option<&mut FanoutServer>,
    timeout: Duration,
    pred: F,
) -> Vec<HubEvent>
where
    F: Fn(&ConnectionState) -> bool,
{
    let start = Instant::now();
    let mut seen = Vec::new();
    while start.elapsed() < timeout {
        if let Some(server) = server.as_deref_mut() {
            server.accept_connections();
            server.poll_events();
        }
        let events = conn.poll(Instant::now());
        let hit = events
            .iter()
            .any(|e| matches!(e, HubEvent::State(s) if pred(s)));
        seen.extend(events);
        if hit {
            return seen;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out waiting for connection state, saw {:?}", seen);
}

/// A raw websocket client for protocol-level tests.
///
/// Because the tests are single-threaded, connecting is split:
/// 1. `RawClient::open()`: TCP connect, completed by the kernel backlog
/// 2. Drive the server with `drive_until_clients()`: spawns the session thread
/// 3. `RawClient::handshake()`: websocket upgrade against that session
pub struct RawClient {
    ws: WebSocket<TcpStream>,
}

impl RawClient {
    pub fn open(addr: &str) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(stream)
    }

    pub fn handshake(addr: &str, stream: TcpStream) -> Self {
        let (ws, _response) = tungstenite::client(format!("ws://{}/", addr), stream).unwrap();
        Self { ws }
    }

    /// Receive the next hub message, skipping control frames.
    pub fn recv(&mut self) -> HubMessage {
        loop {
            match self.ws.read().unwrap() {
                Message::Text(text) => return parse_hub_frame(&text).unwrap(),
                Message::Close(frame) => panic!("Connection closed: {:?}", frame),
                _ => continue,
            }
        }
    }

    /// Read until the hub closes the session or the socket errors.
    pub fn expect_closed(&mut self) {
        loop {
            match self.ws.read() {
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }

    pub fn send_text(&mut self, text: &str) {
        self.ws.send(Message::text(text)).unwrap();
    }

    pub fn send_hello(&mut self, slots: &[&str]) {
        let hello = ClientMessage::Hello {
            engine_slots: slots.iter().map(|s| slot(s)).collect(),
        };
        self.send_text(&encode_frame(&hello).unwrap());
    }
}
