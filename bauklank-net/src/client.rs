//! Hub connection for display clients.
//!
//! An explicitly owned connection object with `connect`/`close` lifecycle.
//! The socket lives on a worker thread; the owner drives reconnection by
//! calling `poll` from its own loop.

use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use thiserror::Error;
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::Request;
use tungstenite::{Message, WebSocket};

use bauklank_types::SlotId;

use crate::backoff::Backoff;
use crate::framing::{encode_frame, parse_hub_frame};
use crate::protocol::{ClientMessage, HubMessage};

/// How often the worker checks for shutdown while the hub is quiet.
const READ_POLL: Duration = Duration::from_millis(50);

/// Bound on the TCP connect and on the websocket upgrade, each.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long `close` waits for the worker before leaving it to finish alone.
const STOP_GRACE: Duration = Duration::from_millis(200);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error("cannot reach {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("failed to send hello: {0}")]
    Hello(String),

    #[error("connection lost: {0}")]
    Lost(String),
}

/// Lifecycle of a hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { delay: Duration },
}

impl ConnectionState {
    /// Text for the client status indicator.
    pub fn status_text(&self) -> String {
        match self {
            ConnectionState::Disconnected => "disconnected".to_string(),
            ConnectionState::Connecting => "connecting".to_string(),
            ConnectionState::Connected => "connected".to_string(),
            ConnectionState::Reconnecting { delay } => {
                let secs = delay.as_secs_f64();
                if secs < 1.0 {
                    format!("reconnecting in {:.2}s", secs)
                } else {
                    format!("reconnecting in {}s", secs.round() as u64)
                }
            }
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.status_text())
    }
}

/// Something the owner should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    State(ConnectionState),
    Message(HubMessage),
}

/// Updates from the worker thread.
enum WorkerUpdate {
    Connected,
    Message(HubMessage),
    /// Terminal. `None` means a deliberate close.
    Ended(Option<ConnectError>),
}

struct Worker {
    shutdown: Arc<AtomicBool>,
    updates: Receiver<WorkerUpdate>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Signal the worker and join it if it finishes within the grace period.
    /// A worker stuck in a connect or handshake is detached; its own timeout
    /// ends it and nobody is listening for its result.
    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + STOP_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            debug!(target: "client", "Leaving hub connection worker to time out");
        }
    }
}

/// A client's connection to the hub.
pub struct HubConnection {
    url: String,
    engine_slots: Vec<SlotId>,
    state: ConnectionState,
    backoff: Backoff,
    connect_timeout: Duration,
    /// Pending reconnect. Consumed with `take()` so a timer fires at most once.
    retry_at: Option<Instant>,
    worker: Option<Worker>,
    /// Set by `close()`; suppresses reconnection until `connect()` again.
    closed: bool,
    pending: Vec<HubEvent>,
    last_error: Option<ConnectError>,
}

impl HubConnection {
    pub fn new(url: impl Into<String>, engine_slots: Vec<SlotId>) -> Self {
        Self::with_backoff(url, engine_slots, Backoff::new())
    }

    pub fn with_backoff(url: impl Into<String>, engine_slots: Vec<SlotId>, backoff: Backoff) -> Self {
        Self {
            url: url.into(),
            engine_slots,
            state: ConnectionState::Disconnected,
            backoff,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_at: None,
            worker: None,
            closed: true,
            pending: Vec::new(),
            last_error: None,
        }
    }

    /// Bound the TCP connect and the websocket upgrade of each attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&ConnectError> {
        self.last_error.as_ref()
    }

    /// Delay the next failure would wait before retrying.
    pub fn next_backoff(&self) -> Duration {
        self.backoff.peek()
    }

    /// Start connecting. A no-op while an attempt is already in flight.
    pub fn connect(&mut self) {
        self.closed = false;
        self.retry_at = None;
        if self.worker.is_some() {
            return;
        }
        self.start_attempt();
    }

    /// Deliberately disconnect and cancel any pending reconnect.
    pub fn close(&mut self) {
        self.closed = true;
        if self.retry_at.take().is_some() {
            debug!(target: "client", "Cancelled pending reconnect to {}", self.url);
        }
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        if self.state != ConnectionState::Disconnected {
            info!(target: "client", "Closed connection to {}", self.url);
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Drain worker updates and fire the reconnect timer if it is due.
    pub fn poll(&mut self, now: Instant) -> Vec<HubEvent> {
        let mut ended = None;
        if let Some(worker) = &self.worker {
            while let Ok(update) = worker.updates.try_recv() {
                match update {
                    WorkerUpdate::Connected => {
                        self.backoff.reset();
                        self.last_error = None;
                        info!(target: "client", "Connected to hub at {}", self.url);
                        self.pending.push(HubEvent::State(ConnectionState::Connected));
                        self.state = ConnectionState::Connected;
                    }
                    WorkerUpdate::Message(msg) => self.pending.push(HubEvent::Message(msg)),
                    WorkerUpdate::Ended(reason) => {
                        ended = Some(reason);
                        break;
                    }
                }
            }
        }

        if let Some(reason) = ended {
            if let Some(mut worker) = self.worker.take() {
                worker.stop();
            }
            self.handle_ended(reason, now);
        }

        if let Some(at) = self.retry_at {
            if now >= at && !self.closed && self.worker.is_none() {
                self.retry_at.take();
                self.start_attempt();
            }
        }

        std::mem::take(&mut self.pending)
    }

    fn handle_ended(&mut self, reason: Option<ConnectError>, now: Instant) {
        if let Some(err) = &reason {
            warn!(target: "client", "Hub connection ended: {}", err);
        }
        self.last_error = reason;
        if self.closed {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        self.set_state(ConnectionState::Disconnected);
        let delay = self.backoff.next_delay();
        self.retry_at = Some(now + delay);
        info!(
            target: "client",
            "Reconnecting to {} in {} ms",
            self.url,
            delay.as_millis()
        );
        self.set_state(ConnectionState::Reconnecting { delay });
    }

    fn start_attempt(&mut self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let url = self.url.clone();
        let hello = ClientMessage::Hello {
            engine_slots: self.engine_slots.clone(),
        };
        let worker_shutdown = Arc::clone(&shutdown);
        let timeout = self.connect_timeout;

        let spawned = thread::Builder::new()
            .name("hub-connection".into())
            .spawn(move || connection_worker(url, hello, timeout, worker_shutdown, tx));

        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker {
                    shutdown,
                    updates: rx,
                    handle: Some(handle),
                });
                self.set_state(ConnectionState::Connecting);
            }
            Err(e) => {
                // Treated like any other failed attempt.
                let reason = ConnectError::Unreachable {
                    url: self.url.clone(),
                    reason: e.to_string(),
                };
                self.handle_ended(Some(reason), Instant::now());
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.pending.push(HubEvent::State(state));
        }
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn connection_worker(
    url: String,
    hello: ClientMessage,
    timeout: Duration,
    shutdown: Arc<AtomicBool>,
    tx: Sender<WorkerUpdate>,
) {
    let reason = run_connection(&url, &hello, timeout, &shutdown, &tx).err();
    let _ = tx.send(WorkerUpdate::Ended(reason));
}

fn run_connection(
    url: &str,
    hello: &ClientMessage,
    timeout: Duration,
    shutdown: &AtomicBool,
    tx: &Sender<WorkerUpdate>,
) -> Result<(), ConnectError> {
    let unreachable = |reason: String| ConnectError::Unreachable {
        url: url.to_string(),
        reason,
    };
    let request = url
        .into_client_request()
        .map_err(|e| unreachable(e.to_string()))?;
    let stream = open_stream(&request, timeout).map_err(unreachable)?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(|e| unreachable(e.to_string()))?;

    // A read timeout mid-upgrade surfaces as an interrupted handshake.
    let (mut ws, _response) =
        tungstenite::client(request, stream).map_err(|e| unreachable(e.to_string()))?;
    ws.get_ref()
        .set_read_timeout(Some(READ_POLL))
        .map_err(|e| ConnectError::Lost(e.to_string()))?;
    if shutdown.load(Ordering::SeqCst) {
        return Ok(());
    }

    let frame = encode_frame(hello).map_err(|e| ConnectError::Hello(e.to_string()))?;
    ws.send(Message::text(frame))
        .map_err(|e| ConnectError::Hello(e.to_string()))?;

    if tx.send(WorkerUpdate::Connected).is_err() {
        return Ok(());
    }

    read_loop(&mut ws, shutdown, tx)
}

/// TCP connect to the request's host with a bounded wait per address.
fn open_stream(request: &Request, timeout: Duration) -> Result<TcpStream, String> {
    let uri = request.uri();
    if uri.scheme_str() != Some("ws") {
        return Err(format!("unsupported scheme in {}", uri));
    }
    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| format!("no host in {}", uri))?;
    let port = uri.port_u16().unwrap_or(80);
    let addrs = (host, port).to_socket_addrs().map_err(|e| e.to_string())?;

    let mut last = format!("no address for {}", host);
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = e.to_string(),
        }
    }
    Err(last)
}

fn read_loop(
    ws: &mut WebSocket<TcpStream>,
    shutdown: &AtomicBool,
    tx: &Sender<WorkerUpdate>,
) -> Result<(), ConnectError> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            let _ = ws.close(None);
            let _ = ws.flush();
            return Ok(());
        }

        match ws.read() {
            Ok(Message::Text(text)) => match parse_hub_frame(&text) {
                Ok(msg) => {
                    if tx.send(WorkerUpdate::Message(msg)).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => debug!(target: "client", "Dropped hub frame: {}", e),
            },
            Ok(Message::Close(_)) => return Err(ConnectError::Lost("closed by hub".into())),
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return Err(ConnectError::Lost("closed by hub".into()))
            }
            Err(e) => return Err(ConnectError::Lost(e.to_string())),
        }
    }
}
