//! Fan-out websocket server for display clients.
//!
//! Accepts client connections and broadcasts hub messages to all of them.
//! Each client gets its own session thread and an outbound queue; the control
//! loop only ever does non-blocking queue pushes. A client whose backlog stays
//! above the queue capacity for longer than the lag limit, or grows past the
//! hard backlog cap, is isolated instead of stalling the others. A burst
//! produced in one control-loop step is not lag on its own.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use tungstenite::{Message, WebSocket};

use bauklank_types::SlotId;

use crate::framing::{encode_frame, parse_client_frame};
use crate::protocol::{ClientId, ClientMessage, HubMessage};

/// Outbound frames a client may have queued before it counts as behind.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// How long a client may stay behind before it is dropped.
pub const DEFAULT_LAG_LIMIT: Duration = Duration::from_secs(2);

/// Backlog that drops a client immediately, whatever its lag.
pub const MAX_BACKLOG: usize = 16_384;

/// How long a session thread waits on the socket before draining its queue.
const SESSION_POLL: Duration = Duration::from_millis(10);

/// Upper bound on the websocket handshake and on any single write.
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Events surfaced to the control loop by client session threads.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Client declared the engine slots it renders.
    Hello {
        client_id: ClientId,
        engine_slots: Vec<SlotId>,
    },
    /// Session ended (client closed, I/O error, or isolated by the server).
    Closed { client_id: ClientId },
}

/// A connected client with its outbound queue.
struct ClientConnection {
    addr: SocketAddr,
    outbound: Sender<Arc<str>>,
    /// Advertised interest. Filtering happens on the client.
    engine_slots: Vec<SlotId>,
    /// Set when the backlog first went over capacity, cleared once it drains.
    behind_since: Option<Instant>,
}

/// Websocket server that broadcasts every hub message to every client.
pub struct FanoutServer {
    listener: TcpListener,
    clients: BTreeMap<ClientId, ClientConnection>,
    event_rx: Receiver<ClientEvent>,
    event_tx: Sender<ClientEvent>,
    next_client_id: u64,
    queue_capacity: usize,
    lag_limit: Duration,
}

impl FanoutServer {
    /// Bind the server to an address.
    pub fn bind(addr: &str) -> io::Result<Self> {
        Self::bind_with_capacity(addr, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn bind_with_capacity(addr: &str, queue_capacity: usize) -> io::Result<Self> {
        Self::bind_with_limits(addr, queue_capacity, DEFAULT_LAG_LIMIT)
    }

    pub fn bind_with_limits(addr: &str, queue_capacity: usize, lag_limit: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        info!(target: "server", "FanoutServer listening on {}", addr);

        Ok(Self {
            listener,
            clients: BTreeMap::new(),
            event_rx,
            event_tx,
            next_client_id: 0,
            queue_capacity: queue_capacity.clamp(1, MAX_BACKLOG),
            lag_limit,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept pending TCP connections. Returns the ids of new clients so the
    /// caller can queue their greeting ahead of any later broadcast.
    pub fn accept_connections(&mut self) -> Vec<ClientId> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let client_id = ClientId::new(self.next_client_id);
                    self.next_client_id += 1;

                    let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
                    let event_tx = self.event_tx.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("ws-client-{}", client_id.0))
                        .spawn(move || {
                            client_session_thread(client_id, stream, outbound_rx, event_tx);
                        });
                    if let Err(e) = spawned {
                        error!(target: "server", "Failed to spawn session for {}: {}", addr, e);
                        continue;
                    }

                    self.clients.insert(
                        client_id,
                        ClientConnection {
                            addr,
                            outbound: outbound_tx,
                            engine_slots: Vec::new(),
                            behind_since: None,
                        },
                    );
                    info!(target: "server", "Client {:?} connected from {}", client_id, addr);
                    accepted.push(client_id);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "server", "Accept error: {}", e);
                    break;
                }
            }
        }
        accepted
    }

    /// Drain session events, applying them to the client table.
    pub fn poll_events(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            match &event {
                ClientEvent::Hello {
                    client_id,
                    engine_slots,
                } => {
                    if let Some(client) = self.clients.get_mut(client_id) {
                        info!(
                            target: "server",
                            "Client {:?} subscribed to engine slots {:?}",
                            client_id,
                            engine_slots
                        );
                        client.engine_slots = engine_slots.clone();
                    }
                }
                ClientEvent::Closed { client_id } => {
                    if let Some(client) = self.clients.remove(client_id) {
                        info!(target: "server", "Client {:?} ({}) disconnected", client_id, client.addr);
                    }
                }
            }
            events.push(event);
        }
        events
    }

    /// Queue a message for a single client.
    pub fn send_to(&mut self, client_id: ClientId, msg: &HubMessage) -> bool {
        let payload = match encode_frame(msg) {
            Ok(text) => Arc::<str>::from(text),
            Err(e) => {
                error!(target: "server", "Failed to encode {:?}: {}", msg, e);
                return false;
            }
        };
        let verdict = match self.clients.get_mut(&client_id) {
            Some(client) => enqueue(client, payload, self.queue_capacity, self.lag_limit, Instant::now()),
            None => return false,
        };
        match verdict {
            Ok(()) => true,
            Err(reason) => {
                self.isolate(client_id, reason);
                false
            }
        }
    }

    /// Queue a message for every client, in call order. Returns how many
    /// clients accepted it.
    pub fn broadcast(&mut self, msg: &HubMessage) -> usize {
        if self.clients.is_empty() {
            return 0;
        }
        let payload = match encode_frame(msg) {
            Ok(text) => Arc::<str>::from(text),
            Err(e) => {
                error!(target: "server", "Failed to encode {:?}: {}", msg, e);
                return 0;
            }
        };

        let now = Instant::now();
        let mut delivered = 0;
        let mut isolated = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            match enqueue(client, Arc::clone(&payload), self.queue_capacity, self.lag_limit, now) {
                Ok(()) => delivered += 1,
                Err(reason) => isolated.push((*id, reason)),
            }
        }

        for (id, reason) in isolated {
            self.isolate(id, reason);
        }
        delivered
    }

    /// Drop a client. Its session thread sees the closed queue and closes the socket.
    fn isolate(&mut self, client_id: ClientId, reason: &str) {
        if let Some(client) = self.clients.remove(&client_id) {
            warn!(
                target: "server",
                "Dropping client {:?} ({}): {}",
                client_id,
                client.addr,
                reason
            );
        }
    }

    /// Get the number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Engine slots a client advertised in its hello, if it has sent one.
    pub fn engine_slots(&self, client_id: ClientId) -> Option<&[SlotId]> {
        self.clients
            .get(&client_id)
            .map(|c| c.engine_slots.as_slice())
    }

    /// Close every session.
    pub fn shutdown(&mut self) {
        let count = self.clients.len();
        self.clients.clear();
        info!(target: "server", "FanoutServer shut down, closed {} clients", count);
    }
}

/// Push a frame and judge the client's lag. `Err` carries the reason to drop it.
fn enqueue(
    client: &mut ClientConnection,
    payload: Arc<str>,
    capacity: usize,
    lag_limit: Duration,
    now: Instant,
) -> Result<(), &'static str> {
    if client.outbound.send(payload).is_err() {
        return Err("session ended");
    }
    let backlog = client.outbound.len();
    if backlog <= capacity {
        client.behind_since = None;
        return Ok(());
    }
    if backlog > MAX_BACKLOG {
        return Err("backlog over hard cap");
    }
    let since = *client.behind_since.get_or_insert(now);
    if now.duration_since(since) >= lag_limit {
        return Err("behind for too long");
    }
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Session thread: performs the websocket handshake, then alternates between
/// draining the outbound queue and polling the socket for client frames.
fn client_session_thread(
    client_id: ClientId,
    stream: TcpStream,
    outbound: Receiver<Arc<str>>,
    event_tx: Sender<ClientEvent>,
) {
    let setup = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(IO_TIMEOUT)))
        .and_then(|_| stream.set_write_timeout(Some(IO_TIMEOUT)));
    if let Err(e) = setup {
        warn!(target: "server", "Client {:?} socket setup failed: {}", client_id, e);
        let _ = event_tx.send(ClientEvent::Closed { client_id });
        return;
    }

    let mut ws = match tungstenite::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            warn!(target: "server", "Client {:?} handshake failed: {}", client_id, e);
            let _ = event_tx.send(ClientEvent::Closed { client_id });
            return;
        }
    };
    if let Err(e) = ws.get_ref().set_read_timeout(Some(SESSION_POLL)) {
        warn!(target: "server", "Client {:?} socket setup failed: {}", client_id, e);
    }

    run_session(client_id, &mut ws, &outbound, &event_tx);

    let _ = event_tx.send(ClientEvent::Closed { client_id });
    debug!(target: "server", "Client {:?} session thread exiting", client_id);
}

fn run_session(
    client_id: ClientId,
    ws: &mut WebSocket<TcpStream>,
    outbound: &Receiver<Arc<str>>,
    event_tx: &Sender<ClientEvent>,
) {
    loop {
        loop {
            match outbound.try_recv() {
                Ok(payload) => {
                    if let Err(e) = ws.write(Message::text(payload.as_ref())) {
                        warn!(target: "server", "Client {:?} write failed: {}", client_id, e);
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Server dropped us: isolated or shutting down.
                    let _ = ws.close(None);
                    let _ = ws.flush();
                    return;
                }
            }
        }
        if let Err(e) = ws.flush() {
            warn!(target: "server", "Client {:?} flush failed: {}", client_id, e);
            return;
        }

        match ws.read() {
            Ok(Message::Text(text)) => match parse_client_frame(&text) {
                Ok(ClientMessage::Hello { engine_slots }) => {
                    if event_tx
                        .send(ClientEvent::Hello {
                            client_id,
                            engine_slots,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    debug!(target: "server", "Client {:?} sent unusable frame: {}", client_id, e);
                }
            },
            Ok(Message::Close(_)) => return,
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e)) if is_timeout(e) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return
            }
            Err(e) => {
                debug!(target: "server", "Client {:?} read error: {}", client_id, e);
                return;
            }
        }
    }
}
