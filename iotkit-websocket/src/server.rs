// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! WebSocket server session.
//!
//! One hub task owns the listener and the [`ClientRegistry`]; every accepted
//! peer runs on its own child task and talks to the hub over a channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use iotkit_core::{
    decode_payload, encode_message, guard, Error, HandlerSlot, Message, Result, SEND_TIMEOUT,
    STOP_TIMEOUT,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_util::sync::CancellationToken;

use crate::config::WebSocketServerConfig;
use crate::registry::{ClientRegistry, PeerId, PeerSendError, PeerSink};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HUB_QUEUE_DEPTH: usize = 256;

/// Callbacks for server events. All methods default to no-ops.
///
/// Called from the hub task (`on_connect`, `on_disconnect`) or the peer's
/// own task (`on_message`). Panics are caught and logged.
pub trait ServerHandler: Send + Sync + 'static {
    fn on_connect(&self, _peer: &PeerHandle) {}

    fn on_message(&self, _peer: &PeerHandle, _data: &Value) {}

    fn on_disconnect(&self, _peer: &PeerHandle) {}
}

type PeerCallback = Box<dyn Fn(&PeerHandle) + Send + Sync>;
type PeerMessageCallback = Box<dyn Fn(&PeerHandle, &Value) + Send + Sync>;

/// [`ServerHandler`] assembled from closures.
#[derive(Default)]
pub struct ServerCallbacks {
    on_connect: Option<PeerCallback>,
    on_message: Option<PeerMessageCallback>,
    on_disconnect: Option<PeerCallback>,
}

impl ServerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, f: impl Fn(&PeerHandle) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(&PeerHandle, &Value) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn(&PeerHandle) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }
}

impl ServerHandler for ServerCallbacks {
    fn on_connect(&self, peer: &PeerHandle) {
        if let Some(f) = &self.on_connect {
            f(peer)
        }
    }

    fn on_message(&self, peer: &PeerHandle, data: &Value) {
        if let Some(f) = &self.on_message {
            f(peer, data)
        }
    }

    fn on_disconnect(&self, peer: &PeerHandle) {
        if let Some(f) = &self.on_disconnect {
            f(peer)
        }
    }
}

/// A connected peer as seen by callbacks.
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    addr: SocketAddr,
    tx: mpsc::Sender<Arc<str>>,
    closer: CancellationToken,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `address:port` of the remote end.
    pub fn identity(&self) -> String {
        self.addr.to_string()
    }

    /// Queue a message for this peer only. `Ok(false)` if the peer is gone
    /// or its queue is full.
    pub fn send(&self, message: &Message) -> Result<bool> {
        let payload: Arc<str> = Arc::from(encode_message(message)?);
        Ok(self.deliver(&payload).is_ok())
    }

    /// Close this peer's connection.
    pub fn disconnect(&self) {
        self.closer.cancel();
    }
}

impl PeerSink for PeerHandle {
    fn deliver(&self, payload: &Arc<str>) -> std::result::Result<(), PeerSendError> {
        self.tx.try_send(Arc::clone(payload)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerSendError::Full,
            mpsc::error::TrySendError::Closed(_) => PeerSendError::Closed,
        })
    }

    fn close(&self) {
        self.closer.cancel();
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

enum HubCommand {
    Joined(PeerHandle),
    Left(PeerId),
    Broadcast {
        payload: Arc<str>,
        ack: oneshot::Sender<usize>,
    },
}

struct Running {
    addr: SocketAddr,
    hub: mpsc::Sender<HubCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Accepts WebSocket peers and broadcasts messages to all of them.
///
/// A peer that fails a delivery (closed connection or full queue) is
/// dropped from the registry and disconnected; other peers are unaffected.
pub struct WebSocketServer {
    name: String,
    config: WebSocketServerConfig,
    handler: HandlerSlot<dyn ServerHandler>,
    clients: Arc<AtomicUsize>,
    running: Mutex<Option<Running>>,
    stopped: AtomicBool,
}

impl WebSocketServer {
    pub fn new(config: WebSocketServerConfig) -> Self {
        Self {
            name: format!("ws-server {}", config.bind_addr()),
            config,
            handler: HandlerSlot::empty(),
            clients: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_handler(config: WebSocketServerConfig, handler: impl ServerHandler) -> Self {
        let server = Self::new(config);
        server.set_handler(handler);
        server
    }

    /// Install or replace the event handler.
    pub fn set_handler(&self, handler: impl ServerHandler) {
        self.handler.set(Arc::new(handler));
    }

    /// Bind the listener and start accepting peers.
    ///
    /// Returns the bound address. A no-op returning the same address while
    /// already running. Fails with [`Error::Terminated`] after [`stop`](Self::stop).
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Terminated(self.name.clone()));
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| Error::Bind {
            addr: bind_addr,
            source,
        })?;

        let mut running = self.running.lock();
        if let Some(existing) = running.as_ref() {
            return Ok(existing.addr);
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Terminated(self.name.clone()));
        }

        let (hub, commands) = mpsc::channel(HUB_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let hub_task = Hub {
            name: format!("ws-server {addr}"),
            handler: self.handler.clone(),
            clients: Arc::clone(&self.clients),
            queue_capacity: self.config.peer_queue_capacity,
            hub: hub.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(hub_task.run(listener, commands));

        info!("[{}] Listening on {addr}", self.name);
        *running = Some(Running {
            addr,
            hub,
            cancel,
            task,
        });
        Ok(addr)
    }

    /// Close the listener and every peer connection, then wait (bounded)
    /// for the hub task. Safe to call repeatedly; a stopped server cannot
    /// be started again.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        self.stopped.store(true, Ordering::Release);

        running.cancel.cancel();
        let mut task = running.task;
        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(Ok(())) => info!("[{}] Server stopped", self.name),
            Ok(Err(e)) => error!("[{}] Server task failed: {e}", self.name),
            Err(_) => {
                error!("[{}] Server did not stop within {STOP_TIMEOUT:?}, abandoning it", self.name);
                task.abort();
            }
        }
        self.clients.store(0, Ordering::Release);
    }

    /// Validate `message` once and queue it for every connected peer.
    ///
    /// `Ok(true)` means the broadcast was dispatched, not that every peer
    /// received it. `Ok(false)` if the server is not running.
    pub async fn broadcast(&self, message: &Message) -> Result<bool> {
        let payload = encode_message(message)?;
        Ok(self.broadcast_encoded(Arc::from(payload)).await)
    }

    pub(crate) async fn broadcast_encoded(&self, payload: Arc<str>) -> bool {
        let hub = self.running.lock().as_ref().map(|running| running.hub.clone());
        let Some(hub) = hub else {
            debug!("[{}] Not running, dropping broadcast", self.name);
            return false;
        };

        let (ack, acked) = oneshot::channel();
        let dispatch = async {
            hub.send(HubCommand::Broadcast { payload, ack }).await.ok()?;
            acked.await.ok()
        };
        match tokio::time::timeout(SEND_TIMEOUT, dispatch).await {
            Ok(Some(delivered)) => {
                debug!("[{}] Broadcast queued for {delivered} peers", self.name);
                true
            }
            Ok(None) => false,
            Err(_) => {
                warn!("[{}] Broadcast not dispatched within {SEND_TIMEOUT:?}", self.name);
                false
            }
        }
    }

    pub fn connected_clients_count(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn config(&self) -> &WebSocketServerConfig {
        &self.config
    }
}

impl Drop for WebSocketServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().as_ref() {
            running.cancel.cancel();
        }
    }
}

/// State of the hub task.
struct Hub {
    name: String,
    handler: HandlerSlot<dyn ServerHandler>,
    clients: Arc<AtomicUsize>,
    queue_capacity: usize,
    hub: mpsc::Sender<HubCommand>,
    cancel: CancellationToken,
}

impl Hub {
    async fn run(self, listener: TcpListener, mut commands: mpsc::Receiver<HubCommand>) {
        let mut registry: ClientRegistry<PeerHandle> = ClientRegistry::new();
        let mut peers = JoinSet::new();
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle(&mut registry, command),
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let id = PeerId(next_id);
                        next_id += 1;
                        debug!("[{}] Accepted TCP connection from {addr}", self.name);
                        peers.spawn(run_peer(PeerTask {
                            id,
                            addr,
                            name: self.name.clone(),
                            handler: self.handler.clone(),
                            hub: self.hub.clone(),
                            queue_capacity: self.queue_capacity,
                            closer: self.cancel.child_token(),
                        }, stream));
                    }
                    Err(e) => warn!("[{}] Accept failed: {e}", self.name),
                },
                Some(finished) = peers.join_next(), if !peers.is_empty() => {
                    if let Err(e) = finished {
                        error!("[{}] Peer task failed: {e}", self.name);
                    }
                }
            }
        }

        drop(listener);
        drop(commands);
        for (_, peer) in registry.drain() {
            peer.close();
            self.notify_disconnect(&peer);
        }
        self.clients.store(0, Ordering::Release);

        if tokio::time::timeout(STOP_TIMEOUT, async {
            while peers.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("[{}] Aborting {} unresponsive peer tasks", self.name, peers.len());
            peers.abort_all();
        }
        debug!("[{}] Hub finished", self.name);
    }

    fn handle(&self, registry: &mut ClientRegistry<PeerHandle>, command: HubCommand) {
        match command {
            HubCommand::Joined(peer) => {
                info!("[{}] Client connected: {}", self.name, peer.identity());
                registry.insert(peer.id, peer.clone());
                self.clients.store(registry.len(), Ordering::Release);
                if let Some(handler) = self.handler.get() {
                    let _ = guard(&self.name, "on_connect", || handler.on_connect(&peer));
                }
            }
            HubCommand::Left(id) => {
                if let Some(peer) = registry.remove(&id) {
                    self.clients.store(registry.len(), Ordering::Release);
                    info!("[{}] Client disconnected: {}", self.name, peer.identity());
                    self.notify_disconnect(&peer);
                }
            }
            HubCommand::Broadcast { payload, ack } => {
                let report = registry.broadcast(&payload);
                for pruned in &report.pruned {
                    warn!(
                        "[{}] Removing client {}: {}",
                        self.name,
                        pruned.sink.identity(),
                        pruned.reason
                    );
                    pruned.sink.close();
                    self.notify_disconnect(&pruned.sink);
                }
                self.clients.store(registry.len(), Ordering::Release);
                let _ = ack.send(report.delivered);
            }
        }
    }

    fn notify_disconnect(&self, peer: &PeerHandle) {
        if let Some(handler) = self.handler.get() {
            let _ = guard(&self.name, "on_disconnect", || handler.on_disconnect(peer));
        }
    }
}

struct PeerTask {
    id: PeerId,
    addr: SocketAddr,
    name: String,
    handler: HandlerSlot<dyn ServerHandler>,
    hub: mpsc::Sender<HubCommand>,
    queue_capacity: usize,
    closer: CancellationToken,
}

async fn run_peer(task: PeerTask, stream: TcpStream) {
    let handshake = tokio::select! {
        _ = task.closer.cancelled() => return,
        result = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream)) => result,
    };
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("[{}] Handshake with {} failed: {e}", task.name, task.addr);
            return;
        }
        Err(_) => {
            warn!("[{}] Handshake with {} timed out", task.name, task.addr);
            return;
        }
    };

    let (tx, mut outbound) = mpsc::channel::<Arc<str>>(task.queue_capacity);
    let peer = PeerHandle {
        id: task.id,
        addr: task.addr,
        tx,
        closer: task.closer.clone(),
    };
    if task.hub.send(HubCommand::Joined(peer.clone())).await.is_err() {
        return;
    }

    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            biased;
            _ = task.closer.cancelled() => {
                let _ = tokio::time::timeout(Duration::from_secs(1), sink.send(Frame::Close(None))).await;
                break;
            }
            Some(payload) = outbound.recv() => {
                if let Err(e) = sink.send(Frame::text(payload.to_string())).await {
                    warn!("[{}] Send to {} failed: {e}", task.name, task.addr);
                    break;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Frame::Text(text))) => deliver(&task, &peer, text.as_str().as_bytes()),
                Some(Ok(Frame::Binary(bytes))) => deliver(&task, &peer, &bytes),
                Some(Ok(Frame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[{}] Connection error from {}: {e}", task.name, task.addr);
                    break;
                }
            },
        }
    }

    let _ = task.hub.send(HubCommand::Left(task.id)).await;
}

fn deliver(task: &PeerTask, peer: &PeerHandle, payload: &[u8]) {
    let data = match decode_payload(payload) {
        Ok(data) => data,
        Err(e) => {
            warn!("[{}] Dropping non-JSON frame from {}: {e}", task.name, task.addr);
            return;
        }
    };
    if let Some(handler) = task.handler.get() {
        let _ = guard(&task.name, "on_message", || handler.on_message(peer, &data));
    }
}
