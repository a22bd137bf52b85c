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

//! Bridge between a WebSocket server and named client sessions.
//!
//! Messages from server peers are wrapped and forwarded to every connected
//! publisher. Messages arriving on a subscriber are wrapped and broadcast to
//! the server's peers.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use iotkit_core::{generate_timestamp, Error, MessageHandler, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::config::{WebSocketClientConfig, WebSocketServerConfig};
use crate::publisher::WebSocketPublisher;
use crate::server::{PeerHandle, ServerCallbacks, WebSocketServer};
use crate::subscriber::WebSocketSubscriber;

const CLIENT_SOURCE: &str = "websocket_client";
const SUBSCRIBER_SOURCE: &str = "websocket_subscriber";

/// Envelopes waiting for one forwarding target. A full queue drops new envelopes.
const FORWARD_QUEUE_DEPTH: usize = 256;

type Publishers = DashMap<String, PublisherRoute>;

/// A publisher plus the ordered queue feeding it.
#[derive(Clone)]
struct PublisherRoute {
    publisher: Arc<WebSocketPublisher>,
    queue: mpsc::Sender<String>,
}

/// Envelope for a message received from a server peer.
pub fn wrap_client_message(client_address: &str, data: &Value) -> Value {
    json!({
        "source": CLIENT_SOURCE,
        "client_address": client_address,
        "bridge_timestamp": generate_timestamp(),
        "data": data,
    })
}

/// Envelope for a message received on a named subscriber.
pub fn wrap_subscriber_message(subscriber_name: &str, data: &Value) -> Value {
    json!({
        "source": SUBSCRIBER_SOURCE,
        "subscriber_name": subscriber_name,
        "bridge_timestamp": generate_timestamp(),
        "data": data,
    })
}

/// Point-in-time view of a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeStatus {
    pub server_clients: usize,
    pub publishers: BTreeMap<String, bool>,
    pub subscribers: BTreeMap<String, bool>,
}

pub struct WebSocketBridge {
    server: Arc<WebSocketServer>,
    publishers: Arc<Publishers>,
    subscribers: DashMap<String, Arc<WebSocketSubscriber>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl WebSocketBridge {
    pub fn new(server_config: WebSocketServerConfig) -> Self {
        let server = Arc::new(WebSocketServer::new(server_config));
        let publishers: Arc<Publishers> = Arc::new(DashMap::new());

        let targets = Arc::clone(&publishers);
        server.set_handler(
            ServerCallbacks::new()
                .on_message(move |peer: &PeerHandle, data: &Value| forward_to_publishers(&targets, peer, data)),
        );

        Self {
            server,
            publishers,
            subscribers: DashMap::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &WebSocketServer {
        &self.server
    }

    /// Register an outbound publisher under `name`.
    ///
    /// A session already registered under the same name is stopped and
    /// replaced. The new session starts immediately if the bridge is running.
    pub async fn add_publisher(&self, name: impl Into<String>, config: WebSocketClientConfig) -> Result<()> {
        let name = name.into();
        let publisher = Arc::new(WebSocketPublisher::new(config));
        if self.running.load(Ordering::Acquire) {
            publisher.start()?;
        }

        let target = Arc::clone(&publisher);
        let queue = ordered_queue(format!("publisher '{name}'"), move |payload: String| {
            let target = Arc::clone(&target);
            async move { target.send_encoded(payload).await }
        });

        info!("[bridge] Added publisher '{name}' -> {}", publisher.uri());
        if let Some(previous) = self.publishers.insert(name.clone(), PublisherRoute { publisher, queue }) {
            warn!("[bridge] Replacing publisher '{name}', stopping the previous session");
            previous.publisher.disconnect().await;
        }
        Ok(())
    }

    /// Register an inbound subscriber whose messages are broadcast to the
    /// server's peers.
    pub async fn add_subscriber(&self, name: impl Into<String>, config: WebSocketClientConfig) -> Result<()> {
        let name = name.into();
        let server = Arc::clone(&self.server);
        let queue = ordered_queue(format!("server from subscriber '{name}'"), move |payload: Arc<str>| {
            let server = Arc::clone(&server);
            async move { server.broadcast_encoded(payload).await }
        });
        let subscriber_name = name.clone();
        let forward = move |_uri: &str, data: &Value| {
            forward_to_server(&queue, &subscriber_name, data);
        };
        self.add_subscriber_with_handler(name, config, forward).await
    }

    /// Register an inbound subscriber with a custom handler instead of the
    /// default forwarding to server peers.
    pub async fn add_subscriber_with_handler(
        &self,
        name: impl Into<String>,
        config: WebSocketClientConfig,
        handler: impl MessageHandler,
    ) -> Result<()> {
        let name = name.into();
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let subscriber = Arc::new(WebSocketSubscriber::with_shared_handler(config, handler));
        if self.running.load(Ordering::Acquire) {
            subscriber.start()?;
        }

        info!("[bridge] Added subscriber '{name}' <- {}", subscriber.uri());
        if let Some(previous) = self.subscribers.insert(name.clone(), subscriber) {
            warn!("[bridge] Replacing subscriber '{name}', stopping the previous session");
            previous.disconnect().await;
        }
        Ok(())
    }

    /// Start the server and every registered session.
    ///
    /// Every session is attempted even if the server or another session
    /// fails; a server failure is returned after the rest have started.
    ///
    /// A stopped bridge cannot be started again.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Terminated("bridge".to_string()));
        }
        self.running.store(true, Ordering::Release);
        let server = self.server.start().await;
        if let Err(e) = &server {
            error!("[bridge] Failed to start server: {e}");
        }

        for (name, route) in snapshot(&self.publishers) {
            if let Err(e) = route.publisher.start() {
                error!("[bridge] Failed to start publisher '{name}': {e}");
            }
        }
        for (name, subscriber) in snapshot(&self.subscribers) {
            if let Err(e) = subscriber.start() {
                error!("[bridge] Failed to start subscriber '{name}': {e}");
            }
        }

        let addr = server?;
        info!("[bridge] Started on {addr}");
        Ok(addr)
    }

    /// Stop the server and every registered session. Final once started.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.stopped.store(true, Ordering::Release);
        }
        self.server.stop().await;
        for (name, route) in snapshot(&self.publishers) {
            debug!("[bridge] Stopping publisher '{name}'");
            route.publisher.disconnect().await;
        }
        for (name, subscriber) in snapshot(&self.subscribers) {
            debug!("[bridge] Stopping subscriber '{name}'");
            subscriber.disconnect().await;
        }
        info!("[bridge] Stopped");
    }

    pub fn get_status(&self) -> BridgeStatus {
        BridgeStatus {
            server_clients: self.server.connected_clients_count(),
            publishers: self
                .publishers
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().publisher.is_connected()))
                .collect(),
            subscribers: self
                .subscribers
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().is_connected()))
                .collect(),
        }
    }
}

/// Clone the map contents so no shard lock is held across an await.
fn snapshot<T: Clone>(map: &DashMap<String, T>) -> Vec<(String, T)> {
    map.iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect()
}

/// Spawn one task delivering queued payloads to a target in arrival order.
///
/// The task ends once every sender is dropped.
fn ordered_queue<P, F, Fut>(target: String, mut deliver: F) -> mpsc::Sender<P>
where
    P: Send + 'static,
    F: FnMut(P) -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
{
    let (queue, mut pending) = mpsc::channel(FORWARD_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(payload) = pending.recv().await {
            if !deliver(payload).await {
                warn!("[bridge] Failed to forward to {target}");
            }
        }
        debug!("[bridge] Forwarding to {target} finished");
    });
    queue
}

fn enqueue<P>(queue: &mpsc::Sender<P>, payload: P, target: &str) {
    if let Err(e) = queue.try_send(payload) {
        warn!("[bridge] Dropping envelope for {target}: {e}");
    }
}

fn forward_to_publishers(publishers: &Publishers, peer: &PeerHandle, data: &Value) {
    let targets: Vec<(String, PublisherRoute)> = snapshot(publishers)
        .into_iter()
        .filter(|(_, route)| route.publisher.is_connected())
        .collect();
    if targets.is_empty() {
        debug!("[bridge] No connected publishers for message from {}", peer.identity());
        return;
    }

    let envelope = wrap_client_message(&peer.identity(), data).to_string();
    for (name, route) in targets {
        enqueue(&route.queue, envelope.clone(), &name);
    }
}

fn forward_to_server(queue: &mpsc::Sender<Arc<str>>, subscriber_name: &str, data: &Value) {
    let envelope: Arc<str> = Arc::from(wrap_subscriber_message(subscriber_name, data).to_string());
    enqueue(queue, envelope, "server");
}
