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

//! tokio-tungstenite-backed [`Transport`] for WebSocket client sessions.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use iotkit_core::{decode_payload, guard, HandlerSlot, MessageHandler, Transport, TransportError};
use log::{debug, trace, warn};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::WebSocketClientConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ping intervals without any inbound frame before the link counts as dead.
const MISSED_PINGS: u32 = 3;

enum Role {
    /// Writes frames and pings the endpoint to detect half-open connections.
    Publisher,
    /// Reads frames and hands decoded JSON to the handler.
    Subscriber(HandlerSlot<dyn MessageHandler>),
}

/// One client connection. The stream is replaced on every (re)connect.
pub struct WsClientTransport {
    name: String,
    config: WebSocketClientConfig,
    role: Role,
    stream: Option<WsStream>,
    ping: Option<Interval>,
    last_seen: Instant,
}

impl WsClientTransport {
    pub fn publisher(name: impl Into<String>, config: WebSocketClientConfig) -> Self {
        Self::with_role(name.into(), config, Role::Publisher)
    }

    pub fn subscriber(
        name: impl Into<String>,
        config: WebSocketClientConfig,
        handler: HandlerSlot<dyn MessageHandler>,
    ) -> Self {
        Self::with_role(name.into(), config, Role::Subscriber(handler))
    }

    fn with_role(name: String, config: WebSocketClientConfig, role: Role) -> Self {
        Self {
            name,
            config,
            role,
            stream: None,
            ping: None,
            last_seen: Instant::now(),
        }
    }

    fn on_frame(&self, frame: Message) -> Result<(), TransportError> {
        match frame {
            Message::Text(text) => self.deliver(text.as_str().as_bytes()),
            Message::Binary(bytes) => self.deliver(&bytes),
            Message::Close(close) => {
                debug!("[{}] Server closed the connection: {close:?}", self.name);
                return Err(TransportError::Closed);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
        Ok(())
    }

    fn deliver(&self, payload: &[u8]) {
        let Role::Subscriber(handler) = &self.role else {
            trace!("[{}] Ignoring {} inbound bytes", self.name, payload.len());
            return;
        };

        let data = match decode_payload(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("[{}] Dropping non-JSON frame: {e}", self.name);
                return;
            }
        };
        if let Some(handler) = handler.get() {
            let _ = guard(&self.name, "on_message", || {
                handler.on_message(&self.config.uri, &data)
            });
        }
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    /// An already-encoded JSON text frame.
    type Outbound = String;

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.stream = None;
        self.ping = None;

        let request = self
            .config
            .handshake_request()
            .map_err(TransportError::protocol)?;
        let timeout = self.config.handshake_timeout;
        let (stream, response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(TransportError::protocol)?;
        debug!("[{}] Handshake completed with status {}", self.name, response.status());

        if matches!(self.role, Role::Publisher) {
            let period = self.config.ping_interval;
            let mut ping = interval_at(Instant::now() + period, period);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ping = Some(ping);
        }
        self.stream = Some(stream);
        self.last_seen = Instant::now();
        Ok(())
    }

    async fn next_event(&mut self) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let frame = match self.ping.as_mut() {
            Some(ping) => tokio::select! {
                _ = ping.tick() => {
                    let silence = self.last_seen.elapsed();
                    let limit = self.config.ping_interval * MISSED_PINGS;
                    if silence > limit {
                        warn!("[{}] No frames for {silence:?}, assuming the link is dead", self.name);
                        return Err(TransportError::Timeout(limit));
                    }
                    stream
                        .send(Message::Ping(Default::default()))
                        .await
                        .map_err(TransportError::protocol)?;
                    trace!("[{}] Sent ping", self.name);
                    return Ok(());
                }
                frame = stream.next() => frame,
            },
            None => stream.next().await,
        };

        match frame {
            Some(Ok(frame)) => {
                // Pongs and data frames alike prove the peer is alive.
                self.last_seen = Instant::now();
                self.on_frame(frame)
            }
            Some(Err(e)) => Err(TransportError::protocol(e)),
            None => Err(TransportError::Closed),
        }
    }

    async fn write(&mut self, item: String) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        trace!("[{}] Sending {} bytes", self.name, item.len());
        stream
            .send(Message::text(item))
            .await
            .map_err(TransportError::protocol)
    }

    async fn close(&mut self) {
        self.ping = None;
        if let Some(mut stream) = self.stream.take() {
            let _ = tokio::time::timeout(self.config.handshake_timeout, stream.close(None)).await;
        }
    }
}
