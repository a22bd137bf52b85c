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

//! Supervised WebSocket publisher session.

use std::time::Duration;

use iotkit_core::{encode_message, ConnectionSupervisor, Message, Result, SessionState};

use crate::config::WebSocketClientConfig;
use crate::transport::WsClientTransport;

/// Sends validated JSON messages as text frames to a WebSocket endpoint.
///
/// While connected the session pings the endpoint every `ping_interval`;
/// a failed ping is treated as a lost connection. `send` while disconnected
/// returns `Ok(false)` and the message is dropped.
pub struct WebSocketPublisher {
    uri: String,
    supervisor: ConnectionSupervisor<WsClientTransport>,
}

impl WebSocketPublisher {
    pub fn new(config: WebSocketClientConfig) -> Self {
        let name = format!("ws-pub {}", config.uri);
        let uri = config.uri.clone();
        let reconnect = config.reconnect;
        let transport = WsClientTransport::publisher(name.clone(), config);
        Self {
            uri,
            supervisor: ConnectionSupervisor::new(name, transport, reconnect),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.supervisor.start()
    }

    /// Start the session and wait up to `timeout` for the handshake.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        self.supervisor.start()?;
        self.supervisor.wait_connected(timeout).await
    }

    pub async fn disconnect(&self) {
        self.supervisor.stop().await
    }

    /// Validate and send `message`. Invalid messages are errors; a missing
    /// connection is `Ok(false)`.
    pub async fn send(&self, message: &Message) -> Result<bool> {
        let payload = encode_message(message)?;
        Ok(self.send_encoded(payload).await)
    }

    /// Send a frame that was serialised elsewhere, skipping validation.
    pub(crate) async fn send_encoded(&self, payload: String) -> bool {
        self.supervisor.send(payload).await
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.supervisor.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.supervisor.last_error()
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotkit_core::{into_message, Error};
    use serde_json::json;

    fn publisher() -> WebSocketPublisher {
        let config = WebSocketClientConfig::builder("ws://127.0.0.1:9/ingest")
            .build()
            .unwrap();
        WebSocketPublisher::new(config)
    }

    #[tokio::test]
    async fn test_send_while_disconnected_returns_false() {
        let publisher = publisher();
        let message = into_message(json!({"sensor": "door", "value": 1})).unwrap();
        assert!(!publisher.send(&message).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_validates_first() {
        let publisher = publisher();
        let message = into_message(json!({"name": "t", "value": true})).unwrap();
        assert!(matches!(publisher.send(&message).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let publisher = publisher();
        publisher.disconnect().await;
        assert_eq!(publisher.state(), SessionState::Idle);
        assert_eq!(publisher.uri(), "ws://127.0.0.1:9/ingest");
    }
}
