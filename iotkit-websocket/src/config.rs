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

//! Configuration types for WebSocket clients and the server.

use std::time::Duration;

use iotkit_core::{Error, ReconnectPolicy, Result};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};

/// Configuration for [`WebSocketPublisher`](crate::WebSocketPublisher) and
/// [`WebSocketSubscriber`](crate::WebSocketSubscriber).
#[derive(Debug, Clone)]
pub struct WebSocketClientConfig {
    /// `ws://` or `wss://` endpoint.
    pub uri: String,
    /// Extra headers sent with the upgrade request.
    pub headers: HeaderMap,
    /// Ping cadence while a publisher is connected (default: 1s).
    pub ping_interval: Duration,
    /// Upper bound on TCP connect plus upgrade handshake (default: 10s).
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl WebSocketClientConfig {
    pub fn builder(uri: impl Into<String>) -> WebSocketClientConfigBuilder {
        WebSocketClientConfigBuilder {
            uri: uri.into(),
            headers: Vec::new(),
            bearer_token: None,
            ping_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Upgrade request carrying the configured headers. Built fresh per attempt.
    pub(crate) fn handshake_request(
        &self,
    ) -> std::result::Result<Request, tokio_tungstenite::tungstenite::Error> {
        let mut request = self.uri.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(request)
    }
}

/// Builder for [`WebSocketClientConfig`].
pub struct WebSocketClientConfigBuilder {
    uri: String,
    headers: Vec<(String, String)>,
    bearer_token: Option<String>,
    ping_interval: Duration,
    handshake_timeout: Duration,
    reconnect: ReconnectPolicy,
}

impl WebSocketClientConfigBuilder {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send `Authorization: Bearer <token>` with the upgrade request.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect.reconnect_interval = interval;
        self
    }

    pub fn build(self) -> Result<WebSocketClientConfig> {
        let request = self
            .uri
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Configuration(format!("invalid WebSocket URI '{}': {e}", self.uri)))?;
        let uri = request.uri();
        if !matches!(uri.scheme_str(), Some("ws") | Some("wss")) {
            return Err(Error::Configuration(format!(
                "WebSocket URI '{}' must use ws:// or wss://",
                self.uri
            )));
        }
        if uri.host().map_or(true, str::is_empty) {
            return Err(Error::Configuration(format!(
                "WebSocket URI '{}' has no host",
                self.uri
            )));
        }
        if self.ping_interval.is_zero() {
            return Err(Error::Configuration("ping interval must be non-zero".into()));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Configuration(format!("invalid header name '{name}': {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| Error::Configuration(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(header_name, header_value);
        }
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Configuration(format!("invalid bearer token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(WebSocketClientConfig {
            uri: self.uri,
            headers,
            ping_interval: self.ping_interval,
            handshake_timeout: self.handshake_timeout,
            reconnect: self.reconnect,
        })
    }
}

/// Configuration for [`WebSocketServer`](crate::WebSocketServer).
#[derive(Debug, Clone)]
pub struct WebSocketServerConfig {
    /// Interface to bind (default: `localhost`).
    pub host: String,
    /// Port to bind (default: 8765, 0 for an ephemeral port).
    pub port: u16,
    /// Outbound frames buffered per peer before it counts as failed (default: 256).
    pub peer_queue_capacity: usize,
}

impl Default for WebSocketServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8765,
            peer_queue_capacity: 256,
        }
    }
}

impl WebSocketServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let config = Self {
            host: host.into(),
            port,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_peer_queue_capacity(mut self, capacity: usize) -> Result<Self> {
        self.peer_queue_capacity = capacity;
        self.validate()?;
        Ok(self)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration("server host must not be empty".into()));
        }
        if self.peer_queue_capacity == 0 {
            return Err(Error::Configuration(
                "peer queue capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
