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

//! Supervised WebSocket subscriber session.

use std::sync::Arc;
use std::time::Duration;

use iotkit_core::{ConnectionSupervisor, HandlerSlot, MessageHandler, Result, SessionState};

use crate::config::WebSocketClientConfig;
use crate::transport::WsClientTransport;

/// Receives frames from a WebSocket endpoint and hands decoded JSON to a
/// handler as `(uri, data)`.
///
/// The handler runs on the session task; a slow handler delays the next
/// frame. Frames that are not JSON are logged and skipped.
pub struct WebSocketSubscriber {
    uri: String,
    handler: HandlerSlot<dyn MessageHandler>,
    supervisor: ConnectionSupervisor<WsClientTransport>,
}

impl WebSocketSubscriber {
    pub fn new(config: WebSocketClientConfig) -> Self {
        Self::with_slot(config, HandlerSlot::empty())
    }

    pub fn with_handler(config: WebSocketClientConfig, handler: impl MessageHandler) -> Self {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        Self::with_slot(config, HandlerSlot::new(handler))
    }

    pub(crate) fn with_shared_handler(
        config: WebSocketClientConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self::with_slot(config, HandlerSlot::new(handler))
    }

    fn with_slot(config: WebSocketClientConfig, handler: HandlerSlot<dyn MessageHandler>) -> Self {
        let name = format!("ws-sub {}", config.uri);
        let uri = config.uri.clone();
        let reconnect = config.reconnect;
        let transport = WsClientTransport::subscriber(name.clone(), config, handler.clone());
        Self {
            uri,
            handler,
            supervisor: ConnectionSupervisor::new(name, transport, reconnect),
        }
    }

    pub fn set_message_handler(&self, handler: impl MessageHandler) {
        self.handler.set(Arc::new(handler));
    }

    pub fn start(&self) -> Result<()> {
        self.supervisor.start()
    }

    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        self.supervisor.start()?;
        self.supervisor.wait_connected(timeout).await
    }

    pub async fn disconnect(&self) {
        self.supervisor.stop().await
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
