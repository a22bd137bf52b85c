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

//! Supervised MQTT subscriber session.

use std::sync::Arc;
use std::time::Duration;

use iotkit_core::{
    generate_device_id, ConnectionSupervisor, Error, HandlerSlot, MessageHandler, Result,
    SessionState,
};
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::transport::MqttTransport;

/// Subscribes to a topic filter and hands decoded JSON messages to a handler.
///
/// The subscription is re-issued after every (re)connect. Payloads that are
/// not JSON are logged and dropped without reaching the handler.
pub struct MqttSubscriber {
    config: MqttConfig,
    client_id: String,
    handler: HandlerSlot<dyn MessageHandler>,
    supervisor: ConnectionSupervisor<MqttTransport>,
}

impl MqttSubscriber {
    /// Create a subscriber without a handler; messages are decoded and discarded
    /// until one is installed.
    pub fn new(config: MqttConfig) -> Self {
        Self::with_slot(config, HandlerSlot::empty())
    }

    /// Create a subscriber delivering `(topic, data)` to `handler`.
    pub fn with_handler(config: MqttConfig, handler: impl MessageHandler) -> Self {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        Self::with_slot(config, HandlerSlot::new(handler))
    }

    fn with_slot(config: MqttConfig, handler: HandlerSlot<dyn MessageHandler>) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| generate_device_id("iotkit_sub"));
        let name = format!("mqtt-sub {}", config.endpoint());
        let transport = MqttTransport::subscriber(
            name.clone(),
            config.options(&client_id),
            config.topic.clone(),
            config.subscribe_qos,
            handler.clone(),
        );
        let supervisor = ConnectionSupervisor::new(name, transport, config.reconnect);

        Self {
            config,
            client_id,
            handler,
            supervisor,
        }
    }

    /// Install or replace the message handler, effective for the next message.
    pub fn set_message_handler(&self, handler: impl MessageHandler) {
        self.handler.set(Arc::new(handler));
    }

    pub fn start(&self) -> Result<()> {
        self.supervisor.start()
    }

    /// Start the session and wait up to `timeout` for the broker to accept it.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        self.supervisor.start()?;
        self.supervisor.wait_connected(timeout).await
    }

    pub async fn disconnect(&self) {
        self.supervisor.stop().await
    }

    /// Block the calling task until the session terminates.
    ///
    /// Requires a live connection. Reconnects happen underneath without
    /// returning; the call ends after [`disconnect`](Self::disconnect) or when
    /// the session gives up.
    pub async fn listen(&self) -> Result<()> {
        let mut states = self.listening_states()?;
        let _finished = states.wait_for(|s| *s == SessionState::Terminated).await.is_ok();
        Ok(())
    }

    /// Like [`listen`](Self::listen), on a spawned task.
    pub fn listen_async(&self) -> Result<JoinHandle<()>> {
        let mut states = self.listening_states()?;
        Ok(tokio::spawn(async move {
            let _finished = states.wait_for(|s| *s == SessionState::Terminated).await.is_ok();
        }))
    }

    fn listening_states(&self) -> Result<tokio::sync::watch::Receiver<SessionState>> {
        if !self.supervisor.is_connected() {
            return Err(Error::NotConnected(self.supervisor.name().to_string()));
        }
        Ok(self.supervisor.subscribe_state())
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

    /// The subscription filter.
    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_accepts_wildcard_filter() {
        let config = MqttConfig::builder("localhost", "sensors/+/temp").build().unwrap();
        let subscriber = MqttSubscriber::with_handler(config, |_: &str, _: &Value| {});
        assert_eq!(subscriber.topic(), "sensors/+/temp");
        assert!(subscriber.client_id().starts_with("iotkit_sub_"));
    }

    #[tokio::test]
    async fn test_listen_requires_connection() {
        let config = MqttConfig::builder("localhost", "sensors/#").build().unwrap();
        let subscriber = MqttSubscriber::new(config);

        assert!(matches!(subscriber.listen().await, Err(Error::NotConnected(_))));
        assert!(matches!(subscriber.listen_async(), Err(Error::NotConnected(_))));
    }
}
