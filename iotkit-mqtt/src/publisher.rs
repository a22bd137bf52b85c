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

//! Supervised MQTT publisher session.

use std::time::Duration;

use iotkit_core::{
    encode_message, generate_device_id, ConnectionSupervisor, Message, Result, SessionState,
};
use log::debug;
use rumqttc::QoS;

use crate::config::{validate_topic, MqttConfig};
use crate::transport::{MqttOutbound, MqttTransport};

/// Publishes validated JSON messages to a broker.
///
/// The broker connection runs on its own task with automatic reconnects.
/// `publish` while disconnected returns `Ok(false)`; messages are not
/// buffered for a later connection.
pub struct MqttPublisher {
    config: MqttConfig,
    client_id: String,
    supervisor: ConnectionSupervisor<MqttTransport>,
}

impl MqttPublisher {
    /// Create a publisher. Fails if the default topic contains wildcards.
    pub fn new(config: MqttConfig) -> Result<Self> {
        validate_topic(&config.topic, false)?;

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| generate_device_id("iotkit_pub"));
        let name = format!("mqtt-pub {}", config.endpoint());
        let transport = MqttTransport::publisher(name.clone(), config.options(&client_id));
        let supervisor = ConnectionSupervisor::new(name, transport, config.reconnect);

        Ok(Self {
            config,
            client_id,
            supervisor,
        })
    }

    /// Start the background session without waiting for the broker.
    pub fn start(&self) -> Result<()> {
        self.supervisor.start()
    }

    /// Start the session and wait up to `timeout` for the broker to accept it.
    ///
    /// On timeout the session keeps retrying in the background; call
    /// [`disconnect`](Self::disconnect) to give up.
    pub async fn connect(&self, timeout: Duration) -> Result<()> {
        self.supervisor.start()?;
        self.supervisor.wait_connected(timeout).await
    }

    /// Stop the session. The publisher cannot be reconnected afterwards.
    pub async fn disconnect(&self) {
        self.supervisor.stop().await
    }

    /// Validate, serialise and publish `message`.
    ///
    /// `topic` overrides the configured default. Invalid messages or topics
    /// are errors; a missing connection is `Ok(false)`.
    pub async fn publish(&self, message: &Message, topic: Option<&str>, qos: QoS) -> Result<bool> {
        let payload = encode_message(message)?;
        let topic = match topic {
            Some(topic) => {
                validate_topic(topic, false)?;
                topic.to_string()
            }
            None => self.config.topic.clone(),
        };

        let published = self
            .supervisor
            .send(MqttOutbound {
                topic: topic.clone(),
                qos,
                payload: payload.into_bytes(),
            })
            .await;
        if !published {
            debug!("[{}] Message for '{topic}' was not published", self.supervisor.name());
        }
        Ok(published)
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

    /// Default publish topic.
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
    use iotkit_core::{into_message, Error};
    use serde_json::json;

    fn publisher() -> MqttPublisher {
        let config = MqttConfig::builder("localhost", "sensors/room1").build().unwrap();
        MqttPublisher::new(config).unwrap()
    }

    #[test]
    fn test_rejects_wildcard_default_topic() {
        let config = MqttConfig::builder("localhost", "sensors/#").build().unwrap();
        assert!(matches!(MqttPublisher::new(config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_generates_client_id() {
        let publisher = publisher();
        assert!(publisher.client_id().starts_with("iotkit_pub_"));
        assert_eq!(publisher.topic(), "sensors/room1");
        assert_eq!(publisher.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_soft_failure() {
        let publisher = publisher();
        let message = into_message(json!({"name": "temperature", "value": 21.5})).unwrap();

        let published = publisher.publish(&message, None, QoS::AtMostOnce).await.unwrap();
        assert!(!published);
    }

    #[tokio::test]
    async fn test_publish_validates_before_connection_check() {
        let publisher = publisher();

        let invalid = into_message(json!({"unit": "C"})).unwrap();
        let err = publisher.publish(&invalid, None, QoS::AtMostOnce).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let valid = into_message(json!({"name": "t"})).unwrap();
        let err = publisher
            .publish(&valid, Some("sensors/+"), QoS::AtMostOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let publisher = publisher();
        publisher.disconnect().await;
        publisher.disconnect().await;
        assert_eq!(publisher.state(), SessionState::Idle);
    }
}
