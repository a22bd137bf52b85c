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

//! Configuration types for MQTT sessions.

use std::time::Duration;

use iotkit_core::{Error, ReconnectPolicy, Result};
use rumqttc::{MqttOptions, QoS};

/// Configuration shared by [`MqttPublisher`](crate::MqttPublisher) and
/// [`MqttSubscriber`](crate::MqttSubscriber).
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP.
    pub broker_host: String,
    /// MQTT broker port (default: 1883).
    pub port: u16,
    /// Default publish topic, or the subscription filter (wildcards allowed for subscribers).
    pub topic: String,
    /// MQTT client ID. Generated per session when not set.
    pub client_id: Option<String>,
    /// Optional MQTT username for authentication.
    pub username: Option<String>,
    /// Optional MQTT password for authentication.
    pub password: Option<String>,
    /// Keep-alive interval negotiated with the broker (default: 30s).
    pub keep_alive: Duration,
    /// QoS requested when subscribing (default: at most once).
    pub subscribe_qos: QoS,
    /// Reconnect behaviour after a failed connect or a lost connection.
    pub reconnect: ReconnectPolicy,
}

impl MqttConfig {
    /// Start building a new config with the required fields.
    pub fn builder(broker_host: impl Into<String>, topic: impl Into<String>) -> MqttConfigBuilder {
        MqttConfigBuilder {
            broker_host: broker_host.into(),
            topic: topic.into(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            subscribe_qos: QoS::AtMostOnce,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// `mqtt://host:port`, used in log prefixes and timeout errors.
    pub fn endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.broker_host, self.port)
    }

    pub(crate) fn options(&self, client_id: &str) -> MqttOptions {
        let mut opts = MqttOptions::new(client_id, &self.broker_host, self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);

        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            opts.set_credentials(user, pass);
        }
        opts
    }
}

/// Builder for [`MqttConfig`].
pub struct MqttConfigBuilder {
    broker_host: String,
    topic: String,
    port: u16,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    keep_alive: Duration,
    subscribe_qos: QoS,
    reconnect: ReconnectPolicy,
}

impl MqttConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn subscribe_qos(mut self, qos: QoS) -> Self {
        self.subscribe_qos = qos;
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

    /// Validate and build the config.
    pub fn build(self) -> Result<MqttConfig> {
        let host = self.broker_host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(Error::Configuration(format!(
                "invalid broker host '{}'",
                self.broker_host
            )));
        }
        if self.port == 0 {
            return Err(Error::Configuration("broker port must not be 0".into()));
        }
        if self.keep_alive < Duration::from_secs(5) {
            return Err(Error::Configuration(format!(
                "keep-alive {:?} is shorter than the 5s minimum",
                self.keep_alive
            )));
        }
        validate_topic(&self.topic, true)?;

        Ok(MqttConfig {
            broker_host: host.to_string(),
            port: self.port,
            topic: self.topic,
            client_id: self.client_id,
            username: self.username,
            password: self.password,
            keep_alive: self.keep_alive,
            subscribe_qos: self.subscribe_qos,
            reconnect: self.reconnect,
        })
    }
}

/// Map a numeric QoS level (0, 1 or 2) to [`QoS`].
pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::Configuration(format!(
            "invalid QoS level {other}, must be 0, 1 or 2"
        ))),
    }
}

/// Check a topic against the MQTT naming rules.
///
/// `+` must occupy a whole level and `#` must be the whole last level.
/// Publish topics must not contain wildcards at all.
pub fn validate_topic(topic: &str, allow_wildcards: bool) -> Result<()> {
    let invalid = |reason: &str| Err(Error::Configuration(format!("invalid topic '{topic}': {reason}")));

    if topic.is_empty() {
        return invalid("topic is empty");
    }
    if topic.len() > usize::from(u16::MAX) {
        return invalid("topic exceeds 65535 bytes");
    }
    if topic.contains('\0') {
        return invalid("topic contains a NUL character");
    }
    if topic.starts_with('/') || topic.ends_with('/') {
        return invalid("topic must not start or end with '/'");
    }

    let levels: Vec<&str> = topic.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let has_plus = level.contains('+');
        let has_hash = level.contains('#');
        if (has_plus || has_hash) && !allow_wildcards {
            return invalid("wildcards are not allowed when publishing");
        }
        if has_plus && *level != "+" {
            return invalid("'+' must occupy an entire level");
        }
        if has_hash && (*level != "#" || i != levels.len() - 1) {
            return invalid("'#' must be the entire last level");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = MqttConfig::builder("broker.local", "sensors/#").build().unwrap();
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert_eq!(config.subscribe_qos, QoS::AtMostOnce);
        assert!(config.client_id.is_none());
        assert!(config.reconnect.auto_reconnect);
        assert_eq!(config.endpoint(), "mqtt://broker.local:1883");
    }

    #[test]
    fn test_builder_overrides() {
        let config = MqttConfig::builder("10.0.0.5", "plant/line1")
            .port(8883)
            .client_id("gateway-1")
            .username("user")
            .password("secret")
            .auto_reconnect(false)
            .reconnect_interval(Duration::from_secs(1))
            .build()
            .unwrap();

        assert_eq!(config.port, 8883);
        assert_eq!(config.client_id.as_deref(), Some("gateway-1"));
        assert!(!config.reconnect.auto_reconnect);
        assert_eq!(config.reconnect.reconnect_interval, Duration::from_secs(1));

        let opts = config.options("gateway-1");
        assert_eq!(opts.client_id(), "gateway-1");
        assert_eq!(opts.broker_address(), ("10.0.0.5".to_string(), 8883));
    }

    #[test]
    fn test_rejects_bad_host() {
        assert!(matches!(
            MqttConfig::builder("  ", "t").build(),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            MqttConfig::builder("bad host", "t").build(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_topic_rules() {
        assert!(validate_topic("sensors/room1/temp", false).is_ok());
        assert!(validate_topic("sensors/+/temp", true).is_ok());
        assert!(validate_topic("sensors/#", true).is_ok());
        assert!(validate_topic("#", true).is_ok());

        assert!(validate_topic("", true).is_err());
        assert!(validate_topic("/sensors", true).is_err());
        assert!(validate_topic("sensors/", true).is_err());
        assert!(validate_topic("sensors/#/temp", true).is_err());
        assert!(validate_topic("sensors/room+/temp", true).is_err());
        assert!(validate_topic("sensors/a#", true).is_err());
        assert!(validate_topic("sensors/+/temp", false).is_err());
        assert!(validate_topic("bad\0topic", true).is_err());
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_level(3).is_err());
    }
}
