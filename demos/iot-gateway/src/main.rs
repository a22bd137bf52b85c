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

//! Gateway demo: publishes a synthetic temperature reading over MQTT,
//! optionally over HTTP, and to every peer of a WebSocket bridge.
//!
//! Configured through `IOTKIT_*` environment variables, see [`GatewayConfig`].

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use iotkit_core::{generate_device_id, generate_timestamp, into_message, Message};
use iotkit_http::{HttpPublisher, HttpPublisherConfig, Method};
use iotkit_mqtt::{qos_from_level, MqttConfig, MqttPublisher, QoS};
use iotkit_websocket::{WebSocketBridge, WebSocketClientConfig, WebSocketServerConfig};
use log::{error, info, warn};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};

const ENV_PREFIX: &str = "IOTKIT_";

/// Gateway settings. Each field is read from `IOTKIT_<FIELD>` (upper case).
#[derive(Debug, Clone, Deserialize)]
struct GatewayConfig {
    #[serde(default = "default_device_id")]
    device_id: String,
    #[serde(default = "default_interval", deserialize_with = "parse")]
    interval_secs: u64,

    #[serde(default = "default_bridge_host")]
    bridge_host: String,
    #[serde(default = "default_bridge_port", deserialize_with = "parse")]
    bridge_port: u16,
    /// Forward bridge traffic to this WebSocket endpoint.
    upstream_ws: Option<String>,

    /// MQTT publishing is skipped when unset.
    mqtt_host: Option<String>,
    #[serde(default = "default_mqtt_port", deserialize_with = "parse")]
    mqtt_port: u16,
    #[serde(default = "default_mqtt_topic")]
    mqtt_topic: String,
    #[serde(default, deserialize_with = "parse")]
    mqtt_qos: u8,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,

    /// HTTP publishing is skipped when unset.
    http_url: Option<String>,
    http_token: Option<String>,
}

fn default_device_id() -> String {
    generate_device_id("gateway")
}

fn default_interval() -> u64 {
    5
}

fn default_bridge_host() -> String {
    "0.0.0.0".to_string()
}

fn default_bridge_port() -> u16 {
    8765
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "iotkit/readings".to_string()
}

/// Environment values are strings; parse numeric fields from them.
fn parse<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.trim().parse().map_err(serde::de::Error::custom)
}

impl GatewayConfig {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> anyhow::Result<Self> {
        let fields: Map<String, Value> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let field = key.strip_prefix(ENV_PREFIX)?.to_ascii_lowercase();
                Some((field, Value::String(value)))
            })
            .collect();
        let config: Self = serde_json::from_value(Value::Object(fields))
            .context("invalid IOTKIT_* configuration")?;
        if config.interval_secs == 0 {
            anyhow::bail!("IOTKIT_INTERVAL_SECS must be at least 1");
        }
        Ok(config)
    }
}

/// Deterministic temperature curve standing in for a real sensor.
struct SyntheticReading {
    device_id: String,
    step: u64,
}

impl SyntheticReading {
    fn new(device_id: String) -> Self {
        Self { device_id, step: 0 }
    }

    fn sample(&mut self) -> anyhow::Result<Message> {
        let value = 21.0 + 4.0 * (self.step as f64 * 0.2).sin();
        self.step += 1;
        let message = into_message(json!({
            "device_id": self.device_id,
            "name": "temperature",
            "value": (value * 100.0).round() / 100.0,
            "unit": "C",
            "timestamp": generate_timestamp(),
        }))?;
        Ok(message)
    }
}

struct Outputs {
    bridge: WebSocketBridge,
    mqtt: Option<(MqttPublisher, QoS)>,
    http: Option<HttpPublisher>,
}

impl Outputs {
    async fn publish(&self, message: &Message) {
        match self.bridge.server().broadcast(message).await {
            Ok(true) => {}
            Ok(false) => warn!("Bridge is not running, reading not broadcast"),
            Err(e) => error!("Bridge broadcast failed: {e}"),
        }

        if let Some((publisher, qos)) = &self.mqtt {
            match publisher.publish(message, None, *qos).await {
                Ok(true) => {}
                Ok(false) => warn!("MQTT broker unavailable, reading dropped"),
                Err(e) => error!("MQTT publish failed: {e}"),
            }
        }

        if let Some(publisher) = &self.http {
            match publisher.send(message, Method::POST, None).await {
                Ok(response) if response.success => {}
                Ok(response) => warn!("HTTP endpoint answered {}", response.status_code),
                Err(e) => error!("HTTP send failed: {e}"),
            }
        }
    }

    async fn shutdown(&self) {
        if let Some((publisher, _)) = &self.mqtt {
            publisher.disconnect().await;
        }
        self.bridge.stop().await;
    }
}

async fn build_outputs(config: &GatewayConfig) -> anyhow::Result<Outputs> {
    let bridge = WebSocketBridge::new(WebSocketServerConfig::new(
        config.bridge_host.clone(),
        config.bridge_port,
    )?);
    if let Some(uri) = &config.upstream_ws {
        bridge
            .add_publisher("upstream", WebSocketClientConfig::builder(uri.clone()).build()?)
            .await?;
    }

    let mqtt = match &config.mqtt_host {
        Some(host) => {
            let mut builder = MqttConfig::builder(host.clone(), config.mqtt_topic.clone())
                .port(config.mqtt_port)
                .client_id(config.device_id.clone());
            if let (Some(user), Some(pass)) = (&config.mqtt_username, &config.mqtt_password) {
                builder = builder.username(user.clone()).password(pass.clone());
            }
            let publisher = MqttPublisher::new(builder.build()?)?;
            Some((publisher, qos_from_level(config.mqtt_qos)?))
        }
        None => None,
    };

    let http = match &config.http_url {
        Some(url) => {
            let mut builder = HttpPublisherConfig::builder(url.clone());
            if let Some(token) = &config.http_token {
                builder = builder.auth_token(token.clone());
            }
            Some(HttpPublisher::new(builder.build()?)?)
        }
        None => None,
    };

    Ok(Outputs { bridge, mqtt, http })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = GatewayConfig::from_env()?;
    info!("Starting gateway {}", config.device_id);

    let outputs = build_outputs(&config).await?;
    let addr = outputs.bridge.start().await?;
    info!("Bridge listening on ws://{addr}");
    if let Some((publisher, _)) = &outputs.mqtt {
        publisher.start()?;
    }

    let mut reading = SyntheticReading::new(config.device_id.clone());
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let message = reading.sample()?;
                outputs.publish(&message).await;
            }
        }
    }

    info!("Shutting down");
    outputs.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_vars(vars(&[("PATH", "/usr/bin")])).unwrap();
        assert!(config.device_id.starts_with("gateway_"));
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.bridge_port, 8765);
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.mqtt_qos, 0);
        assert!(config.mqtt_host.is_none());
        assert!(config.http_url.is_none());
    }

    #[test]
    fn test_reads_prefixed_vars() {
        let config = GatewayConfig::from_vars(vars(&[
            ("IOTKIT_DEVICE_ID", "gw-7"),
            ("IOTKIT_MQTT_HOST", "broker.local"),
            ("IOTKIT_MQTT_PORT", "8883"),
            ("IOTKIT_MQTT_QOS", "1"),
            ("IOTKIT_INTERVAL_SECS", "2"),
            ("IOTKIT_HTTP_URL", "http://collector:8080/ingest"),
        ]))
        .unwrap();

        assert_eq!(config.device_id, "gw-7");
        assert_eq!(config.mqtt_host.as_deref(), Some("broker.local"));
        assert_eq!(config.mqtt_port, 8883);
        assert_eq!(config.mqtt_qos, 1);
        assert_eq!(config.interval_secs, 2);
        assert_eq!(config.http_url.as_deref(), Some("http://collector:8080/ingest"));
    }

    #[test]
    fn test_rejects_bad_numbers() {
        assert!(GatewayConfig::from_vars(vars(&[("IOTKIT_MQTT_PORT", "abc")])).is_err());
        assert!(GatewayConfig::from_vars(vars(&[("IOTKIT_INTERVAL_SECS", "0")])).is_err());
    }

    #[test]
    fn test_synthetic_reading_is_deterministic() {
        let mut a = SyntheticReading::new("d".into());
        let mut b = SyntheticReading::new("d".into());
        for _ in 0..3 {
            let (x, y) = (a.sample().unwrap(), b.sample().unwrap());
            assert_eq!(x["value"], y["value"]);
            assert_eq!(x["name"], "temperature");
        }
        assert_eq!(a.step, 3);
    }
}
