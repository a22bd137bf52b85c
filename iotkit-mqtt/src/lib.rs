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

//! MQTT sessions for iotkit.
//!
//! [`MqttPublisher`] publishes validated JSON messages; [`MqttSubscriber`]
//! subscribes to a topic filter and hands decoded JSON to a callback. Both
//! keep their broker connection alive on a background task and reconnect
//! according to the configured [`ReconnectPolicy`](iotkit_core::ReconnectPolicy).
//!
//! # Example
//!
//! ```ignore
//! use iotkit_mqtt::{MqttConfig, MqttPublisher, QoS};
//!
//! let config = MqttConfig::builder("broker.local", "sensors/room1")
//!     .port(1883)
//!     .build()?;
//!
//! let publisher = MqttPublisher::new(config)?;
//! publisher.connect(Duration::from_secs(10)).await?;
//! publisher.publish(&reading, None, QoS::AtLeastOnce).await?;
//! ```

pub mod config;
pub mod publisher;
pub mod subscriber;
pub mod transport;

pub use config::{qos_from_level, validate_topic, MqttConfig, MqttConfigBuilder};
pub use publisher::MqttPublisher;
pub use rumqttc::QoS;
pub use subscriber::MqttSubscriber;
