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

//! WebSocket sessions for iotkit.
//!
//! - [`WebSocketPublisher`] / [`WebSocketSubscriber`]: supervised client
//!   sessions with automatic reconnects.
//! - [`WebSocketServer`]: accepts peers, dispatches their messages to a
//!   [`ServerHandler`] and broadcasts to all of them.
//! - [`WebSocketBridge`]: one server plus named client sessions, forwarding
//!   between them.
//!
//! # Example
//!
//! ```ignore
//! use iotkit_websocket::{WebSocketBridge, WebSocketClientConfig, WebSocketServerConfig};
//!
//! let bridge = WebSocketBridge::new(WebSocketServerConfig::new("0.0.0.0", 8765)?);
//! bridge
//!     .add_publisher("cloud", WebSocketClientConfig::builder("wss://cloud.example/ingest").build()?)
//!     .await?;
//! let addr = bridge.start().await?;
//! ```

pub mod bridge;
pub mod config;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod subscriber;
pub mod transport;

pub use bridge::{wrap_client_message, wrap_subscriber_message, BridgeStatus, WebSocketBridge};
pub use config::{WebSocketClientConfig, WebSocketClientConfigBuilder, WebSocketServerConfig};
pub use publisher::WebSocketPublisher;
pub use registry::{BroadcastReport, ClientRegistry, PeerId, PeerSendError, PeerSink, Pruned};
pub use server::{PeerHandle, ServerCallbacks, ServerHandler, WebSocketServer};
pub use subscriber::WebSocketSubscriber;
