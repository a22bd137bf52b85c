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

//! Shared building blocks for iotkit transport sessions.
//!
//! Every long-lived connection in iotkit (MQTT publisher/subscriber,
//! WebSocket publisher/subscriber) is a [`ConnectionSupervisor`] wrapped
//! around a protocol-specific [`Transport`]. The supervisor owns the
//! background task, the reconnect policy and the caller → task handoff for
//! outbound writes.
//!
//! # Example
//!
//! ```ignore
//! use iotkit_core::{ConnectionSupervisor, ReconnectPolicy};
//!
//! let supervisor = ConnectionSupervisor::new("ws-pub ws://gateway:8765", transport, ReconnectPolicy::default());
//! supervisor.start()?;
//! supervisor.wait_connected(Duration::from_secs(5)).await?;
//! let written = supervisor.send(frame).await;
//! supervisor.stop().await;
//! ```

pub mod callback;
pub mod error;
pub mod message;
pub mod supervisor;

pub use callback::{guard, HandlerSlot, MessageHandler};
pub use error::{CallbackError, Error, Result, TransportError, ValidationError};
pub use message::{
    decode_payload, encode_message, generate_device_id, generate_timestamp, into_message,
    validate_data, Message,
};
pub use supervisor::{
    ConnectionSupervisor, ReconnectPolicy, SessionState, Transport, SEND_TIMEOUT, STOP_TIMEOUT,
};
