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

//! Error taxonomy shared by every iotkit session.
//!
//! Foreground calls (construction, `connect`, `send`, `publish`, `broadcast`)
//! return [`Error`]. Failures inside a session's background task are
//! [`TransportError`]s; they drive reconnects and are only ever logged.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the iotkit crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to callers of session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction parameters (bad URI, empty host, wildcard publish topic, ...).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// `connect(timeout)` did not observe a live connection before the deadline.
    #[error("not connected to {endpoint} within {timeout:?}")]
    ConnectionTimeout { endpoint: String, timeout: Duration },

    /// An outbound message failed the message contract.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The operation needs a live connection and there is none.
    #[error("{0} is not connected")]
    NotConnected(String),

    /// The session was stopped (or gave up reconnecting) and cannot be started again.
    #[error("{0} has been stopped and cannot be restarted")]
    Terminated(String),

    /// `start()` was called outside of a tokio runtime.
    #[error("no tokio runtime available to run {0}")]
    NoRuntime(String),

    /// A listening endpoint could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Violations of the outbound message contract.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("message must be a JSON object")]
    NotAnObject,

    #[error("message must contain at least one of: name, value, sensor, measurement")]
    MissingIdentity,

    #[error("timestamp must be a string")]
    TimestampNotString,

    #[error("invalid timestamp '{0}', expected ISO 8601")]
    InvalidTimestamp(String),

    #[error("value must be numeric or a string")]
    InvalidValue,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Connect and I/O failures inside a session task.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by remote endpoint")]
    Closed,

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Wrap a protocol library error (MQTT client, WebSocket codec, ...).
    pub fn protocol<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Protocol(Box::new(err))
    }
}

/// A user callback panicked. Logged at the call site, never propagated.
#[derive(Debug, Error)]
#[error("{callback} callback panicked: {message}")]
pub struct CallbackError {
    pub callback: &'static str,
    pub message: String,
}
