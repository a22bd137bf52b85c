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

//! HTTP transport for iotkit.
//!
//! [`HttpPublisher`] posts validated messages to a REST endpoint and
//! summarises each response. [`HttpReceiver`] is a small webhook server
//! that dispatches requests by path to registered callbacks.
//!
//! Unlike the MQTT and WebSocket sessions there is no long-lived connection
//! to supervise: every `send` is one request.

pub mod config;
pub mod error;
pub mod publisher;
pub mod receiver;

pub use config::{HttpPublisherConfig, HttpPublisherConfigBuilder, HttpReceiverConfig};
pub use error::{HttpError, Result};
pub use publisher::{HttpPublisher, HttpResponse};
pub use receiver::{EndpointHandler, HttpReceiver};
pub use reqwest::header::HeaderMap;
pub use reqwest::Method;
