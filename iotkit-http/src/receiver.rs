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

//! Webhook receiver: an axum server dispatching requests to registered
//! endpoint callbacks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use iotkit_core::{guard, STOP_TIMEOUT};
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HttpReceiverConfig;
use crate::error::{HttpError, Result};

/// Handles requests to one path.
///
/// `data` is the JSON body, the text body when it is not JSON, or `Null`
/// when empty. A string reply is sent as plain text, anything else as JSON.
/// `Err` becomes a 500 response with `{"error": ...}`.
pub trait EndpointHandler: Send + Sync + 'static {
    fn handle(&self, data: &Value, method: &Method, path: &str) -> std::result::Result<Value, String>;
}

impl<F> EndpointHandler for F
where
    F: Fn(&Value, &Method, &str) -> std::result::Result<Value, String> + Send + Sync + 'static,
{
    fn handle(&self, data: &Value, method: &Method, path: &str) -> std::result::Result<Value, String> {
        self(data, method, path)
    }
}

#[derive(Clone)]
struct Endpoint {
    methods: Vec<Method>,
    handler: Arc<dyn EndpointHandler>,
}

struct ReceiverState {
    name: String,
    endpoints: RwLock<HashMap<String, Endpoint>>,
}

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct HttpReceiver {
    config: HttpReceiverConfig,
    state: Arc<ReceiverState>,
    running: Mutex<Option<Running>>,
}

impl HttpReceiver {
    pub fn new(config: HttpReceiverConfig) -> Self {
        Self {
            state: Arc::new(ReceiverState {
                name: format!("http-recv {}", config.bind_addr()),
                endpoints: RwLock::new(HashMap::new()),
            }),
            config,
            running: Mutex::new(None),
        }
    }

    /// Register `handler` for `path`. An empty `methods` list means POST only.
    /// Registering the same path again replaces the previous endpoint.
    pub fn add_endpoint(&self, path: impl Into<String>, methods: &[Method], handler: impl EndpointHandler) {
        let methods = if methods.is_empty() {
            vec![Method::POST]
        } else {
            methods.to_vec()
        };
        self.state.endpoints.write().insert(
            path.into(),
            Endpoint {
                methods,
                handler: Arc::new(handler),
            },
        );
    }

    /// Bind and start serving. Returns the bound address; a no-op while running.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| HttpError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| HttpError::Bind {
            addr: bind_addr,
            source,
        })?;

        let mut running = self.running.lock();
        if let Some(existing) = running.as_ref() {
            return Ok(existing.addr);
        }

        let router = Router::new()
            .fallback(dispatch)
            .with_state(Arc::clone(&self.state));
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone().cancelled_owned();
        let name = self.state.name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("[{name}] Server error: {e}");
            }
        });

        info!("[{}] Listening on {addr}", self.state.name);
        *running = Some(Running { addr, cancel, task });
        Ok(addr)
    }

    /// Stop accepting requests and wait (bounded) for in-flight ones.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.cancel.cancel();
        let mut task = running.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            error!("[{}] Did not stop within {STOP_TIMEOUT:?}, aborting", self.state.name);
            task.abort();
        } else {
            info!("[{}] Stopped", self.state.name);
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.addr)
    }
}

impl Drop for HttpReceiver {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().as_ref() {
            running.cancel.cancel();
        }
    }
}

async fn dispatch(
    State(state): State<Arc<ReceiverState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let path = uri.path();
    let endpoint = state.endpoints.read().get(path).cloned();
    let Some(endpoint) = endpoint else {
        debug!("[{}] No endpoint for {path}", state.name);
        return StatusCode::NOT_FOUND.into_response();
    };
    if !endpoint.methods.contains(&method) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let data = decode_request(&body);
    let mut reply = None;
    let outcome = guard(&state.name, "endpoint", || {
        reply = Some(endpoint.handler.handle(&data, &method, path));
    });
    let reply = match (outcome, reply) {
        (Ok(()), Some(reply)) => reply,
        (Err(e), _) => Err(e.to_string()),
        (Ok(()), None) => Err("endpoint produced no reply".to_string()),
    };

    match reply {
        Ok(Value::String(text)) => (StatusCode::OK, text).into_response(),
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(message) => {
            error!("[{}] Endpoint {path} failed: {message}", state.name);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message }))).into_response()
        }
    }
}

fn decode_request(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request() {
        assert_eq!(decode_request(b""), Value::Null);
        assert_eq!(decode_request(br#"{"v":1}"#), json!({"v": 1}));
        assert_eq!(decode_request(b"plain"), Value::String("plain".into()));
    }

    #[test]
    fn test_default_method_is_post() {
        let receiver = HttpReceiver::new(HttpReceiverConfig::new("127.0.0.1", 0));
        receiver.add_endpoint("/data", &[], |_: &Value, _: &Method, _: &str| -> std::result::Result<Value, String> {
            Ok(Value::Null)
        });

        let endpoints = receiver.state.endpoints.read();
        assert_eq!(endpoints["/data"].methods, vec![Method::POST]);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let receiver = HttpReceiver::new(HttpReceiverConfig::new("127.0.0.1", 0));
        receiver.stop().await;
        assert!(receiver.local_addr().is_none());
    }
}
