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

//! REST publisher.

use iotkit_core::{validate_data, Message};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use crate::config::HttpPublisherConfig;
use crate::error::{HttpError, Result};

/// Summary of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status_code: u16,
    /// `true` for 2xx statuses.
    pub success: bool,
    pub url: String,
    pub method: String,
    pub data_sent: Message,
    /// JSON body, or the text body when it is not JSON. Absent for empty bodies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

/// Sends validated messages to a REST endpoint as JSON bodies.
///
/// Headers start as `Content-Type: application/json` and
/// `User-Agent: IoTKit/1.0`, plus whatever the config adds. They can be
/// changed between requests from any task. Header names are case-insensitive.
pub struct HttpPublisher {
    name: String,
    url: String,
    client: reqwest::Client,
    headers: RwLock<HeaderMap>,
}

impl HttpPublisher {
    pub fn new(config: HttpPublisherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| HttpError::Configuration(format!("failed to build HTTP client: {e}")))?;

        let publisher = Self {
            name: format!("http-pub {}", config.url),
            url: config.url,
            client,
            headers: RwLock::new(HeaderMap::from_iter([
                (CONTENT_TYPE, HeaderValue::from_static("application/json")),
                (USER_AGENT, HeaderValue::from_static("IoTKit/1.0")),
            ])),
        };
        for (name, value) in config.headers {
            publisher.add_header(name, value)?;
        }
        if let Some(token) = config.auth_token {
            publisher.add_header(AUTHORIZATION.as_str(), format!("Bearer {token}"))?;
        }
        Ok(publisher)
    }

    /// Validate `message` and send it with `method` to the base URL, or to
    /// `endpoint` joined onto it.
    ///
    /// Non-2xx statuses are returned with `success: false`; only transport
    /// failures and invalid messages are errors.
    pub async fn send(
        &self,
        message: &Message,
        method: Method,
        endpoint: Option<&str>,
    ) -> Result<HttpResponse> {
        let validated = validate_data(message.clone())?;
        let url = self.target_url(endpoint);
        let headers = self.headers();

        let response = self
            .client
            .request(method.clone(), &url)
            .headers(headers)
            .json(&validated)
            .send()
            .await
            .map_err(|source| {
                error!("[{}] {method} {url} failed: {source}", self.name);
                HttpError::Request {
                    url: url.clone(),
                    source,
                }
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|source| HttpError::Request {
            url: url.clone(),
            source,
        })?;

        let summary = HttpResponse {
            status_code: status.as_u16(),
            success: status.is_success(),
            url,
            method: method.to_string(),
            data_sent: validated,
            response: decode_body(&body),
        };
        if summary.success {
            info!("[{}] Sent data to {}", self.name, summary.url);
            debug!("[{}] Response: {:?}", self.name, summary.response);
        } else {
            warn!("[{}] {} {} returned {status}", self.name, summary.method, summary.url);
        }
        Ok(summary)
    }

    /// Send each message in turn. One result per message; a failure does not
    /// stop the rest.
    pub async fn send_batch(
        &self,
        messages: &[Message],
        method: Method,
        endpoint: Option<&str>,
    ) -> Vec<Result<HttpResponse>> {
        let mut results = Vec::with_capacity(messages.len());
        for (i, message) in messages.iter().enumerate() {
            let result = self.send(message, method.clone(), endpoint).await;
            if let Err(e) = &result {
                error!("[{}] Batch item {i} failed: {e}", self.name);
            }
            results.push(result);
        }
        results
    }

    pub fn update_auth_token(&self, token: &str) -> Result<()> {
        self.add_header(AUTHORIZATION.as_str(), format!("Bearer {token}"))?;
        info!("[{}] Authentication token updated", self.name);
        Ok(())
    }

    /// Add or replace a header, whatever the case of `name`. Rejects names or
    /// values that are not valid HTTP.
    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (name, value) = parse_header(&name.into(), &value.into())?;
        self.headers.write().insert(name, value);
        Ok(())
    }

    /// Remove a header, returning its value.
    pub fn remove_header(&self, name: &str) -> Option<String> {
        let value = self.headers.write().remove(name)?;
        value.to_str().ok().map(str::to_string)
    }

    /// Snapshot of the current headers.
    pub fn headers(&self) -> HeaderMap {
        self.headers.read().clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn target_url(&self, endpoint: Option<&str>) -> String {
        match endpoint {
            Some(endpoint) if !endpoint.is_empty() => format!(
                "{}/{}",
                self.url.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            ),
            _ => self.url.clone(),
        }
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| HttpError::Configuration(format!("invalid header name '{name}': {e}")))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|e| HttpError::Configuration(format!("invalid value for header '{name}': {e}")))?;
    Ok((header_name, header_value))
}

fn decode_body(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    Some(
        serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher() -> HttpPublisher {
        let config = HttpPublisherConfig::builder("http://localhost:8080/api/")
            .header("X-Device", "gw-1")
            .auth_token("t0")
            .build()
            .unwrap();
        HttpPublisher::new(config).unwrap()
    }

    #[test]
    fn test_default_and_configured_headers() {
        let headers = publisher().headers();
        assert_eq!(headers["Content-Type"], "application/json");
        assert_eq!(headers["User-Agent"], "IoTKit/1.0");
        assert_eq!(headers["X-Device"], "gw-1");
        assert_eq!(headers["Authorization"], "Bearer t0");
    }

    #[test]
    fn test_header_management() {
        let publisher = publisher();
        publisher.update_auth_token("t1").unwrap();
        assert_eq!(publisher.headers()["Authorization"], "Bearer t1");

        publisher.add_header("X-Site", "north").unwrap();
        assert_eq!(publisher.remove_header("X-Site").as_deref(), Some("north"));
        assert_eq!(publisher.remove_header("X-Site"), None);

        assert!(publisher.add_header("bad name", "v").is_err());
        assert!(publisher.add_header("X-Ok", "line\nbreak").is_err());
        assert!(!publisher.headers().contains_key("X-Ok"));
    }

    #[test]
    fn test_header_names_ignore_case() {
        let publisher = publisher();
        publisher.update_auth_token("t1").unwrap();
        publisher.add_header("authorization", "Basic abc").unwrap();

        let headers = publisher.headers();
        assert_eq!(headers.get_all("Authorization").iter().count(), 1);
        assert_eq!(headers["Authorization"], "Basic abc");

        publisher.add_header("content-type", "application/cbor").unwrap();
        assert_eq!(publisher.headers()["Content-Type"], "application/cbor");
        assert_eq!(publisher.remove_header("X-DEVICE").as_deref(), Some("gw-1"));
        assert_eq!(publisher.headers().len(), 3);
    }

    #[test]
    fn test_target_url_joins_endpoint() {
        let publisher = publisher();
        assert_eq!(publisher.target_url(None), "http://localhost:8080/api/");
        assert_eq!(publisher.target_url(Some("/readings")), "http://localhost:8080/api/readings");
        assert_eq!(publisher.target_url(Some("readings")), "http://localhost:8080/api/readings");
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(b""), None);
        assert_eq!(decode_body(br#"{"ok":true}"#), Some(serde_json::json!({"ok": true})));
        assert_eq!(decode_body(b"accepted"), Some(Value::String("accepted".into())));
    }

    #[tokio::test]
    async fn test_send_rejects_invalid_message() {
        let message = iotkit_core::into_message(serde_json::json!({"unit": "C"})).unwrap();
        let result = publisher().send(&message, Method::POST, None).await;
        assert!(matches!(result, Err(HttpError::Validation(_))));
    }
}
