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

//! Configuration for the HTTP publisher and receiver.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Url;

use crate::error::{HttpError, Result};

#[derive(Debug, Clone)]
pub struct HttpPublisherConfig {
    /// Base URL; per-request endpoints are joined onto it.
    pub url: String,
    /// Headers added on top of the defaults.
    pub headers: BTreeMap<String, String>,
    /// Sent as `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
    /// Whole-request timeout (default: 30s).
    pub timeout: Duration,
}

impl HttpPublisherConfig {
    pub fn builder(url: impl Into<String>) -> HttpPublisherConfigBuilder {
        HttpPublisherConfigBuilder {
            url: url.into(),
            headers: BTreeMap::new(),
            auth_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpPublisherConfigBuilder {
    url: String,
    headers: BTreeMap<String, String>,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpPublisherConfigBuilder {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<HttpPublisherConfig> {
        let url = Url::parse(&self.url)
            .map_err(|e| HttpError::Configuration(format!("invalid URL '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HttpError::Configuration(format!(
                "URL '{}' must use http:// or https://",
                self.url
            )));
        }
        if self.timeout.is_zero() {
            return Err(HttpError::Configuration("timeout must be non-zero".into()));
        }

        Ok(HttpPublisherConfig {
            url: self.url,
            headers: self.headers,
            auth_token: self.auth_token,
            timeout: self.timeout,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpReceiverConfig {
    /// Interface to bind (default: `0.0.0.0`).
    pub host: String,
    /// Port to bind (default: 8080, 0 for an ephemeral port).
    pub port: u16,
}

impl Default for HttpReceiverConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl HttpReceiverConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_defaults() {
        let config = HttpPublisherConfig::builder("http://localhost:8080/api").build().unwrap();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.headers.is_empty());
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_rejects_bad_urls() {
        for url in ["", "localhost:8080", "ftp://files.example", "not a url"] {
            assert!(
                matches!(HttpPublisherConfig::builder(url).build(), Err(HttpError::Configuration(_))),
                "{url}"
            );
        }
    }

    #[test]
    fn test_receiver_defaults() {
        assert_eq!(HttpReceiverConfig::default().bind_addr(), "0.0.0.0:8080");
    }
}
