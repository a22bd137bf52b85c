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

use iotkit_core::ValidationError;
use thiserror::Error;

pub type Result<T, E = HttpError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The request could not be sent or its response body could not be read.
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
