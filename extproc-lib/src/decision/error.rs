// Copyright 2025 The kmesh Authors
//
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//

use std::{fmt, time::Duration};

use http::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Decode,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transport => "transport",
            ErrorKind::Decode => "decode",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("routing decision server has not been configured")]
    NotConfigured,
    #[error("invalid routing decision server {endpoint:?}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error("cannot build routing decision request")]
    Request(#[from] http::Error),
    #[error("routing decision request failed")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("cannot read routing decision response body")]
    Body(#[source] hyper::Error),
    #[error("routing decision server answered {0}")]
    UnexpectedStatus(StatusCode),
    #[error("error decoding response from routing decision server")]
    Decode(#[from] serde_json::Error),
    #[error("routing decision request timed out after {0:?}")]
    Timeout(Duration),
}

impl DecisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecisionError::NotConfigured | DecisionError::InvalidEndpoint { .. } | DecisionError::Request(_) => {
                ErrorKind::Configuration
            },
            DecisionError::Transport(_) | DecisionError::Body(_) | DecisionError::Timeout(_) => ErrorKind::Transport,
            DecisionError::UnexpectedStatus(_) | DecisionError::Decode(_) => ErrorKind::Decode,
        }
    }
}
