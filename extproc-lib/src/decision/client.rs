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

use std::time::Duration;

use bytes::Bytes;
use extproc_configuration::config::DecisionConfig;
use http::{Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::Deserialize;
use tracing::debug;

use super::DecisionError;

#[derive(Debug, Deserialize)]
struct RoutingDecision {
    decision: String,
}

/// Statuses whose body is worth decoding. Everything from 200 up to, but excluding, 499.
pub fn is_decodable_status(status: StatusCode) -> bool {
    (200..499).contains(&status.as_u16())
}

/// Fetches a routing decision from the configured endpoint with a single GET, never retried.
#[derive(Debug, Clone)]
pub struct RoutingDecisionClient {
    endpoint: Option<String>,
    timeout: Option<Duration>,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl RoutingDecisionClient {
    pub fn new(endpoint: Option<String>, timeout: Option<Duration>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { endpoint, timeout, client }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub async fn fetch(&self) -> Result<String, DecisionError> {
        let endpoint = self.endpoint.as_deref().filter(|e| !e.is_empty()).ok_or(DecisionError::NotConfigured)?;
        let uri = endpoint
            .parse::<Uri>()
            .map_err(|source| DecisionError::InvalidEndpoint { endpoint: endpoint.to_owned(), source })?;

        debug!(target: "routing_decision", endpoint, "calling the routing decision server");
        match self.timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, self.get(uri)).await.map_err(|_| DecisionError::Timeout(timeout))?
            },
            None => self.get(uri).await,
        }
    }

    async fn get(&self, uri: Uri) -> Result<String, DecisionError> {
        let request = Request::get(uri).body(Empty::new())?;
        let response = self.client.request(request).await?;

        let status = response.status();
        if !is_decodable_status(status) {
            return Err(DecisionError::UnexpectedStatus(status));
        }

        let body = response.into_body().collect().await.map_err(DecisionError::Body)?.to_bytes();
        let decision: RoutingDecision = serde_json::from_slice(&body)?;
        Ok(decision.decision)
    }
}

impl From<&DecisionConfig> for RoutingDecisionClient {
    fn from(config: &DecisionConfig) -> Self {
        Self::new(config.routing_decision_server.clone(), config.timeout)
    }
}
