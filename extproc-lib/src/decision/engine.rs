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

use std::time::Instant;

use extproc_configuration::config::DecisionConfig;
use tracing::{debug, info};

use super::{DecisionError, RoutingDecisionClient};
use crate::headers::{AppendPolicy, HeaderMutation, HeaderSet, ProcessingOutcome};

/// Turns the request headers into a routing decision and the header mutation carrying it.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    preferred_header: String,
    decision_header: String,
    client: RoutingDecisionClient,
}

impl DecisionEngine {
    pub fn new(
        preferred_header: impl Into<String>,
        decision_header: impl Into<String>,
        client: RoutingDecisionClient,
    ) -> Self {
        Self { preferred_header: preferred_header.into(), decision_header: decision_header.into(), client }
    }

    pub fn preferred_header(&self) -> &str {
        &self.preferred_header
    }

    pub fn decision_header(&self) -> &str {
        &self.decision_header
    }

    /// A non-empty preferred service header short-circuits the decision. Otherwise the decision server
    /// is asked exactly once; an empty answer leaves the request untouched.
    pub async fn decide(&self, headers: &HeaderSet) -> Result<ProcessingOutcome, DecisionError> {
        let preferred = headers.get(&self.preferred_header);

        let decision = match preferred.filter(|value| !value.is_empty()) {
            Some(value) => {
                debug!(target: "routing_decision", header = %self.preferred_header, value, "using preferred service");
                value.to_owned()
            },
            None => {
                let start = Instant::now();
                let fetched = self.client.fetch().await;
                debug!(target: "routing_decision", duration = ?start.elapsed(), "fetching took");
                let decision = fetched?;
                if decision.is_empty() {
                    info!(target: "routing_decision", "no decision is present");
                    return Ok(ProcessingOutcome::unmodified());
                }
                decision
            },
        };

        let mut mutation =
            HeaderMutation::default().with_set(&self.decision_header, decision, AppendPolicy::AppendIfExistsOrAdd);
        if preferred.is_some() {
            mutation = mutation.with_remove(&self.preferred_header);
        }
        Ok(ProcessingOutcome { clear_route_cache: true, mutation })
    }
}

impl From<&DecisionConfig> for DecisionEngine {
    fn from(config: &DecisionConfig) -> Self {
        Self::new(&config.preferred_service_header, &config.routing_decision_header, RoutingDecisionClient::from(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ErrorKind;

    fn engine_without_server() -> DecisionEngine {
        DecisionEngine::new("preferred-svc", "x-routing-decision", RoutingDecisionClient::new(None, None))
    }

    #[tokio::test]
    async fn preferred_header_short_circuits() {
        let engine = engine_without_server();
        let headers: HeaderSet = [(":path", "/"), ("Preferred-SVC", "svc-a")].into_iter().collect();

        let outcome = engine.decide(&headers).await.unwrap();
        assert!(outcome.clear_route_cache);
        assert_eq!(
            outcome.mutation,
            HeaderMutation::default()
                .with_set("x-routing-decision", "svc-a", AppendPolicy::AppendIfExistsOrAdd)
                .with_remove("preferred-svc")
        );
    }

    #[tokio::test]
    async fn empty_preferred_header_asks_the_server() {
        let engine = engine_without_server();
        let headers: HeaderSet = [("preferred-svc", "")].into_iter().collect();
        assert!(matches!(engine.decide(&headers).await, Err(DecisionError::NotConfigured)));
    }

    #[tokio::test]
    async fn missing_server_is_reported() {
        let engine = engine_without_server();
        let err = engine.decide(&HeaderSet::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
