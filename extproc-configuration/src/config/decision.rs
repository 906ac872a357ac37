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

use http::HeaderName;
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::options::Options;

pub const DEFAULT_PREFERRED_SVC_HEADER: &str = "preferred-svc";
pub const DEFAULT_ROUTING_DECISION_HEADER: &str = "x-routing-decision";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionConfig {
    #[serde(default = "default_preferred_service_header")]
    pub preferred_service_header: String,
    #[serde(default = "default_routing_decision_header")]
    pub routing_decision_header: String,
    /// Left unset, every request without a preferred service fails open.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub routing_decision_server: Option<String>,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none", default)]
    pub timeout: Option<Duration>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            preferred_service_header: default_preferred_service_header(),
            routing_decision_header: default_routing_decision_header(),
            routing_decision_server: None,
            timeout: None,
        }
    }
}

fn default_preferred_service_header() -> String {
    DEFAULT_PREFERRED_SVC_HEADER.to_owned()
}

fn default_routing_decision_header() -> String {
    DEFAULT_ROUTING_DECISION_HEADER.to_owned()
}

fn validate_header_name(field: &'static str, name: &str) -> Result<(), ConfigError> {
    // envoy hands header keys over lowercased, so a mixed-case name could never match
    let valid = HeaderName::from_bytes(name.as_bytes()).is_ok() && name == name.to_ascii_lowercase();
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidHeaderName { field, name: name.to_owned() })
    }
}

impl DecisionConfig {
    #[must_use]
    pub fn update_from_options(self, opt: &Options) -> Self {
        DecisionConfig {
            preferred_service_header: opt.preferred_svc_header.clone().unwrap_or(self.preferred_service_header),
            routing_decision_header: opt.routing_decision_header.clone().unwrap_or(self.routing_decision_header),
            routing_decision_server: opt.routing_decision_server.clone().or(self.routing_decision_server),
            timeout: opt.decision_timeout.or(self.timeout),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_header_name("preferred_service_header", &self.preferred_service_header)?;
        validate_header_name("routing_decision_header", &self.routing_decision_header)?;
        if self.preferred_service_header == self.routing_decision_header {
            return Err(ConfigError::ConflictingHeaders(self.preferred_service_header.clone()));
        }
        if let Some(server) = &self.routing_decision_server {
            let invalid = |reason: String| ConfigError::InvalidDecisionServer { url: server.clone(), reason };
            let url = url::Url::parse(server).map_err(|e| invalid(e.to_string()))?;
            if url.scheme() != "http" {
                return Err(invalid(format!("unsupported scheme {}", url.scheme())));
            }
            if url.host_str().is_none() {
                return Err(invalid("missing host".to_owned()));
            }
        }
        Ok(())
    }
}
