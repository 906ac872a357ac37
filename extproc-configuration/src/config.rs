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

pub mod decision;
pub mod log;
pub mod server;

use std::{fs::File, path::Path};

use extproc_error::Context;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use decision::DecisionConfig;
pub use log::{LogConfig, LogFormat};
pub use server::{GrpcListener, MockBackendConfig, Network, ServerConfig};

use crate::{options::Options, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid header name {name:?} for {field}")]
    InvalidHeaderName { field: &'static str, name: String },
    #[error("preferred service header and routing decision header must differ (both are {0:?})")]
    ConflictingHeaders(String),
    #[error("invalid routing decision server {url:?}: {reason}")]
    InvalidDecisionServer { url: String, reason: String },
    #[error("invalid gRPC listener address {address:?} for network {network}")]
    InvalidGrpcAddress { network: Network, address: String },
    #[error("max_concurrent_streams must be greater than zero")]
    NoConcurrentStreams,
}

pub fn deserialize_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_yaml::from_reader(file).with_context(|| format!("failed to parse {}", path.display()))
}

impl Config {
    /// Resolves the configuration once: file (if any), then explicit flags and environment.
    pub fn new(opt: &Options) -> Result<Self> {
        let config = match &opt.config {
            Some(path) => deserialize_yaml::<Config>(path)?,
            None => Config::default(),
        };
        let config = config.update_from_options(opt);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    #[must_use]
    pub fn update_from_options(self, opt: &Options) -> Self {
        let Config { server, decision, logging } = self;
        Config {
            server: server.update_from_options(opt),
            decision: decision.update_from_options(opt),
            logging: logging.update_from_options(opt),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.server.validate()?;
        self.decision.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::SocketAddr, time::Duration};

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.grpc.network, Network::Tcp);
        assert_eq!(config.server.grpc.address, "0.0.0.0:8081");
        assert_eq!(config.server.max_concurrent_streams, 1000);
        assert_eq!(config.server.shutdown_wait, Duration::from_secs(5));
        assert!(config.server.mock_backend.is_none());
        assert_eq!(config.decision.preferred_service_header, "preferred-svc");
        assert_eq!(config.decision.routing_decision_header, "x-routing-decision");
        assert!(config.decision.routing_decision_server.is_none());
        assert!(config.decision.timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn options_override_defaults() {
        let opt = Options {
            port: Some(9443),
            preferred_svc_header: Some("x-preferred".to_owned()),
            routing_decision_server: Some("http://127.0.0.1:7000/decide".to_owned()),
            mock_backend: true,
            log_level: Some("debug".to_owned()),
            ..Default::default()
        };
        let config = Config::default().update_from_options(&opt);
        assert_eq!(config.server.grpc.address, "0.0.0.0:9443");
        assert_eq!(config.decision.preferred_service_header, "x-preferred");
        assert_eq!(config.decision.routing_decision_server.as_deref(), Some("http://127.0.0.1:7000/decide"));
        assert_eq!(
            config.server.mock_backend.map(|m| m.address),
            Some("0.0.0.0:8080".parse::<SocketAddr>().unwrap())
        );
        assert_eq!(config.logging.level(), tracing::Level::DEBUG);
    }

    #[test]
    fn explicit_address_wins_over_port() {
        let opt = Options {
            port: Some(1234),
            grpc_network: Some(Network::Unix),
            grpc_address: Some("/tmp/ext-proc.sock".to_owned()),
            ..Default::default()
        };
        let config = Config::default().update_from_options(&opt);
        assert_eq!(config.server.grpc, GrpcListener::unix("/tmp/ext-proc.sock"));
    }

    #[test]
    fn rejects_conflicting_headers() {
        let mut config = Config::default();
        config.decision.routing_decision_header = config.decision.preferred_service_header.clone();
        assert_eq!(config.validate(), Err(ConfigError::ConflictingHeaders("preferred-svc".to_owned())));
    }

    #[test]
    fn rejects_non_http_decision_server() {
        let mut config = Config::default();
        config.decision.routing_decision_server = Some("ftp://decision.local/".to_owned());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidDecisionServer { .. })));
    }

    #[test]
    fn rejects_bad_tcp_address() {
        let mut config = Config::default();
        config.server.grpc.address = ":8081".to_owned();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidGrpcAddress { .. })));
    }
}
