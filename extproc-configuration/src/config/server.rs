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

use std::{
    fmt::Display,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::options::Options;

pub const DEFAULT_GRPC_PORT: u16 = 8081;
pub const DEFAULT_MOCK_BACKEND_PORT: u16 = 8080;
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 1000;
pub const DEFAULT_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
pub const DEFAULT_HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GRPC_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Unix,
}

impl Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Unix => f.write_str("unix"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrpcListener {
    #[serde(default)]
    pub network: Network,
    #[serde(default = "default_grpc_address")]
    pub address: String,
}

impl Default for GrpcListener {
    fn default() -> Self {
        Self { network: Network::Tcp, address: default_grpc_address() }
    }
}

impl GrpcListener {
    pub fn tcp(address: SocketAddr) -> Self {
        Self { network: Network::Tcp, address: address.to_string() }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self { network: Network::Unix, address: path.into() }
    }

    /// Listen on every interface on the given port.
    pub fn with_port(port: u16) -> Self {
        Self::tcp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }
}

fn default_grpc_address() -> String {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_GRPC_PORT)).to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MockBackendConfig {
    #[serde(default = "default_mock_backend_address")]
    pub address: SocketAddr,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self { address: default_mock_backend_address() }
    }
}

fn default_mock_backend_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_MOCK_BACKEND_PORT))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default)]
    pub grpc: GrpcListener,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mock_backend: Option<MockBackendConfig>,
    /// Settle time observed after every listener is down.
    #[serde(with = "humantime_serde", default = "default_shutdown_wait")]
    pub shutdown_wait: Duration,
    #[serde(with = "humantime_serde", default = "default_http_shutdown_timeout")]
    pub http_shutdown_timeout: Duration,
    /// Grace period for in-flight streams once the gRPC server stops accepting new ones.
    #[serde(with = "humantime_serde", default = "default_grpc_drain_timeout")]
    pub grpc_drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc: GrpcListener::default(),
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            mock_backend: None,
            shutdown_wait: DEFAULT_SHUTDOWN_WAIT,
            http_shutdown_timeout: DEFAULT_HTTP_SHUTDOWN_TIMEOUT,
            grpc_drain_timeout: DEFAULT_GRPC_DRAIN_TIMEOUT,
        }
    }
}

fn default_max_concurrent_streams() -> u32 {
    DEFAULT_MAX_CONCURRENT_STREAMS
}
fn default_shutdown_wait() -> Duration {
    DEFAULT_SHUTDOWN_WAIT
}
fn default_http_shutdown_timeout() -> Duration {
    DEFAULT_HTTP_SHUTDOWN_TIMEOUT
}
fn default_grpc_drain_timeout() -> Duration {
    DEFAULT_GRPC_DRAIN_TIMEOUT
}

impl ServerConfig {
    #[must_use]
    pub fn update_from_options(self, opt: &Options) -> Self {
        let mut grpc = match (opt.grpc_address.as_ref(), opt.port) {
            (Some(address), _) => GrpcListener { network: self.grpc.network, address: address.clone() },
            (None, Some(port)) => GrpcListener::with_port(port),
            (None, None) => self.grpc,
        };
        if let Some(network) = opt.grpc_network {
            grpc.network = network;
        }

        let mock_backend = match (opt.mock_backend, opt.mock_backend_address) {
            (true, Some(address)) => Some(MockBackendConfig { address }),
            (true, None) => Some(self.mock_backend.unwrap_or_default()),
            (false, _) => self.mock_backend,
        };

        ServerConfig { grpc, mock_backend, ..self }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let address_ok = match self.grpc.network {
            Network::Tcp => self.grpc.address.parse::<SocketAddr>().is_ok(),
            Network::Unix => !self.grpc.address.trim().is_empty(),
        };
        if !address_ok {
            return Err(ConfigError::InvalidGrpcAddress {
                network: self.grpc.network,
                address: self.grpc.address.clone(),
            });
        }
        if self.max_concurrent_streams == 0 {
            return Err(ConfigError::NoConcurrentStreams);
        }
        Ok(())
    }
}
