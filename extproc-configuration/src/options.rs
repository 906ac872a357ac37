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

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

use crate::config::{log::LogFormat, server::Network};

/// Command line options. Every flag can also be supplied through the environment variable named
/// next to it; anything left unset falls back to the configuration file and then to the defaults.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ext-proc-routing", about = "Envoy external processing server taking routing decisions", version)]
pub struct Options {
    /// Optional YAML configuration file
    #[arg(short, long, env = "EXT_PROC_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port used by the gRPC server, bound on every interface
    #[arg(long, env = "GRPC_PORT")]
    pub port: Option<u16>,

    /// Network of the gRPC listener
    #[arg(long, env = "GRPC_NETWORK", value_enum)]
    pub grpc_network: Option<Network>,

    /// Address of the gRPC listener: a socket address for tcp, a socket path for unix.
    /// Takes precedence over --port.
    #[arg(long, env = "GRPC_ADDRESS")]
    pub grpc_address: Option<String>,

    /// Request header carrying the service preferred by the client
    #[arg(long, env = "PREFERRED_SVC_HEADER")]
    pub preferred_svc_header: Option<String>,

    /// Request header set to the routing decision
    #[arg(long, env = "ROUTING_DECISION_HEADER")]
    pub routing_decision_header: Option<String>,

    /// URL of the routing decision server
    #[arg(long, env = "ROUTING_DECISION_SERVER")]
    pub routing_decision_server: Option<String>,

    /// Upper bound for a single routing decision call, e.g. "250ms"
    #[arg(long, env = "ROUTING_DECISION_TIMEOUT", value_parser = humantime::parse_duration)]
    pub decision_timeout: Option<Duration>,

    /// Serve the mock HTTP backend used by the integration fixtures
    #[arg(long, env = "MOCK_BACKEND")]
    pub mock_backend: bool,

    /// Bind address of the mock HTTP backend
    #[arg(long, env = "MOCK_BACKEND_ADDRESS")]
    pub mock_backend_address: Option<SocketAddr>,

    /// Log level; "debug" enables debug output, anything else selects info
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

impl Options {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { config: Some(path.into()), ..Default::default() }
    }
}
