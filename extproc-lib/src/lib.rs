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
pub mod headers;
pub mod health;
pub mod mock_backend;
pub mod processor;
pub mod server;

pub use decision::{DecisionEngine, DecisionError, RoutingDecisionClient};
pub use health::HealthService;
pub use processor::StreamProcessor;
pub use server::{ListenAddr, Phase, Server, ServerStatus};

pub type Error = extproc_error::Error;
pub type Result<T> = ::core::result::Result<T, Error>;
