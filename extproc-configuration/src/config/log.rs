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

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::options::Options;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_format: LogFormat::default() }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl LogConfig {
    #[must_use]
    pub fn update_from_options(self, opt: &Options) -> Self {
        LogConfig {
            log_level: opt.log_level.clone().unwrap_or(self.log_level),
            log_format: opt.log_format.unwrap_or(self.log_format),
        }
    }

    /// Only "debug" lowers the threshold; every other value, valid or not, means info.
    pub fn level(&self) -> Level {
        if self.log_level.trim().eq_ignore_ascii_case("debug") {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    /// `RUST_LOG` directives take precedence over the configured level.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder().with_default_directive(LevelFilter::from_level(self.level()).into()).from_env_lossy()
    }
}
