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

mod logging;
mod signal;

use std::process::ExitCode;

use clap::Parser;
use extproc_configuration::{config::Config, options::Options};
use extproc_error::{Context, Result};
use extproc_lib::Server;
use tracing::{debug, error, info, info_span, Instrument};

const RELEASE: &str = env!("CARGO_PKG_VERSION");

fn main() -> ExitCode {
    let options = Options::parse();
    let config = match Config::new(&options) {
        Ok(config) => config,
        Err(err) => {
            #[allow(clippy::print_stderr)]
            {
                eprintln!("ext-proc-routing: {err}");
            }
            return ExitCode::FAILURE;
        },
    };

    if let Err(err) = logging::init(&config.logging) {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("ext-proc-routing: {err}");
        }
        return ExitCode::FAILURE;
    }

    match run(config) {
        Ok(()) => {
            info!("server exited cleanly");
            ExitCode::SUCCESS
        },
        Err(err) => {
            error!("server failed: {err}");
            ExitCode::FAILURE
        },
    }
}

fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ext-proc")
        .build()
        .context("failed to build the tokio runtime")?;

    let span = info_span!("ext_proc_routing", release = RELEASE);
    runtime.block_on(
        async move {
            debug!(?config, "resolved configuration");
            let (signals, signal_handle) = signal::spawn_signal_handler();
            let shutdown = signal::shutdown_token(&signals);

            let server = Server::new(&config);
            let result = server.serve(shutdown).await;
            signal_handle.abort();
            result
        }
        .instrument(span),
    )
}
