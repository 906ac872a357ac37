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

use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// CTRL+C (SIGINT)
    Interrupt,
    #[cfg(unix)]
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT (CTRL+C)"),
            #[cfg(unix)]
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Listens for SIGINT and SIGTERM (CTRL+C only outside unix) on the current runtime and broadcasts the
/// first one received.
pub fn spawn_signal_handler() -> (broadcast::Sender<ShutdownSignal>, JoinHandle<()>) {
    let (shutdown_tx, _) = broadcast::channel::<ShutdownSignal>(16);
    let signal_shutdown_tx = shutdown_tx.clone();

    let handle = tokio::spawn(async move {
        if let Err(e) = listen_for_signals(&signal_shutdown_tx).await {
            warn!("Signal handler error: {}", e);
        }
    });

    (shutdown_tx, handle)
}

async fn listen_for_signals(
    shutdown_tx: &broadcast::Sender<ShutdownSignal>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let signal = wait_for_signal().await?;
    info!("Received {} signal, initiating shutdown...", signal);
    if let Err(e) = shutdown_tx.send(signal) {
        warn!("Failed to send shutdown signal: {}", e);
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::select! {
        _ = sigint.recv() => ShutdownSignal::Interrupt,
        _ = sigterm.recv() => ShutdownSignal::Terminate,
    })
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}

/// A token cancelled by the first broadcast shutdown signal, or when every sender is gone.
pub fn shutdown_token(shutdown_tx: &broadcast::Sender<ShutdownSignal>) -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        match shutdown_rx.recv().await {
            Ok(signal) => info!("Shutting down on {signal}"),
            Err(e) => warn!("Shutdown channel closed: {e}"),
        }
        cancel.cancel();
    });

    token
}
