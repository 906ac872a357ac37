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
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessorServer;
use extproc_configuration::config::{Config, Network, ServerConfig};
use extproc_error::Context;
use http::{Request, StatusCode, Uri};
use http_body_util::Empty;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::{
    net::TcpListener,
    select,
    sync::watch,
    task::{JoinError, JoinHandle},
    time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{server::Router, Server as GrpcServer};
use tonic_health::pb::health_server::HealthServer;
use tracing::{debug, error, info, warn};

use crate::{decision::DecisionEngine, health::HealthService, mock_backend, processor::StreamProcessor, Error, Result};

const READINESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long aborted streams get to report `Cancelled` before the gRPC task is torn down.
const ABORTED_STREAMS_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Created,
    Serving,
    Stopping,
    Stopped,
}

/// Observable state of a [`Server`]. Addresses are the bound ones, so port 0 resolves to the real port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub phase: Phase,
    pub grpc: Option<ListenAddr>,
    pub mock_backend: Option<SocketAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("server has already been started")]
    AlreadyStarted,
    #[error("{0} stopped unexpectedly")]
    ListenerExited(&'static str),
    #[error("server not ready after {0:?}")]
    NotReady(Duration),
    #[error("unix sockets are not supported on this platform")]
    UnixUnsupported,
}

type ListenerTask = JoinHandle<Result<()>>;

/// Owns the gRPC listener and the optional mock backend, and drives their graceful shutdown.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    processor: StreamProcessor,
    started: AtomicBool,
    grpc_shutdown: CancellationToken,
    mock_shutdown: CancellationToken,
    stream_abort: CancellationToken,
    status: watch::Sender<ServerStatus>,
    probe: Client<HttpConnector, Empty<Bytes>>,
}

impl Server {
    pub fn new(config: &Config) -> Self {
        Self::with_engine(config.server.clone(), DecisionEngine::from(&config.decision))
    }

    pub fn with_engine(config: ServerConfig, engine: DecisionEngine) -> Self {
        let stream_abort = CancellationToken::new();
        let processor = StreamProcessor::new(Arc::new(engine)).with_abort(stream_abort.clone());
        let (status, _) = watch::channel(ServerStatus::default());
        let probe = Client::builder(TokioExecutor::new()).build_http();
        Self {
            config,
            processor,
            started: AtomicBool::new(false),
            grpc_shutdown: CancellationToken::new(),
            mock_shutdown: CancellationToken::new(),
            stream_abort,
            status,
            probe,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ServerStatus {
        self.status.borrow().clone()
    }

    /// Serves until `shutdown` fires, then stops gracefully. A listener failing first ends the server with
    /// that listener's error.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::AlreadyStarted.into());
        }

        let mut mock_task = match self.spawn_mock_backend().await {
            Ok(task) => task,
            Err(err) => {
                self.status.send_modify(|s| s.phase = Phase::Stopped);
                return Err(err);
            },
        };

        let (grpc_addr, mut grpc_task) = match self.spawn_grpc().await {
            Ok(spawned) => spawned,
            Err(err) => {
                self.mock_shutdown.cancel();
                self.status.send_modify(|s| s.phase = Phase::Stopped);
                return Err(err);
            },
        };
        info!(target: "server", address = %grpc_addr, "starting ext proc grpc server");
        self.status.send_modify(|s| {
            s.grpc = Some(grpc_addr);
            s.phase = Phase::Serving;
        });

        let failure = select! {
            () = shutdown.cancelled() => None,
            joined = &mut grpc_task => Some(exit_error(listener_outcome(joined, "grpc server"), "grpc server")),
            result = join_optional(&mut mock_task) => Some(exit_error(result, "mock http server")),
        };

        match failure {
            None => self.stop(grpc_task, mock_task).await,
            Some(err) => {
                error!(target: "server", "listener failed, shutting down: {err}");
                self.grpc_shutdown.cancel();
                self.mock_shutdown.cancel();
                self.stream_abort.cancel();
                self.remove_unix_socket();
                self.status.send_modify(|s| s.phase = Phase::Stopped);
                Err(err)
            },
        }
    }

    async fn spawn_mock_backend(&self) -> Result<Option<ListenerTask>> {
        let Some(mock) = &self.config.mock_backend else {
            return Ok(None);
        };
        let listener = TcpListener::bind(mock.address)
            .await
            .with_context(|| format!("cannot bind mock http server on {}", mock.address))?;
        let addr = listener.local_addr()?;
        info!(target: "server", %addr, "starting mock http server");
        self.status.send_modify(|s| s.mock_backend = Some(addr));
        let incoming = TcpListenerStream::new(listener);
        Ok(Some(tokio::spawn(mock_backend::serve(incoming, self.mock_shutdown.clone()))))
    }

    fn router(&self) -> Router {
        GrpcServer::builder()
            .max_concurrent_streams(self.config.max_concurrent_streams)
            .add_service(ExternalProcessorServer::new(self.processor.clone()))
            .add_service(HealthServer::new(HealthService))
    }

    async fn spawn_grpc(&self) -> Result<(ListenAddr, ListenerTask)> {
        let address = &self.config.grpc.address;
        let token = self.grpc_shutdown.clone();
        match self.config.grpc.network {
            Network::Tcp => {
                let listener =
                    TcpListener::bind(address).await.with_context(|| format!("cannot listen on tcp {address}"))?;
                let addr = listener.local_addr()?;
                let router = self.router();
                let task = tokio::spawn(async move {
                    router
                        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), token.cancelled_owned())
                        .await
                        .context("grpc server error")
                });
                Ok((ListenAddr::Tcp(addr), task))
            },
            Network::Unix => self.spawn_grpc_unix(Path::new(address), token),
        }
    }

    #[cfg(unix)]
    fn spawn_grpc_unix(&self, path: &Path, token: CancellationToken) -> Result<(ListenAddr, ListenerTask)> {
        use tokio::net::UnixListener;
        use tokio_stream::wrappers::UnixListenerStream;

        remove_socket(path).with_context(|| format!("cannot remove stale socket {}", path.display()))?;
        let listener =
            UnixListener::bind(path).with_context(|| format!("cannot listen on unix {}", path.display()))?;
        let router = self.router();
        let task = tokio::spawn(async move {
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), token.cancelled_owned())
                .await
                .context("grpc server error")
        });
        Ok((ListenAddr::Unix(path.to_path_buf()), task))
    }

    #[cfg(not(unix))]
    fn spawn_grpc_unix(&self, _path: &Path, _token: CancellationToken) -> Result<(ListenAddr, ListenerTask)> {
        Err(LifecycleError::UnixUnsupported.into())
    }

    async fn stop(&self, mut grpc_task: ListenerTask, mock_task: Option<ListenerTask>) -> Result<()> {
        self.status.send_modify(|s| s.phase = Phase::Stopping);
        let mut failures = Vec::<Error>::new();

        info!(target: "server", "stopping grpc server");
        self.grpc_shutdown.cancel();
        let drained = match timeout(self.config.grpc_drain_timeout, &mut grpc_task).await {
            Ok(joined) => listener_outcome(joined, "grpc server"),
            Err(_) => {
                warn!(
                    target: "server",
                    "streams still open after {:?}, cancelling them", self.config.grpc_drain_timeout
                );
                self.stream_abort.cancel();
                match timeout(ABORTED_STREAMS_GRACE, &mut grpc_task).await {
                    Ok(joined) => listener_outcome(joined, "grpc server"),
                    Err(_) => {
                        grpc_task.abort();
                        Err("grpc server did not stop after its streams were cancelled".into())
                    },
                }
            },
        };
        if let Err(err) = drained {
            error!(target: "server", "grpc server shutdown error: {err}");
            failures.push(err);
        }

        self.remove_unix_socket();

        if let Some(mut mock_task) = mock_task {
            info!(target: "server", "stopping http server");
            self.mock_shutdown.cancel();
            let stopped = match timeout(self.config.http_shutdown_timeout, &mut mock_task).await {
                Ok(joined) => listener_outcome(joined, "mock http server"),
                Err(_) => {
                    mock_task.abort();
                    Err(format!("timed out after {:?}", self.config.http_shutdown_timeout).into())
                },
            };
            if let Err(err) = stopped {
                let err = err.context("http server shutdown error");
                error!(target: "server", "{err}");
                failures.push(err);
            }
        }

        debug!(target: "server", wait = ?self.config.shutdown_wait, "waiting before declaring the server stopped");
        sleep(self.config.shutdown_wait).await;
        self.status.send_modify(|s| s.phase = Phase::Stopped);
        info!(target: "server", "server stopped");

        match failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn remove_unix_socket(&self) {
        let socket = match &self.status.borrow().grpc {
            Some(ListenAddr::Unix(path)) => path.clone(),
            _ => return,
        };
        if let Err(err) = remove_socket(&socket) {
            warn!(target: "server", "cannot remove socket {}: {err}", socket.display());
        }
    }

    /// Without a mock backend the server is ready as soon as it exists. With one, the backend must answer
    /// `GET /headers` with 200.
    pub async fn is_ready(&self) -> bool {
        if self.config.mock_backend.is_none() {
            return true;
        }
        let mock_backend = self.status.borrow().mock_backend;
        let Some(addr) = mock_backend else {
            return false;
        };
        let Ok(uri) = format!("http://{}/headers", probe_addr(addr)).parse::<Uri>() else {
            return false;
        };
        let Ok(request) = Request::get(uri).body(Empty::new()) else {
            return false;
        };
        match timeout(READINESS_PROBE_TIMEOUT, self.probe.request(request)).await {
            Ok(Ok(response)) => response.status() == StatusCode::OK,
            Ok(Err(err)) => {
                debug!(target: "server", "readiness probe failed: {err}");
                false
            },
            Err(_) => false,
        }
    }

    pub async fn wait_ready(&self, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        let mut ticker = interval_at(Instant::now() + READINESS_POLL_INTERVAL, READINESS_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                () = sleep_until(deadline) => return Err(LifecycleError::NotReady(wait).into()),
                _ = ticker.tick() => {
                    if self.is_ready().await {
                        return Ok(());
                    }
                },
            }
        }
    }
}

fn listener_outcome(joined: std::result::Result<Result<()>, JoinError>, name: &'static str) -> Result<()> {
    joined.with_context(|| format!("{name} task failed"))?
}

/// A listener has no business ending while the server is serving, even cleanly.
fn exit_error(outcome: Result<()>, name: &'static str) -> Error {
    match outcome {
        Ok(()) => LifecycleError::ListenerExited(name).into(),
        Err(err) => err,
    }
}

async fn join_optional(task: &mut Option<ListenerTask>) -> Result<()> {
    match task {
        Some(handle) => listener_outcome(handle.await, "mock http server"),
        None => std::future::pending().await,
    }
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// The probe needs a routable address even when the backend listens on every interface.
fn probe_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}
