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

//! Small HTTP backend used as an upstream by the integration fixtures and by the readiness probe.
//!
//! * `GET /headers` echoes the request headers as `{"headers": {...}}`
//! * `GET /response-headers?status=201&X-Name=value` answers with that status and sets every other
//!   query parameter as a response header

use std::{collections::BTreeMap, convert::Infallible, io, time::Duration};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;

/// Pause after a failed accept so a persistent error such as EMFILE does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Serves connections from `incoming` until `shutdown` fires, then waits for the open ones to finish.
/// Accept errors are logged and skipped. The stream running dry is an error.
pub async fn serve<S, IO>(incoming: S, shutdown: CancellationToken) -> Result<()>
where
    S: Stream<Item = io::Result<IO>>,
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let graceful = GracefulShutdown::new();
    let mut incoming = std::pin::pin!(incoming);
    info!(target: "mock_backend", "starting mock http server");

    let outcome = loop {
        let next = select! {
            next = incoming.next() => next,
            () = shutdown.cancelled() => break Ok(()),
        };

        let stream = match next {
            Some(Ok(stream)) => stream,
            Some(Err(err)) => {
                warn!(target: "mock_backend", "failed to accept a connection: {err}");
                sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            },
            None => break Err("mock http server listener closed".into()),
        };

        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service_fn(handle));
        let conn = graceful.watch(conn);
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(target: "mock_backend", "connection error: {err}");
            }
        });
    };

    info!(target: "mock_backend", "stopping http server");
    graceful.shutdown().await;
    outcome
}

#[allow(clippy::unused_async)]
async fn handle(request: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    Ok(respond(&request))
}

pub fn respond<B>(request: &Request<B>) -> Response<Full<Bytes>> {
    match request.uri().path() {
        "/headers" => request_headers(request),
        "/response-headers" => response_headers(request.uri().query().unwrap_or_default()),
        _ => json_response(StatusCode::NOT_FOUND, &json!({ "error": "not found" })),
    }
}

fn request_headers<B>(request: &Request<B>) -> Response<Full<Bytes>> {
    let mut headers = BTreeMap::new();
    for name in request.headers().keys() {
        let values: Vec<_> =
            request.headers().get_all(name).iter().map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()).collect();
        headers.insert(canonical_name(name.as_str()), values.join(","));
    }

    let host = request
        .uri()
        .authority()
        .map(|a| a.as_str().to_owned())
        .or_else(|| headers.get("Host").cloned())
        .unwrap_or_default();
    headers.insert("Host".to_owned(), host);
    headers.insert("Method".to_owned(), request.method().to_string());

    json_response(StatusCode::OK, &json!({ "headers": headers }))
}

fn response_headers(query: &str) -> Response<Full<Bytes>> {
    let mut status = StatusCode::OK;
    let mut echoed = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "status" {
            match value.parse::<u16>().ok().and_then(|code| StatusCode::from_u16(code).ok()) {
                Some(code) => status = code,
                None => {
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        &json!({ "error": format!("invalid status code {value:?}") }),
                    );
                },
            }
        } else {
            echoed.insert(key.into_owned(), value.into_owned());
        }
    }

    let mut response = json_response(status, &json!(echoed));
    for (key, value) in &echoed {
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            },
            _ => warn!(target: "mock_backend", %key, "skipping header that cannot be sent"),
        }
    }
    response
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// `x-test-header` -> `X-Test-Header`
fn canonical_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Uri;
    use http_body_util::{BodyExt, Empty};
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_stream::wrappers::TcpListenerStream;
    use tracing_test::traced_test;

    async fn body_json(response: Response<Full<Bytes>>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_name("x-test-header"), "X-Test-Header");
        assert_eq!(canonical_name("HOST"), "Host");
        assert_eq!(canonical_name("content-type"), "Content-Type");
    }

    #[tokio::test]
    async fn echoes_request_headers() {
        let request = Request::get("http://example.com/headers").header("x-test-header", "test-value").body(()).unwrap();
        let response = respond(&request);
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["headers"]["X-Test-Header"], "test-value");
        assert_eq!(body["headers"]["Host"], "example.com");
        assert_eq!(body["headers"]["Method"], "GET");
    }

    #[tokio::test]
    async fn response_headers_from_query() {
        let request =
            Request::get("http://example.com/response-headers?status=201&X-Test-Response=test-value").body(()).unwrap();
        let response = respond(&request);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-test-response").unwrap(), "test-value");

        let body = body_json(response).await;
        assert_eq!(body["X-Test-Response"], "test-value");
    }

    #[tokio::test]
    async fn response_headers_invalid_status() {
        let request = Request::get("http://example.com/response-headers?status=invalid").body(()).unwrap();
        let response = respond(&request);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(!body["error"].as_str().unwrap().is_empty());
    }

    #[test]
    fn response_headers_default_status() {
        let request = Request::get("/response-headers").body(()).unwrap();
        assert_eq!(respond(&request).status(), StatusCode::OK);
    }

    #[test]
    fn unknown_path() {
        let request = Request::get("/nothing-here").body(()).unwrap();
        assert_eq!(respond(&request).status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    #[traced_test]
    async fn accept_errors_do_not_stop_serving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let failed_accept = futures::stream::once(async {
            Err::<TcpStream, _>(io::Error::new(io::ErrorKind::Other, "too many open files"))
        });
        let incoming = failed_accept.chain(TcpListenerStream::new(listener));

        let shutdown = CancellationToken::new();
        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
        let uri: Uri = format!("http://{addr}/headers").parse().unwrap();

        let request = async {
            let response = client.get(uri).await.unwrap();
            let status = response.status();
            drop(response);
            shutdown.cancel();
            status
        };
        let (served, status) =
            tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(serve(incoming, shutdown.clone()), request) })
                .await
                .unwrap();

        assert!(served.is_ok(), "{served:?}");
        assert_eq!(status, StatusCode::OK);
        assert!(logs_contain("failed to accept a connection: too many open files"));
    }

    #[tokio::test]
    async fn exhausted_listener_is_an_error() {
        let incoming = futures::stream::empty::<io::Result<TcpStream>>();
        let err = serve(incoming, CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "mock http server listener closed");
    }
}
