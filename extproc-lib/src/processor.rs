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

use std::sync::Arc;

use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_server::ExternalProcessor, processing_request::Request as ProcessingRequestType,
    processing_response::Response as ProcessingResponseType, BodyResponse, HeadersResponse, HttpHeaders,
    ProcessingRequest, ProcessingResponse, TrailersResponse,
};
use futures::{Stream, StreamExt};
use tokio::{select, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info};

use crate::{
    decision::DecisionEngine,
    headers::{HeaderSet, ProcessingOutcome},
};

const RESPONSE_CHANNEL_SIZE: usize = 16;

pub type ResponseSender = mpsc::Sender<Result<ProcessingResponse, Status>>;

/// Serves the ext_proc `Process` stream: one response per received message, in order.
#[derive(Debug, Clone)]
pub struct StreamProcessor {
    engine: Arc<DecisionEngine>,
    abort: CancellationToken,
}

impl StreamProcessor {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self { engine, abort: CancellationToken::new() }
    }

    /// Streams still running when `abort` fires end with a `Cancelled` status.
    #[must_use]
    pub fn with_abort(self, abort: CancellationToken) -> Self {
        Self { abort, ..self }
    }

    /// Drives one stream until envoy closes it, the response side goes away or a fatal error occurs.
    pub async fn run<S>(&self, inbound: S, tx: ResponseSender) -> Result<(), Status>
    where
        S: Stream<Item = Result<ProcessingRequest, Status>>,
    {
        let mut inbound = std::pin::pin!(inbound);
        let mut answered = 0_usize;

        loop {
            let next = select! {
                biased;
                () = self.abort.cancelled() => {
                    debug!(target: "ext_proc", "processing aborted");
                    return Err(Status::cancelled("stream processing aborted"));
                },
                () = tx.closed() => {
                    debug!(target: "ext_proc", "processing server context done");
                    return Err(Status::cancelled("response stream closed"));
                },
                next = inbound.next() => next,
            };

            let request = match next {
                Some(Ok(request)) => request,
                Some(Err(status)) => {
                    return Err(Status::unknown(format!("cannot receive stream request: {status}")));
                },
                None => {
                    info!(target: "ext_proc", answered, "envoy has closed the stream");
                    return Ok(());
                },
            };

            let response = select! {
                biased;
                () = self.abort.cancelled() => return Err(Status::cancelled("stream processing aborted")),
                response = self.respond(request) => response,
            };

            debug!(target: "ext_proc", "sending ProcessingResponse");
            if tx.send(Ok(response)).await.is_err() {
                error!(target: "ext_proc", "send error: response stream closed");
                return Err(Status::unavailable("response stream closed"));
            }
            answered += 1;
        }
    }

    async fn respond(&self, request: ProcessingRequest) -> ProcessingResponse {
        let response = match request.request {
            Some(ProcessingRequestType::RequestHeaders(headers)) => {
                debug!(target: "ext_proc", "got RequestHeaders");
                ProcessingResponseType::RequestHeaders(self.request_headers(&headers).await)
            },
            Some(ProcessingRequestType::RequestBody(_)) => {
                debug!(target: "ext_proc", "got RequestBody (not acted on)");
                ProcessingResponseType::RequestBody(BodyResponse::default())
            },
            Some(ProcessingRequestType::RequestTrailers(_)) => {
                debug!(target: "ext_proc", "got RequestTrailers (not acted on)");
                ProcessingResponseType::RequestTrailers(TrailersResponse::default())
            },
            Some(ProcessingRequestType::ResponseHeaders(_)) => {
                debug!(target: "ext_proc", "got ResponseHeaders (not acted on)");
                ProcessingResponseType::ResponseHeaders(HeadersResponse::default())
            },
            Some(ProcessingRequestType::ResponseBody(_)) => {
                debug!(target: "ext_proc", "got ResponseBody (not acted on)");
                ProcessingResponseType::ResponseBody(BodyResponse::default())
            },
            Some(ProcessingRequestType::ResponseTrailers(_)) => {
                debug!(target: "ext_proc", "got ResponseTrailers (not acted on)");
                ProcessingResponseType::ResponseTrailers(TrailersResponse::default())
            },
            None => {
                error!(target: "ext_proc", "unknown request type");
                return ProcessingResponse::default();
            },
        };
        ProcessingResponse { response: Some(response), ..Default::default() }
    }

    async fn request_headers(&self, headers: &HttpHeaders) -> HeadersResponse {
        let headers = headers.headers.as_ref().map(HeaderSet::from).unwrap_or_default();
        match self.engine.decide(&headers).await {
            Ok(outcome) => outcome.into(),
            Err(err) => {
                let kind = err.kind();
                let err = extproc_error::Error::from(err);
                error!(target: "ext_proc", %kind, "failed to fetch routing decision, continuing unmodified: {err}");
                ProcessingOutcome::unmodified().into()
            },
        }
    }
}

#[tonic::async_trait]
impl ExternalProcessor for StreamProcessor {
    type ProcessStream = ReceiverStream<Result<ProcessingResponse, Status>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);
        let processor = self.clone();

        tokio::spawn(async move {
            if let Err(status) = processor.run(inbound, tx.clone()).await {
                debug!(target: "ext_proc", code = ?status.code(), "stream ended: {}", status.message());
                // the peer may already be gone
                let _ = tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::RoutingDecisionClient;
    use envoy_types::pb::envoy::{
        config::core::v3::{HeaderMap, HeaderValue},
        service::ext_proc::v3::{HttpBody, HttpTrailers},
    };
    use tracing_test::traced_test;

    fn processor() -> StreamProcessor {
        let engine =
            DecisionEngine::new("preferred-svc", "x-routing-decision", RoutingDecisionClient::new(None, None));
        StreamProcessor::new(Arc::new(engine))
    }

    fn headers_request(headers: &[(&str, &str)]) -> ProcessingRequest {
        let headers = HeaderMap {
            headers: headers
                .iter()
                .map(|(k, v)| HeaderValue { key: (*k).to_owned(), raw_value: v.as_bytes().to_vec(), ..Default::default() })
                .collect(),
        };
        ProcessingRequest {
            request: Some(ProcessingRequestType::RequestHeaders(HttpHeaders {
                headers: Some(headers),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    async fn run_to_end(requests: Vec<ProcessingRequest>) -> (Result<(), Status>, Vec<ProcessingResponse>) {
        let (tx, mut rx) = mpsc::channel(requests.len() + 1);
        let inbound = futures::stream::iter(requests.into_iter().map(Ok));
        let result = processor().run(inbound, tx).await;
        let mut responses = vec![];
        while let Some(response) = rx.recv().await {
            responses.push(response.unwrap());
        }
        (result, responses)
    }

    #[tokio::test]
    #[traced_test]
    async fn preferred_service_sets_decision() {
        let (result, responses) = run_to_end(vec![headers_request(&[("preferred-svc", "svc-a")])]).await;
        assert!(result.is_ok());
        assert_eq!(responses.len(), 1);
        let Some(ProcessingResponseType::RequestHeaders(headers)) = &responses[0].response else {
            panic!("unexpected response {:?}", responses[0]);
        };
        let common = headers.response.as_ref().unwrap();
        assert!(common.clear_route_cache);
        let mutation = common.header_mutation.as_ref().unwrap();
        assert_eq!(mutation.remove_headers, vec!["preferred-svc".to_owned()]);
        assert_eq!(mutation.set_headers[0].header.as_ref().unwrap().raw_value, b"svc-a");
    }

    #[tokio::test]
    #[traced_test]
    async fn decision_failure_keeps_stream_open() {
        let body = ProcessingRequest {
            request: Some(ProcessingRequestType::RequestBody(HttpBody::default())),
            ..Default::default()
        };
        let (result, responses) = run_to_end(vec![headers_request(&[(":path", "/")]), body]).await;
        assert!(result.is_ok());
        assert_eq!(responses.len(), 2);

        let Some(ProcessingResponseType::RequestHeaders(headers)) = &responses[0].response else {
            panic!("unexpected response {:?}", responses[0]);
        };
        let common = headers.response.as_ref().unwrap();
        assert!(common.header_mutation.is_none());
        assert!(!common.clear_route_cache);
        assert!(matches!(responses[1].response, Some(ProcessingResponseType::RequestBody(_))));
        assert!(logs_contain("failed to fetch routing decision"));
    }

    #[tokio::test]
    #[traced_test]
    async fn inert_phases_get_matching_empty_responses() {
        let requests = vec![
            ProcessingRequestType::RequestBody(HttpBody::default()),
            ProcessingRequestType::RequestTrailers(HttpTrailers::default()),
            ProcessingRequestType::ResponseHeaders(HttpHeaders::default()),
            ProcessingRequestType::ResponseBody(HttpBody::default()),
            ProcessingRequestType::ResponseTrailers(HttpTrailers::default()),
        ]
        .into_iter()
        .map(|r| ProcessingRequest { request: Some(r), ..Default::default() })
        .collect();
        let (result, responses) = run_to_end(requests).await;
        assert!(result.is_ok());
        let expected = vec![
            ProcessingResponseType::RequestBody(BodyResponse::default()),
            ProcessingResponseType::RequestTrailers(TrailersResponse::default()),
            ProcessingResponseType::ResponseHeaders(HeadersResponse::default()),
            ProcessingResponseType::ResponseBody(BodyResponse::default()),
            ProcessingResponseType::ResponseTrailers(TrailersResponse::default()),
        ];
        let actual: Vec<_> = responses.into_iter().map(|r| r.response.unwrap()).collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_request_gets_empty_response() {
        let (result, responses) = run_to_end(vec![ProcessingRequest::default()]).await;
        assert!(result.is_ok());
        assert_eq!(responses, vec![ProcessingResponse::default()]);
        assert!(logs_contain("unknown request type"));
    }

    #[tokio::test]
    async fn receive_error_is_unknown() {
        let (tx, _rx) = mpsc::channel(4);
        let inbound = futures::stream::iter(vec![Err(Status::data_loss("connection reset"))]);
        let status = processor().run(inbound, tx).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unknown);
        assert!(status.message().starts_with("cannot receive stream request: "));
    }

    #[tokio::test]
    async fn closed_response_side_ends_processing() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let status = processor().run(futures::stream::pending(), tx).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }

    #[tokio::test]
    async fn abort_token_cancels_idle_stream() {
        let abort = CancellationToken::new();
        let processor = processor().with_abort(abort.clone());
        let (tx, _rx) = mpsc::channel(4);
        abort.cancel();
        let status = processor.run(futures::stream::pending(), tx).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }
}
