//! HTTP/1 reverse proxy forwarder (spec §4.8). Host-preserving, streams
//! both bodies through unmodified while tee'ing each into a 64 KB
//! cap-then-truncate buffer for observation, emits `request.completed`
//! exactly once via an idempotency guard. Forwarding never waits for a
//! body to end, so chunked uploads, SSE, and long polls pass straight
//! through instead of hanging the proxy until the stream closes.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rig_common::error::{Error, Result};

use crate::event::ProxyEvent;
use crate::tee::TeeBody;

const BODY_CAP: usize = 64 * 1024;

type ResponseBody = BoxBody<Bytes, hyper::Error>;

fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never: Infallible| match never {}).boxed()
}

pub struct HttpReverseProxy {
    pub target_host: String,
    pub target_port: u16,
}

impl HttpReverseProxy {
    pub async fn run(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
        sink: UnboundedSender<ProxyEvent>,
    ) -> Result<()> {
        let client: Client<HttpConnector, TeeBody<Incoming>> =
            Client::builder(TokioExecutor::new()).build_http();
        let target_host = self.target_host.clone();
        let target_port = self.target_port;

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, _addr) = accepted.map_err(|e| Error::Internal(e.into()))?;
            let io = TokioIo::new(stream);

            let client = client.clone();
            let target_host = target_host.clone();
            let sink = sink.clone();
            let child_cancel = cancel.child_token();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let client = client.clone();
                    let target_host = target_host.clone();
                    let sink = sink.clone();
                    async move {
                        let response =
                            proxy_one(req, &client, &target_host, target_port, &sink).await;
                        Ok::<_, Infallible>(response)
                    }
                });

                let conn = ConnBuilder::new(TokioExecutor::new()).serve_connection(io, service);
                tokio::select! {
                    result = conn => {
                        if let Err(err) = result {
                            warn!(error = %err, "http reverse proxy connection ended with error");
                        }
                    }
                    _ = child_cancel.cancelled() => {}
                }
            });
        }
    }
}

/// One side of the request/response body, captured once its tee finishes.
struct TeeResult {
    body: Vec<u8>,
    truncated: bool,
    size: usize,
}

async fn proxy_one(
    req: Request<Incoming>,
    client: &Client<HttpConnector, TeeBody<Incoming>>,
    target_host: &str,
    target_port: u16,
    sink: &UnboundedSender<ProxyEvent>,
) -> Response<ResponseBody> {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let request_headers = header_map(req.headers());

    let (parts, body) = req.into_parts();

    let (request_tx, request_rx) = tokio::sync::oneshot::channel();
    let request_tee = TeeBody::new(body, BODY_CAP, move |buf, _trailers| {
        let (body, truncated, size) = buf.into_parts();
        let _ = request_tx.send(TeeResult { body, truncated, size });
    });

    let mut target_req = Request::builder()
        .method(parts.method.clone())
        .uri(format!(
            "http://{target_host}:{target_port}{}",
            parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        ))
        .body(request_tee)
        .expect("rebuilt request from valid parts is always well-formed");
    *target_req.headers_mut() = parts.headers.clone();

    let emitted = Arc::new(AtomicBool::new(false));

    match client.request(target_req).await {
        Ok(upstream) => {
            let status = upstream.status().as_u16();
            let response_headers = header_map(upstream.headers());

            let (response_tx, response_rx) = tokio::sync::oneshot::channel();
            let response_tee = TeeBody::new(upstream.into_body(), BODY_CAP, move |buf, _trailers| {
                let (body, truncated, size) = buf.into_parts();
                let _ = response_tx.send(TeeResult { body, truncated, size });
            });

            spawn_emit(
                emitted,
                sink.clone(),
                method,
                path,
                status,
                started,
                request_headers,
                response_headers,
                request_rx,
                response_rx,
            );

            Response::builder()
                .status(status)
                .body(response_tee.boxed())
                .unwrap_or_else(|_| Response::new(empty_body()))
        }
        Err(_) => {
            spawn_emit(
                emitted,
                sink.clone(),
                method,
                path,
                502,
                started,
                request_headers,
                HashMap::new(),
                request_rx,
                tokio::sync::oneshot::channel().1,
            );
            Response::builder().status(502).body(empty_body()).unwrap_or_else(|_| Response::new(empty_body()))
        }
    }
}

/// Waits for both tees to finish (or for the response side to be dropped,
/// e.g. on an upstream connect failure) and emits exactly one
/// `request.completed` event, whatever happens first for an already-fired
/// guard.
#[allow(clippy::too_many_arguments)]
fn spawn_emit(
    emitted: Arc<AtomicBool>,
    sink: UnboundedSender<ProxyEvent>,
    method: String,
    path: String,
    status: u16,
    started: Instant,
    request_headers: HashMap<String, String>,
    response_headers: HashMap<String, String>,
    request_rx: tokio::sync::oneshot::Receiver<TeeResult>,
    response_rx: tokio::sync::oneshot::Receiver<TeeResult>,
) {
    tokio::spawn(async move {
        let request_result = request_rx.await.unwrap_or_else(|_| TeeResult {
            body: Vec::new(),
            truncated: false,
            size: 0,
        });
        let response_result = response_rx.await.unwrap_or_else(|_| TeeResult {
            body: Vec::new(),
            truncated: false,
            size: 0,
        });

        if emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = sink.send(ProxyEvent::RequestCompleted {
            method,
            path,
            status,
            latency_ms: started.elapsed().as_millis() as u64,
            request_headers,
            response_headers,
            request_body: request_result.body,
            response_body: response_result.body,
            request_body_truncated: request_result.truncated,
            response_body_truncated: response_result.truncated,
            request_size: request_result.size,
            response_size: response_result.size,
        });
    });
}

fn header_map(headers: &hyper::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_skips_non_utf8_values() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("x-plain", hyper::header::HeaderValue::from_static("ok"));
        let map = header_map(&headers);
        assert_eq!(map["x-plain"], "ok");
    }
}
