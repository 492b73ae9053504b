//! gRPC proxy forwarder: HTTP/2 cleartext (h2c) with trailer inspection and
//! best-effort reflection-based frame decoding (spec §4.8).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use once_cell::sync::Lazy;
use prost_reflect::DescriptorPool;
use tokio::net::TcpListener;
use tokio::sync::{mpsc::UnboundedSender, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rig_common::error::{Error, Result};

use crate::event::ProxyEvent;
use crate::tee::TeeBody;

const FRAME_HEADER_LEN: usize = 5;
const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;
/// Decoding is best-effort observation, so only the first `DECODE_CAP`
/// bytes of a call's body are buffered for it; forwarding itself is
/// unbounded and streams straight through (spec §5).
const DECODE_CAP: usize = 64 * 1024;

type ResponseBody = BoxBody<Bytes, hyper::Error>;

fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never: Infallible| match never {}).boxed()
}

/// Descriptor pools fetched via reflection, keyed by `target_host:target_port`
/// so identical targets probed from multiple proxy instances share one
/// fetch (spec §4.8).
static REFLECTION_CACHE: Lazy<Mutex<HashMap<String, Option<Arc<DescriptorPool>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub struct GrpcProxy {
    pub target_host: String,
    pub target_port: u16,
}

impl GrpcProxy {
    pub async fn run(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
        sink: UnboundedSender<ProxyEvent>,
    ) -> Result<()> {
        let pool = reflection_pool_for(&self.target_host, self.target_port).await;

        let client: Client<HttpConnector, TeeBody<Incoming>> = {
            let mut connector = HttpConnector::new();
            connector.enforce_http(false);
            Client::builder(TokioExecutor::new())
                .http2_only(true)
                .build(connector)
        };

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, _addr) = accepted.map_err(|e| Error::Internal(e.into()))?;
            let io = TokioIo::new(stream);

            let client = client.clone();
            let target_host = self.target_host.clone();
            let target_port = self.target_port;
            let sink = sink.clone();
            let pool = pool.clone();
            let child_cancel = cancel.child_token();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let client = client.clone();
                    let target_host = target_host.clone();
                    let sink = sink.clone();
                    let pool = pool.clone();
                    async move {
                        let response =
                            proxy_one(req, &client, &target_host, target_port, &sink, pool.clone())
                                .await;
                        Ok::<_, Infallible>(response)
                    }
                });

                let conn = ConnBuilder::new(TokioExecutor::new())
                    .http2_only(true)
                    .serve_connection(io, service);
                tokio::select! {
                    result = conn => {
                        if let Err(err) = result {
                            warn!(error = %err, "grpc proxy connection ended with error");
                        }
                    }
                    _ = child_cancel.cancelled() => {}
                }
            });
        }
    }
}

/// Fetches the target's reflected service descriptors once at proxy start.
/// Any failure (unreachable, reflection unimplemented, malformed response)
/// is swallowed: the proxy falls back to raw-bytes observation.
async fn reflection_pool_for(host: &str, port: u16) -> Option<Arc<DescriptorPool>> {
    let cache_key = format!("{host}:{port}");
    {
        let cache = REFLECTION_CACHE.lock().await;
        if let Some(cached) = cache.get(&cache_key) {
            return cached.clone();
        }
    }

    let fetched = fetch_reflection(host, port).await.ok().flatten();
    let mut cache = REFLECTION_CACHE.lock().await;
    cache.insert(cache_key, fetched.clone());
    fetched
}

async fn fetch_reflection(host: &str, port: u16) -> anyhow::Result<Option<Arc<DescriptorPool>>> {
    use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
    use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
    use tonic_reflection::pb::v1::ServerReflectionRequest;

    let channel = tonic::transport::Endpoint::from_shared(format!("http://{host}:{port}"))?
        .timeout(Duration::from_secs(2))
        .connect()
        .await?;
    let mut client = ServerReflectionClient::new(channel);

    let list_request = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::ListServices(String::new())),
    };
    let mut stream = client
        .server_reflection_info(futures::stream::iter(vec![list_request]))
        .await?
        .into_inner();
    let Some(list_response) = stream.message().await? else {
        return Ok(None);
    };

    let services: Vec<String> = match list_response.message_response {
        Some(tonic_reflection::pb::v1::server_reflection_response::MessageResponse::ListServicesResponse(resp)) => {
            resp.service.into_iter().map(|s| s.name).collect()
        }
        _ => return Ok(None),
    };
    if services.is_empty() {
        return Ok(None);
    }

    let mut pool = DescriptorPool::new();
    for service in services {
        let request = ServerReflectionRequest {
            host: String::new(),
            message_request: Some(MessageRequest::FileContainingSymbol(service)),
        };
        let mut stream = client
            .server_reflection_info(futures::stream::iter(vec![request]))
            .await?
            .into_inner();
        if let Some(response) = stream.message().await? {
            if let Some(tonic_reflection::pb::v1::server_reflection_response::MessageResponse::FileDescriptorResponse(fd)) =
                response.message_response
            {
                for raw in fd.file_descriptor_proto {
                    if let Ok(proto) = prost::Message::decode(raw.as_slice()) {
                        let _ = pool.add_file_descriptor_proto(proto);
                    }
                }
            }
        }
    }

    Ok(Some(Arc::new(pool)))
}

/// What a body's tee captured once it finished: the (capped) bytes used
/// for best-effort decode, and any trailers (carrying `grpc-status`).
struct GrpcTeeResult {
    bytes: Vec<u8>,
    trailers: Option<HeaderMap>,
}

async fn proxy_one(
    req: Request<Incoming>,
    client: &Client<HttpConnector, TeeBody<Incoming>>,
    target_host: &str,
    target_port: u16,
    sink: &UnboundedSender<ProxyEvent>,
    pool: Option<Arc<DescriptorPool>>,
) -> Response<ResponseBody> {
    let started = Instant::now();
    let (service, method) = parse_grpc_path(req.uri().path());

    let (parts, body) = req.into_parts();
    let (request_tx, request_rx) = tokio::sync::oneshot::channel();
    let request_tee = TeeBody::new(body, DECODE_CAP, move |buf, trailers| {
        let (bytes, _truncated, _size) = buf.into_parts();
        let _ = request_tx.send(GrpcTeeResult { bytes, trailers });
    });

    let mut target_req = Request::builder()
        .method(parts.method.clone())
        .uri(format!(
            "http://{target_host}:{target_port}{}",
            parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        ))
        .body(request_tee)
        .expect("rebuilt grpc request from valid parts is always well-formed");
    *target_req.headers_mut() = parts.headers;

    let Ok(upstream) = client.request(target_req).await else {
        spawn_grpc_emit(
            sink.clone(),
            service,
            method,
            started,
            pool,
            request_rx,
            tokio::sync::oneshot::channel().1,
            None,
        );
        return Response::builder().status(502).body(empty_body()).unwrap();
    };

    let status_code = upstream.status();
    let response_headers = upstream.headers().clone();

    let (response_tx, response_rx) = tokio::sync::oneshot::channel();
    let response_tee = TeeBody::new(upstream.into_body(), DECODE_CAP, move |buf, trailers| {
        let (bytes, _truncated, _size) = buf.into_parts();
        let _ = response_tx.send(GrpcTeeResult { bytes, trailers });
    });

    spawn_grpc_emit(
        sink.clone(),
        service,
        method,
        started,
        pool,
        request_rx,
        response_rx,
        Some(response_headers.clone()),
    );

    let mut response = Response::builder().status(status_code);
    if let Some(headers) = response.headers_mut() {
        *headers = response_headers;
    }
    response.body(response_tee.boxed()).unwrap_or_else(|_| Response::new(empty_body()))
}

/// Waits for both tees to finish, decodes whatever bytes were captured
/// (capped, best-effort), and emits exactly one `grpc.completed` event.
#[allow(clippy::too_many_arguments)]
fn spawn_grpc_emit(
    sink: UnboundedSender<ProxyEvent>,
    service: String,
    method: String,
    started: Instant,
    pool: Option<Arc<DescriptorPool>>,
    request_rx: tokio::sync::oneshot::Receiver<GrpcTeeResult>,
    response_rx: tokio::sync::oneshot::Receiver<GrpcTeeResult>,
    response_headers: Option<HeaderMap>,
) {
    tokio::spawn(async move {
        let request_result = request_rx.await.ok();
        let response_result = response_rx.await.ok();

        let request_decoded = request_result
            .as_ref()
            .and_then(|r| decode_frames(&r.bytes, pool.as_deref(), &service, &method, true));
        let response_decoded = response_result
            .as_ref()
            .and_then(|r| decode_frames(&r.bytes, pool.as_deref(), &service, &method, false));

        let trailers = response_result.as_ref().and_then(|r| r.trailers.clone());
        let (grpc_status, grpc_message) = match &response_headers {
            Some(headers) => grpc_status_from(headers, trailers.as_ref()),
            None => ("UNAVAILABLE".to_string(), Some("upstream connect failed".to_string())),
        };

        let _ = sink.send(ProxyEvent::GrpcCallCompleted {
            service,
            method,
            grpc_status,
            grpc_message,
            request_body_decoded: request_decoded,
            response_body_decoded: response_decoded,
            latency_ms: started.elapsed().as_millis() as u64,
        });
    });
}

fn parse_grpc_path(path: &str) -> (String, String) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.rsplit_once('/') {
        Some((service, method)) => (service.to_string(), method.to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

fn grpc_status_from(headers: &HeaderMap, trailers: Option<&HeaderMap>) -> (String, Option<String>) {
    let lookup = |name: &str| -> Option<String> {
        trailers
            .and_then(|t| t.get(name))
            .or_else(|| headers.get(name))
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    let code: i32 = lookup("grpc-status").and_then(|s| s.parse().ok()).unwrap_or(0);
    let message = lookup("grpc-message");
    (grpc_status_name(code).to_string(), message)
}

/// Canonical gRPC status names (grpc-status codes 0-16).
fn grpc_status_name(code: i32) -> &'static str {
    match code {
        0 => "OK",
        1 => "CANCELLED",
        2 => "UNKNOWN",
        3 => "INVALID_ARGUMENT",
        4 => "DEADLINE_EXCEEDED",
        5 => "NOT_FOUND",
        6 => "ALREADY_EXISTS",
        7 => "PERMISSION_DENIED",
        8 => "RESOURCE_EXHAUSTED",
        9 => "FAILED_PRECONDITION",
        10 => "ABORTED",
        11 => "OUT_OF_RANGE",
        12 => "UNIMPLEMENTED",
        13 => "INTERNAL",
        14 => "UNAVAILABLE",
        15 => "DATA_LOSS",
        16 => "UNAUTHENTICATED",
        _ => "UNKNOWN",
    }
}

/// Unpacks 5-byte-header length-prefixed gRPC frames, decompressing gzip
/// payloads, and attempts a reflection-based decode to JSON. On any
/// failure (oversized frame, truncated frame, no descriptor available)
/// this returns `None` silently per spec.
fn decode_frames(
    bytes: &[u8],
    pool: Option<&DescriptorPool>,
    service: &str,
    method: &str,
    is_request: bool,
) -> Option<serde_json::Value> {
    let pool = pool?;
    let mut offset = 0;
    let mut messages = Vec::new();

    while offset + FRAME_HEADER_LEN <= bytes.len() {
        let compressed = bytes[offset] != 0;
        let len = u32::from_be_bytes(bytes[offset + 1..offset + 5].try_into().ok()?) as usize;
        if len > MAX_FRAME_SIZE {
            return None;
        }
        let body_start = offset + FRAME_HEADER_LEN;
        if body_start + len > bytes.len() {
            break;
        }
        let raw = &bytes[body_start..body_start + len];
        let payload = if compressed {
            decompress_gzip(raw)?
        } else {
            raw.to_vec()
        };
        messages.push(payload);
        offset = body_start + len;
    }

    if messages.is_empty() {
        return None;
    }

    let service_desc = pool.get_service_by_name(service)?;
    let method_desc = service_desc.methods().find(|m| m.name() == method)?;
    let message_desc = if is_request {
        method_desc.input()
    } else {
        method_desc.output()
    };

    let decoded: Vec<serde_json::Value> = messages
        .iter()
        .filter_map(|payload| {
            let msg = prost_reflect::DynamicMessage::decode(message_desc.clone(), payload.as_slice()).ok()?;
            serde_json::to_value(&msg).ok()
        })
        .collect();

    if decoded.len() == 1 {
        decoded.into_iter().next()
    } else {
        Some(serde_json::Value::Array(decoded))
    }
}

fn decompress_gzip(bytes: &[u8]) -> Option<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_and_method_from_path() {
        let (service, method) = parse_grpc_path("/pkg.Greeter/SayHello");
        assert_eq!(service, "pkg.Greeter");
        assert_eq!(method, "SayHello");
    }

    #[test]
    fn no_descriptor_pool_yields_no_decode() {
        let frame = [0u8, 0, 0, 0, 2, 0xAB, 0xCD];
        let decoded = decode_frames(&frame, None, "pkg.Greeter", "SayHello", true);
        assert!(decoded.is_none());
    }
}
