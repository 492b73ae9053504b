//! Kafka broker-address rewriter (spec §4.8, §8 R2). Raw TCP with
//! frame-level awareness: only `Metadata` responses are parsed; every other
//! frame, and any `Metadata` response that fails to parse, is forwarded
//! byte-for-byte unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc::UnboundedSender, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rig_common::error::{Error, Result};

use crate::event::ProxyEvent;

const METADATA_API_KEY: i16 = 3;
/// Metadata API v9 is the first "flexible" (tagged-field) version.
const FIRST_FLEXIBLE_VERSION: i16 = 9;
const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;
const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct KafkaRewriter {
    pub target_host: String,
    pub target_port: u16,
    pub proxy_host: String,
    pub proxy_port: u16,
}

impl KafkaRewriter {
    pub async fn run(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
        sink: UnboundedSender<ProxyEvent>,
    ) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (client, _addr) = accepted.map_err(|e| Error::Internal(e.into()))?;

            let target_host = self.target_host.clone();
            let target_port = self.target_port;
            let proxy_host = self.proxy_host.clone();
            let proxy_port = self.proxy_port;
            let child_cancel = cancel.child_token();
            let sink = sink.clone();

            tokio::spawn(async move {
                let _ = sink.send(ProxyEvent::ConnectionOpened);
                if let Err(err) = run_connection(
                    client,
                    &target_host,
                    target_port,
                    &proxy_host,
                    proxy_port,
                    child_cancel,
                    &sink,
                )
                .await
                {
                    warn!(error = %err, "kafka proxy connection failed");
                }
            });
        }
    }
}

struct RequestInfo {
    api_key: i16,
    api_version: i16,
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    client: TcpStream,
    target_host: &str,
    target_port: u16,
    proxy_host: &str,
    proxy_port: u16,
    cancel: CancellationToken,
    sink: &UnboundedSender<ProxyEvent>,
) -> Result<()> {
    let started = Instant::now();
    let target = tokio::select! {
        connected = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((target_host, target_port))) => {
            connected.map_err(|_| Error::Timeout(DIAL_TIMEOUT, "kafka dial".into()))?
                .map_err(|e| Error::Internal(e.into()))?
        }
        _ = cancel.cancelled() => return Ok(()),
    };

    let (client_rd, client_wr) = client.into_split();
    let (target_rd, target_wr) = target.into_split();

    let correlations: Arc<Mutex<HashMap<i32, RequestInfo>>> = Arc::new(Mutex::new(HashMap::new()));

    let c2b = {
        let correlations = correlations.clone();
        pump_requests(client_rd, target_wr, correlations)
    };
    let b2c = pump_responses(
        target_rd,
        client_wr,
        correlations,
        proxy_host.to_string(),
        proxy_port,
    );

    let (bytes_in, bytes_out) = tokio::select! {
        _ = cancel.cancelled() => (0, 0),
        result = futures::future::join(c2b, b2c) => {
            (result.0.unwrap_or(0), result.1.unwrap_or(0))
        }
    };

    let _ = sink.send(ProxyEvent::ConnectionClosed {
        bytes_in,
        bytes_out,
        duration_ms: started.elapsed().as_millis() as u64,
    });
    Ok(())
}

async fn pump_requests(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    correlations: Arc<Mutex<HashMap<i32, RequestInfo>>>,
) -> std::io::Result<u64> {
    let mut total = 0u64;
    loop {
        let Some(frame) = read_frame(&mut reader).await? else {
            break;
        };
        total += frame.len() as u64 + 4;

        if let Some((api_key, api_version, correlation_id)) = parse_request_header(&frame) {
            correlations
                .lock()
                .await
                .insert(correlation_id, RequestInfo { api_key, api_version });
        }

        write_frame(&mut writer, &frame).await?;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

async fn pump_responses(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    correlations: Arc<Mutex<HashMap<i32, RequestInfo>>>,
    proxy_host: String,
    proxy_port: u16,
) -> std::io::Result<u64> {
    let mut total = 0u64;
    loop {
        let Some(frame) = read_frame(&mut reader).await? else {
            break;
        };

        let correlation_id = parse_response_correlation_id(&frame);
        let info = match correlation_id {
            Some(id) => correlations.lock().await.remove(&id),
            None => None,
        };

        let out_frame = match info {
            Some(info) if info.api_key == METADATA_API_KEY => {
                rewrite_metadata_response(&frame, info.api_version, &proxy_host, proxy_port)
                    .unwrap_or(frame)
            }
            _ => frame,
        };

        total += out_frame.len() as u64 + 4;
        write_frame(&mut writer, &out_frame).await?;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

async fn read_frame(reader: &mut tokio::net::tcp::OwnedReadHalf) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "kafka frame too large"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame(writer: &mut tokio::net::tcp::OwnedWriteHalf, body: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

fn parse_request_header(frame: &[u8]) -> Option<(i16, i16, i32)> {
    if frame.len() < 8 {
        return None;
    }
    let api_key = i16::from_be_bytes(frame[0..2].try_into().ok()?);
    let api_version = i16::from_be_bytes(frame[2..4].try_into().ok()?);
    let correlation_id = i32::from_be_bytes(frame[4..8].try_into().ok()?);
    Some((api_key, api_version, correlation_id))
}

fn parse_response_correlation_id(frame: &[u8]) -> Option<i32> {
    if frame.len() < 4 {
        return None;
    }
    Some(i32::from_be_bytes(frame[0..4].try_into().ok()?))
}

// --- Metadata response rewriting -----------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    fn i32(&mut self) -> Option<i32> {
        Some(i32::from_be_bytes(self.take(4)?.try_into().ok()?))
    }

    fn string(&mut self) -> Option<String> {
        let len = i16::from_be_bytes(self.take(2)?.try_into().ok()?);
        if len < 0 {
            return Some(String::new());
        }
        String::from_utf8(self.take(len as usize)?.to_vec()).ok()
    }

    fn nullable_string(&mut self) -> Option<Option<String>> {
        let len = i16::from_be_bytes(self.take(2)?.try_into().ok()?);
        if len < 0 {
            return Some(None);
        }
        Some(Some(String::from_utf8(self.take(len as usize)?.to_vec()).ok()?))
    }

    fn unsigned_varint(&mut self) -> Option<u32> {
        let mut value: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = *self.take(1)?.first()?;
            value |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Some(value);
            }
            shift += 7;
            if shift > 28 {
                return None;
            }
        }
    }

    fn compact_string(&mut self) -> Option<String> {
        let len = self.unsigned_varint()?;
        if len == 0 {
            return Some(String::new());
        }
        String::from_utf8(self.take((len - 1) as usize)?.to_vec()).ok()
    }

    fn compact_nullable_string(&mut self) -> Option<Option<String>> {
        let len = self.unsigned_varint()?;
        if len == 0 {
            return Some(None);
        }
        Some(Some(String::from_utf8(self.take((len - 1) as usize)?.to_vec()).ok()?))
    }

    /// Skips a tag buffer (compact array of tagged fields); rejects any
    /// non-empty one rather than trying to preserve unknown tag contents
    /// byte-perfectly during a rewrite we don't fully model.
    fn empty_tag_buffer(&mut self) -> Option<()> {
        let count = self.unsigned_varint()?;
        if count != 0 {
            return None;
        }
        Some(())
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

fn write_unsigned_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as i16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_nullable_string(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => write_string(out, s),
        None => out.extend_from_slice(&(-1i16).to_be_bytes()),
    }
}

fn write_compact_string(out: &mut Vec<u8>, s: &str) {
    write_unsigned_varint(out, s.len() as u32 + 1);
    out.extend_from_slice(s.as_bytes());
}

fn write_compact_nullable_string(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => write_compact_string(out, s),
        None => write_unsigned_varint(out, 0),
    }
}

/// Rewrites every advertised broker `host`/`port` to the proxy's own
/// address, preserving node IDs, racks, cluster id, controller id, and the
/// verbatim tail (topics + trailing tag buffer). Returns `None` on any
/// shape mismatch so the caller forwards the original frame unchanged.
fn rewrite_metadata_response(
    frame: &[u8],
    api_version: i16,
    proxy_host: &str,
    proxy_port: u16,
) -> Option<Vec<u8>> {
    let flexible = api_version >= FIRST_FLEXIBLE_VERSION;
    let mut r = Reader::new(frame);

    let correlation_id = r.i32()?;
    if flexible {
        r.empty_tag_buffer()?;
    }

    let throttle_time_ms = if api_version >= 3 { r.i32()? } else { 0 };

    let broker_count = if flexible {
        let n = r.unsigned_varint()?;
        if n == 0 {
            0
        } else {
            n - 1
        }
    } else {
        r.i32()? as u32
    };

    let mut out = Vec::with_capacity(frame.len());
    out.extend_from_slice(&correlation_id.to_be_bytes());
    if flexible {
        out.push(0); // empty tag buffer
    }
    if api_version >= 3 {
        out.extend_from_slice(&throttle_time_ms.to_be_bytes());
    }

    if flexible {
        write_unsigned_varint(&mut out, broker_count + 1);
    } else {
        out.extend_from_slice(&(broker_count as i32).to_be_bytes());
    }

    for _ in 0..broker_count {
        let node_id = r.i32()?;
        let _host = if flexible { r.compact_string()? } else { r.string()? };
        let _port = r.i32()?;
        let rack = if api_version >= 1 {
            if flexible {
                r.compact_nullable_string()?
            } else {
                r.nullable_string()?
            }
        } else {
            None
        };
        if flexible {
            r.empty_tag_buffer()?;
        }

        out.extend_from_slice(&node_id.to_be_bytes());
        if flexible {
            write_compact_string(&mut out, proxy_host);
        } else {
            write_string(&mut out, proxy_host);
        }
        out.extend_from_slice(&(proxy_port as i32).to_be_bytes());
        if api_version >= 1 {
            if flexible {
                write_compact_nullable_string(&mut out, rack.as_deref());
            } else {
                write_nullable_string(&mut out, rack.as_deref());
            }
        }
        if flexible {
            out.push(0);
        }
    }

    let cluster_id = if api_version >= 2 {
        if flexible {
            r.compact_nullable_string()?
        } else {
            r.nullable_string()?
        }
    } else {
        None
    };
    if api_version >= 2 {
        if flexible {
            write_compact_nullable_string(&mut out, cluster_id.as_deref());
        } else {
            write_nullable_string(&mut out, cluster_id.as_deref());
        }
    }

    let controller_id = if api_version >= 1 { r.i32()? } else { -1 };
    if api_version >= 1 {
        out.extend_from_slice(&controller_id.to_be_bytes());
    }

    // Topics array and any trailing tag buffer: copied verbatim, untouched.
    out.extend_from_slice(r.remaining());

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_classic_response(correlation_id: i32, host: &str, port: i32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&correlation_id.to_be_bytes());
        out.extend_from_slice(&0i32.to_be_bytes()); // throttle_time_ms (v3+)
        out.extend_from_slice(&1i32.to_be_bytes()); // broker count
        out.extend_from_slice(&7i32.to_be_bytes()); // node_id
        write_string(&mut out, host);
        out.extend_from_slice(&port.to_be_bytes());
        write_nullable_string(&mut out, None); // rack
        write_nullable_string(&mut out, Some("cluster-1")); // cluster_id
        out.extend_from_slice(&7i32.to_be_bytes()); // controller_id
        // no topics for this test
        out
    }

    #[test]
    fn rewrites_classic_broker_address() {
        let frame = build_classic_response(42, "real-broker.internal", 9092);
        let rewritten = rewrite_metadata_response(&frame, 7, "proxy.local", 19092).unwrap();

        let mut r = Reader::new(&rewritten);
        assert_eq!(r.i32().unwrap(), 42);
        assert_eq!(r.i32().unwrap(), 0); // throttle
        assert_eq!(r.i32().unwrap(), 1); // broker count
        assert_eq!(r.i32().unwrap(), 7); // node id preserved
        assert_eq!(r.string().unwrap(), "proxy.local");
        assert_eq!(r.i32().unwrap(), 19092);
    }

    #[test]
    fn malformed_frame_yields_none() {
        let frame = vec![0u8, 1, 2];
        assert!(rewrite_metadata_response(&frame, 7, "proxy.local", 1).is_none());
    }

    fn build_flexible_response(correlation_id: i32, host: &str, port: i32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&correlation_id.to_be_bytes());
        out.push(0); // header tag buffer
        out.extend_from_slice(&0i32.to_be_bytes()); // throttle_time_ms
        write_unsigned_varint(&mut out, 2); // broker array length + 1
        out.extend_from_slice(&3i32.to_be_bytes()); // node id
        write_compact_string(&mut out, host);
        out.extend_from_slice(&port.to_be_bytes());
        write_compact_nullable_string(&mut out, None); // rack
        out.push(0); // broker tag buffer
        write_compact_nullable_string(&mut out, Some("cluster-x"));
        out.extend_from_slice(&3i32.to_be_bytes()); // controller id
        write_unsigned_varint(&mut out, 1); // empty topics compact array (len 0 -> varint 1)
        out.push(0); // trailing tag buffer
        out
    }

    #[test]
    fn rewrites_flexible_broker_address() {
        let frame = build_flexible_response(9, "real-broker.internal", 9092);
        let rewritten = rewrite_metadata_response(&frame, 9, "proxy.local", 19092).unwrap();

        let mut r = Reader::new(&rewritten);
        assert_eq!(r.i32().unwrap(), 9);
        r.empty_tag_buffer().unwrap();
        assert_eq!(r.i32().unwrap(), 0);
        assert_eq!(r.unsigned_varint().unwrap(), 2);
        assert_eq!(r.i32().unwrap(), 3);
        assert_eq!(r.compact_string().unwrap(), "proxy.local");
        assert_eq!(r.i32().unwrap(), 19092);
    }
}
