//! Internal observation events a forwarder emits; the orchestrator
//! converts these into event-log entries (spec §4.8's "unified emission").

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum ProxyEvent {
    ConnectionOpened,
    ConnectionClosed {
        bytes_in: u64,
        bytes_out: u64,
        duration_ms: u64,
    },
    RequestCompleted {
        method: String,
        path: String,
        status: u16,
        latency_ms: u64,
        request_headers: HashMap<String, String>,
        response_headers: HashMap<String, String>,
        request_body: Vec<u8>,
        response_body: Vec<u8>,
        request_body_truncated: bool,
        response_body_truncated: bool,
        request_size: usize,
        response_size: usize,
    },
    GrpcCallCompleted {
        service: String,
        method: String,
        grpc_status: String,
        grpc_message: Option<String>,
        request_body_decoded: Option<serde_json::Value>,
        response_body_decoded: Option<serde_json::Value>,
        latency_ms: u64,
    },
}

/// Caps a tee'd body at `limit` bytes, truncating rather than growing
/// further, while still tracking the true total size (spec §4.8).
#[derive(Debug, Default)]
pub struct CappedBuffer {
    buf: Vec<u8>,
    limit: usize,
    total_size: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            total_size: 0,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total_size += chunk.len();
        if self.buf.len() < self.limit {
            let take = (self.limit - self.buf.len()).min(chunk.len());
            self.buf.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                self.truncated = true;
            }
        } else if !chunk.is_empty() {
            self.truncated = true;
        }
    }

    pub fn into_parts(self) -> (Vec<u8>, bool, usize) {
        (self.buf, self.truncated, self.total_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_true_size_past_the_cap() {
        let mut buf = CappedBuffer::new(4);
        buf.push(b"hello world");
        let (bytes, truncated, total) = buf.into_parts();
        assert_eq!(bytes, b"hell");
        assert!(truncated);
        assert_eq!(total, 11);
    }

    #[test]
    fn untruncated_when_under_the_cap() {
        let mut buf = CappedBuffer::new(1024);
        buf.push(b"small");
        let (bytes, truncated, total) = buf.into_parts();
        assert_eq!(bytes, b"small");
        assert!(!truncated);
        assert_eq!(total, 5);
    }
}
