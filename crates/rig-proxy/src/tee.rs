//! Streams a body through unchanged while tee'ing a capped copy into the
//! side for observability (spec §4.8, §5's "no unbounded buffers anywhere
//! on the hot path"). A chunked upload, SSE stream, or long poll is
//! forwarded as it arrives instead of waiting for the body to end, which
//! a `.collect().await` would do.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use hyper::HeaderMap;

use crate::event::CappedBuffer;

/// Wraps an inner body, pushing every data frame into a [`CappedBuffer`]
/// as it passes through. `on_end` fires exactly once, with the finished
/// buffer and any trailers seen, when the inner body ends (cleanly or
/// with an error).
pub struct TeeBody<B> {
    inner: B,
    tee: CappedBuffer,
    trailers: Option<HeaderMap>,
    on_end: Option<Box<dyn FnOnce(CappedBuffer, Option<HeaderMap>) + Send>>,
}

impl<B> TeeBody<B> {
    pub fn new(inner: B, cap: usize, on_end: impl FnOnce(CappedBuffer, Option<HeaderMap>) + Send + 'static) -> Self {
        Self {
            inner,
            tee: CappedBuffer::new(cap),
            trailers: None,
            on_end: Some(Box::new(on_end)),
        }
    }

    fn finish(&mut self) {
        if let Some(on_end) = self.on_end.take() {
            on_end(std::mem::take(&mut self.tee), self.trailers.take());
        }
    }
}

impl<B> Drop for TeeBody<B> {
    /// Fires `on_end` even if the body is dropped mid-stream (client
    /// disconnect, upstream reset) instead of driven to a clean end, so a
    /// waiter on the other side of `on_end` never hangs forever.
    fn drop(&mut self) {
        self.finish();
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.tee.push(data);
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.trailers = Some(trailers.clone());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    #[tokio::test]
    async fn forwards_bytes_unchanged_and_reports_tee_on_end() {
        let inner = Full::new(Bytes::from_static(b"hello world"));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tee = TeeBody::new(inner, 1024, move |buf, trailers| {
            let _ = tx.send((buf.into_parts(), trailers));
        });

        let collected = tee.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello world"));

        let ((bytes, truncated, total), trailers) = rx.await.unwrap();
        assert_eq!(bytes, b"hello world");
        assert!(!truncated);
        assert_eq!(total, 11);
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn caps_the_tee_without_truncating_the_forwarded_bytes() {
        let inner = Full::new(Bytes::from_static(b"hello world"));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tee = TeeBody::new(inner, 4, move |buf, trailers| {
            let _ = tx.send((buf.into_parts(), trailers));
        });

        let collected = tee.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello world"), "forwarded copy must stay whole");

        let ((bytes, truncated, total), _) = rx.await.unwrap();
        assert_eq!(bytes, b"hell");
        assert!(truncated);
        assert_eq!(total, 11);
    }
}
