//! Response capture.
//!
//! [`CaptureBody`] forwards every frame of an origin body to the client
//! unchanged while mirroring data into a bounded buffer. When the stream ends,
//! fails or is dropped by the client, the mirrored bytes and the way the
//! stream finished are handed over a oneshot channel to whoever decides what
//! to cache.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use tokio::sync::oneshot;

use super::config::{CaptureMode, Route};

/// How a captured stream finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The origin body reached its end.
    Complete,
    /// The client went away before the end.
    Aborted,
    /// The origin body yielded an error.
    Errored,
    /// More than the capture limit was produced.
    Overflowed,
}

#[derive(Debug, Clone)]
pub struct Captured {
    pub bytes: Bytes,
    pub outcome: CaptureOutcome,
}

impl Captured {
    pub fn complete(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            outcome: CaptureOutcome::Complete,
        }
    }
}

pub struct CaptureBody {
    inner: Body,
    buffer: BytesMut,
    limit: usize,
    overflowed: bool,
    done: Option<oneshot::Sender<Captured>>,
}

impl CaptureBody {
    pub fn new(inner: Body, limit: usize) -> (Self, oneshot::Receiver<Captured>) {
        let (done, receiver) = oneshot::channel();
        let body = Self {
            inner,
            buffer: BytesMut::new(),
            limit,
            overflowed: false,
            done: Some(done),
        };
        (body, receiver)
    }

    fn mirror(&mut self, data: &Bytes) {
        if self.overflowed {
            return;
        }
        if self.buffer.len().saturating_add(data.len()) > self.limit {
            self.overflowed = true;
            self.buffer = BytesMut::new();
            return;
        }
        self.buffer.extend_from_slice(data);
    }

    fn finish(&mut self, outcome: CaptureOutcome) {
        let Some(done) = self.done.take() else {
            return;
        };
        let outcome = match outcome {
            CaptureOutcome::Errored => CaptureOutcome::Errored,
            _ if self.overflowed => CaptureOutcome::Overflowed,
            other => other,
        };
        // The receiver is gone when nobody wants the capture any more.
        let _ = done.send(Captured {
            bytes: self.buffer.split().freeze(),
            outcome,
        });
    }
}

impl HttpBody for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.mirror(data);
                }
                // Servers may stop polling once the body reports its end.
                if this.inner.is_end_stream() {
                    this.finish(CaptureOutcome::Complete);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish(CaptureOutcome::Errored);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish(CaptureOutcome::Complete);
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

impl Drop for CaptureBody {
    fn drop(&mut self) {
        let outcome = if self.inner.is_end_stream() {
            CaptureOutcome::Complete
        } else {
            CaptureOutcome::Aborted
        };
        self.finish(outcome);
    }
}

/// The text to store for a captured response, if it is cacheable.
///
/// Buffered routes keep the whole body, and only when the stream completed.
/// JSON bodies must parse. Streaming routes keep the last frame starting with
/// the route's terminal marker through the end of the capture, even when the
/// client disconnected after that frame arrived.
pub fn cacheable_payload(
    route: &Route,
    content_type: Option<&str>,
    captured: &Captured,
) -> Option<String> {
    match (route.capture, captured.outcome) {
        (_, CaptureOutcome::Errored | CaptureOutcome::Overflowed) => None,
        (CaptureMode::Buffered, CaptureOutcome::Complete) => {
            buffered_payload(content_type, &captured.bytes)
        }
        (CaptureMode::Buffered, CaptureOutcome::Aborted) => None,
        (CaptureMode::Streaming, _) => terminal_frame(&captured.bytes, &route.terminal_marker),
    }
}

fn buffered_payload(content_type: Option<&str>, bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    if is_json(content_type) && serde_json::from_str::<serde::de::IgnoredAny>(text).is_err() {
        return None;
    }
    Some(text.to_string())
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|value| {
        let essence = value.split(';').next().unwrap_or("").trim();
        essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json")
    })
}

/// Text from the last occurrence of `marker` to the end of `bytes`.
pub fn terminal_frame(bytes: &[u8], marker: &str) -> Option<String> {
    let needle = marker.as_bytes();
    if needle.is_empty() || bytes.len() < needle.len() {
        return None;
    }
    let start = bytes.windows(needle.len()).rposition(|w| w == needle)?;
    std::str::from_utf8(&bytes[start..])
        .ok()
        .map(str::to_string)
}
