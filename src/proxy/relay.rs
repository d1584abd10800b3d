// Response relay - copies upstream responses back to the caller

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt::Display;

use super::error::AttemptError;
use super::usage::UsageAccumulator;

/// Longest line buffered while looking for a newline. Longer lines are
/// flushed through unparsed.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    HeaderName::from_static("keep-alive"),
];

/// How a committed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(String),
    /// The caller went away before the upstream finished.
    Cancelled,
}

/// Called exactly once when a committed stream ends, however it ends.
pub type StreamFinisher = Box<dyn FnOnce(UsageAccumulator, StreamOutcome) + Send + 'static>;

/// Turn an upstream status >= 400 into an attempt error, reading the body
/// for the message.
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AttemptError> {
    let status = response.status();
    if status.as_u16() < 400 {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AttemptError::Upstream {
        status: status.as_u16(),
        body,
    })
}

/// Whether the upstream labelled its body `text/event-stream`.
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("text/event-stream"))
}

fn copy_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers
}

/// Read the whole upstream body, then build the caller's response.
pub async fn relay_buffered(
    response: reqwest::Response,
) -> Result<(Response, UsageAccumulator), AttemptError> {
    let status = response.status();
    let headers = copy_headers(response.headers());
    let body = response.bytes().await.map_err(AttemptError::Read)?;

    let mut usage = UsageAccumulator::default();
    usage.observe_body(&body);

    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    Ok((out, usage))
}

/// An upstream stream whose first chunk has already arrived.
pub struct PeekedStream<E> {
    pub status: StatusCode,
    first: Option<Bytes>,
    rest: BoxStream<'static, Result<Bytes, E>>,
}

/// Wait for the first chunk of a streaming response. A failure here is still
/// an attempt failure; nothing has been sent to the caller yet.
pub async fn open_stream(
    response: reqwest::Response,
) -> Result<PeekedStream<reqwest::Error>, AttemptError> {
    let status = response.status();
    peek(status, response.bytes_stream())
        .await
        .map_err(AttemptError::Read)
}

pub async fn peek<S, E>(status: StatusCode, stream: S) -> Result<PeekedStream<E>, E>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
{
    let mut rest = stream.boxed();
    let first = match rest.next().await {
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(e)) => return Err(e),
        None => None,
    };
    Ok(PeekedStream { status, first, rest })
}

/// Splits a byte stream into `\n`-terminated lines without altering bytes.
#[derive(Debug)]
pub struct LineSplitter {
    buffer: BytesMut,
    /// Bytes of `buffer` already known to hold no newline.
    scanned: usize,
    max_line: usize,
}

impl LineSplitter {
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_line,
        }
    }

    /// Feed a chunk; returns every line completed by it, newline included.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            lines.push(self.buffer.split_to(self.scanned + pos + 1).freeze());
            self.scanned = 0;
        }
        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_line {
            lines.push(self.buffer.split().freeze());
            self.scanned = 0;
        }
        lines
    }

    /// Whatever is left after the upstream closed without a final newline.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scanned = 0;
        (!self.buffer.is_empty()).then(|| self.buffer.split().freeze())
    }
}

struct StreamGuard {
    usage: UsageAccumulator,
    finisher: Option<StreamFinisher>,
}

impl StreamGuard {
    fn new(finisher: StreamFinisher) -> Self {
        Self {
            usage: UsageAccumulator::default(),
            finisher: Some(finisher),
        }
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        if let Some(finisher) = self.finisher.take() {
            finisher(std::mem::take(&mut self.usage), outcome);
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.finish(StreamOutcome::Cancelled);
    }
}

/// Relay a committed stream line by line, watching `data:` lines for usage.
/// `finisher` receives the totals once the stream ends.
pub fn relay_stream<E>(peeked: PeekedStream<E>, max_line: usize, finisher: StreamFinisher) -> Response
where
    E: Display + Send + 'static,
{
    let PeekedStream {
        status,
        first,
        mut rest,
    } = peeked;

    // Owned by the body from the start, so a body dropped before its first
    // poll still reports the request as cancelled.
    let guard = StreamGuard::new(finisher);

    let body = async_stream::stream! {
        let mut guard = guard;
        let mut lines = LineSplitter::new(max_line);

        if let Some(first) = first {
            for line in lines.push(&first) {
                guard.usage.observe_line(&line);
                yield Ok::<Bytes, std::io::Error>(line);
            }
        }

        while let Some(chunk) = rest.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in lines.push(&bytes) {
                        guard.usage.observe_line(&line);
                        yield Ok(line);
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!("[Relay] Upstream stream failed: {}", message);
                    guard.finish(StreamOutcome::Failed(message.clone()));
                    yield Err(std::io::Error::other(message));
                    return;
                }
            }
        }

        if let Some(tail) = lines.finish() {
            guard.usage.observe_line(&tail);
            yield Ok(tail);
        }
        guard.finish(StreamOutcome::Completed);
    };

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}
