//! Line-delimited JSON framing
//!
//! The streaming body is one JSON document per line: the head first, then
//! one chunk per line. [`LineStream`] splits an arbitrary byte stream back
//! into lines, buffering partial lines across reads. Blank lines carry no
//! data; producers use them as keep-alive pings.

use super::chunk::StreamError;
use super::encoder::Encoded;
use crate::config::JsonlConfig;
use crate::error::{RpcError, RpcResult};
use futures::stream::{Stream, StreamExt};
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{trace, warn};

/// Keep-alive line written while no chunk is ready.
pub const PING_LINE: &str = " \n";

/// Serialize an encoding into newline-terminated lines.
///
/// The head line is produced before any chunk is pulled.
pub fn to_jsonl(encoded: Encoded) -> impl Stream<Item = RpcResult<String>> + Send + 'static {
    to_jsonl_with(encoded, JsonlConfig::default())
}

/// [`to_jsonl`] with idle pings between chunk lines.
pub fn to_jsonl_with(
    encoded: Encoded,
    config: JsonlConfig,
) -> impl Stream<Item = RpcResult<String>> + Send + 'static {
    let Encoded { head, mut chunks } = encoded;
    async_stream::try_stream! {
        let mut line = serde_json::to_string(&head).map_err(RpcError::from)?;
        line.push('\n');
        yield line;

        loop {
            let next = match config.ping_interval {
                Some(interval) => tokio::select! {
                    chunk = chunks.next() => Some(chunk),
                    _ = tokio::time::sleep(interval) => None,
                },
                None => Some(chunks.next().await),
            };
            let chunk = match next {
                Some(Some(chunk)) => chunk,
                Some(None) => break,
                None => {
                    trace!("Body idle; writing ping line");
                    yield PING_LINE.to_string();
                    continue;
                }
            };
            let mut line = chunk.to_line()?;
            trace!(chunk_index = chunk.index, bytes = line.len(), "Writing chunk line");
            line.push('\n');
            yield line;
        }
    }
}

/// Splits a byte stream into text lines.
///
/// Empty lines are skipped. A trailing line without a newline is still
/// yielded when the input ends.
pub struct LineStream<S> {
    inner: S,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no newline
    scanned: usize,
    done: bool,
}

impl<S> LineStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            scanned: 0,
            done: false,
        }
    }

    fn take_line(&mut self) -> Option<Result<String, StreamError>> {
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = self.buffer.len();
                return None;
            };
            let pos = self.scanned + offset;
            self.scanned = 0;
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(String::from_utf8(line).map_err(|_| StreamError::InvalidUtf8));
        }
    }

    fn take_rest(&mut self) -> Option<Result<String, StreamError>> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buffer);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(String::from_utf8(rest).map_err(|_| StreamError::InvalidUtf8))
    }
}

impl<S, B, E> Stream for LineStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    type Item = Result<String, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(line) = this.take_line() {
                return Poll::Ready(Some(line));
            }
            if this.done {
                return Poll::Ready(this.take_rest());
            }
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.buffer.extend_from_slice(bytes.as_ref()),
                Poll::Ready(Some(Err(e))) => {
                    warn!(error = %e, "Transport failed while reading lines");
                    this.done = true;
                    this.buffer.clear();
                    this.scanned = 0;
                    return Poll::Ready(Some(Err(StreamError::Transport(e.to_string()))));
                }
                Poll::Ready(None) => this.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
