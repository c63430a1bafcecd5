//! Server-sent-events framing for lazy sequences
//!
//! The producer turns one [`LazySequence`] into SSE frames:
//!
//! ```text
//! : connected
//!
//! id: 3
//! data: {"n":3}
//!
//! event: ping
//! data:
//!
//! event: serialized-error
//! data: {"code":-32603,"message":"...","data":{...}}
//! ```
//!
//! Elements are fully resolved before they are written, so each `data:`
//! line is plain JSON. The consumer parses frames back into [`SseEvent`]s.
//!
//! With a reconnect hint configured, the opening comment is replaced by a
//! `connected` event carrying `{"reconnectAfterInactivityMs": n}`.

use crate::config::SseConfig;
use crate::error::{ErrorConfig, ErrorShape, RpcError, RpcResult};
use crate::value::{LazySequence, StreamValue};
use futures::FutureExt;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use tokio::time::Instant;
use tracing::{debug, trace};

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_PING: &str = "ping";
pub const EVENT_RETURN: &str = "return";
pub const EVENT_ERROR: &str = "serialized-error";

fn frame(event: Option<&str>, id: Option<&str>, data: &str) -> String {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    if let Some(id) = id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

fn error_frame(error: &RpcError, errors: &ErrorConfig) -> String {
    let payload = ErrorShape::to_value(error, errors).to_string();
    frame(Some(EVENT_ERROR), None, &payload)
}

fn connected_frame(config: &SseConfig) -> String {
    match config.reconnect_after_inactivity {
        Some(after) => {
            let hint = serde_json::json!({
                "reconnectAfterInactivityMs": u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
            });
            frame(Some(EVENT_CONNECTED), None, &hint.to_string())
        }
        None => ": connected\n\n".to_string(),
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum Step {
    Item(Option<RpcResult<StreamValue>>),
    Idle,
    Expired,
}

/// Write a lazy sequence as server-sent events.
pub fn sse_stream(
    sequence: LazySequence,
    config: SseConfig,
    errors: ErrorConfig,
) -> impl Stream<Item = String> + Send + 'static {
    async_stream::stream! {
        let mut sequence = sequence;
        let deadline = config.max_duration.map(|d| Instant::now() + d);
        if config.emit_connected_comment {
            yield connected_frame(&config);
        }

        let mut emitted = false;
        loop {
            let step = if emitted && config.emit_and_end_immediately {
                match sequence.next().now_or_never() {
                    Some(item) => Step::Item(item),
                    None => {
                        debug!("SSE emitted available elements; ending for reconnect");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    item = sequence.next() => Step::Item(item),
                    _ = tokio::time::sleep(config.ping_interval) => Step::Idle,
                    _ = until(deadline) => Step::Expired,
                }
            };
            let item = match step {
                Step::Item(item) => item,
                Step::Idle => {
                    trace!("SSE idle; writing ping");
                    yield frame(Some(EVENT_PING), None, "");
                    continue;
                }
                Step::Expired => {
                    debug!("SSE reached its maximum duration");
                    yield frame(Some(EVENT_RETURN), None, "");
                    break;
                }
            };
            match item {
                Some(Ok(value)) => {
                    let (id, data) = match value {
                        StreamValue::Tracked(t) => (Some(t.id), *t.data),
                        other => (None, other),
                    };
                    match data.resolve_all().await {
                        Ok(json) => {
                            emitted = true;
                            yield frame(None, id.as_deref(), &json.to_string());
                        }
                        Err(error) => {
                            yield error_frame(&error, &errors);
                            break;
                        }
                    }
                }
                Some(Err(error)) => {
                    debug!(code = %error.code, "SSE sequence failed");
                    yield error_frame(&error, &errors);
                    break;
                }
                None => {
                    yield frame(Some(EVENT_RETURN), None, "");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// One raw frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: Option<String>,
    pub comment: Option<String>,
}

/// Incremental frame parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current: SseFrame,
    last_event_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of the last frame that carried one.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Feed text and collect every frame it completes.
    pub fn feed(&mut self, text: &str) -> Vec<SseFrame> {
        self.buffer.push_str(text);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                let done = std::mem::take(&mut self.current);
                if done != SseFrame::default() {
                    if let Some(id) = &done.id {
                        self.last_event_id = Some(id.clone());
                    }
                    frames.push(done);
                }
                continue;
            }
            self.push_line(line);
        }
        frames
    }

    fn push_line(&mut self, line: &str) {
        if let Some(comment) = line.strip_prefix(':') {
            self.current.comment = Some(comment.trim_start().to_string());
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            "data" => match &mut self.current.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.current.data = Some(value.to_string()),
            },
            other => trace!(field = other, "Ignoring unknown SSE field"),
        }
    }
}

/// A decoded server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Stream opened, with the server's reconnect hint if it sent one
    Connected {
        reconnect_after_inactivity_ms: Option<u64>,
    },
    Data { id: Option<String>, data: Value },
    Ping,
    Return,
}

impl SseEvent {
    fn from_frame(frame: SseFrame) -> Option<RpcResult<Self>> {
        match frame.event.as_deref() {
            Some(EVENT_CONNECTED) => {
                let hint = frame
                    .data
                    .and_then(|data| serde_json::from_str::<Value>(&data).ok())
                    .and_then(|v| v.get("reconnectAfterInactivityMs").and_then(Value::as_u64));
                Some(Ok(Self::Connected {
                    reconnect_after_inactivity_ms: hint,
                }))
            }
            Some(EVENT_PING) => Some(Ok(Self::Ping)),
            Some(EVENT_RETURN) => Some(Ok(Self::Return)),
            Some(EVENT_ERROR) => {
                let payload = frame.data.unwrap_or_default();
                Some(Err(match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => ErrorShape::error_from_value(value),
                    Err(e) => RpcError::parse_error(format!("Malformed error event: {e}")),
                }))
            }
            Some(_) | None => match frame.data {
                Some(data) => Some(
                    serde_json::from_str(&data)
                        .map(|data| Self::Data { id: frame.id, data })
                        .map_err(RpcError::from),
                ),
                None if frame.comment.as_deref() == Some("connected") => Some(Ok(Self::Connected {
                    reconnect_after_inactivity_ms: None,
                })),
                None => None,
            },
        }
    }
}

/// Parse a byte stream of server-sent events.
///
/// A server error event is yielded as `Err` and ends the stream, as does a
/// transport failure.
pub fn sse_events<S, B, E>(input: S) -> impl Stream<Item = RpcResult<SseEvent>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut input = input;
        let mut parser = SseParser::new();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = input.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(crate::stream::decoder::stream_interrupted(e));
                    return;
                }
            };
            pending.extend_from_slice(bytes.as_ref());
            // keep an incomplete utf-8 tail for the next read
            let valid = match std::str::from_utf8(&pending) {
                Ok(_) => pending.len(),
                Err(e) if e.error_len().is_none() => e.valid_up_to(),
                Err(_) => {
                    yield Err(RpcError::parse_error("Invalid utf-8 in event stream"));
                    return;
                }
            };
            let text: Vec<u8> = pending.drain(..valid).collect();
            let text = String::from_utf8_lossy(&text).into_owned();
            for frame in parser.feed(&text) {
                match SseEvent::from_frame(frame) {
                    Some(Ok(event)) => yield Ok(event),
                    Some(Err(error)) => {
                        yield Err(error);
                        return;
                    }
                    None => {}
                }
            }
        }
    }
}
