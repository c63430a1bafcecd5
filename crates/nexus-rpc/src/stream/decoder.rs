//! Streaming value decoder
//!
//! [`decode`] reads the head line of a streaming body, rebuilds every root
//! value, and spawns a routing task that delivers each following chunk line
//! to the queue of its chunk index.
//!
//! Queues are created on first touch from either side: by the decoder when a
//! placeholder is read, or by the routing task when a chunk arrives first.
//! Each queue has exactly one reader ([`DeferredHandle`] or
//! [`SequenceReader`]). When the input ends, fails, or the decoder is
//! aborted, every open queue receives an interruption error.
//!
//! [`DecoderHandle::open_queues`] counts queues that have not been closed;
//! reaching zero is the drained signal.

use super::chunk::{
    ChunkBody, ChunkIndex, ChunkKind, ChunkRef, EncodedValue, RawChunk, StreamError, parse_head,
};
use super::jsonl::LineStream;
use crate::error::{ErrorShape, RpcError, RpcResult};
use crate::signal::CancellationSignal;
use crate::value::PathSegment;
use futures::future::BoxFuture;
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display};
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Message carried by interruption errors.
pub const STREAM_INTERRUPTED: &str = "Invalid response or stream interrupted";

/// The error every pending reader observes when the stream breaks.
pub fn stream_interrupted(cause: impl Display) -> RpcError {
    RpcError::internal(STREAM_INTERRUPTED).with_cause(cause.to_string())
}

/// Returns true for errors produced by [`stream_interrupted`].
pub fn is_stream_interrupted(error: &RpcError) -> bool {
    error.message == STREAM_INTERRUPTED
}

// =============================================================================
// Slot Table
// =============================================================================

#[derive(Debug)]
enum SlotMessage {
    Chunk(RawChunk),
    Interrupted(RpcError),
}

struct Slot {
    tx: mpsc::UnboundedSender<SlotMessage>,
    rx: Option<mpsc::UnboundedReceiver<SlotMessage>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct SlotTable {
    open: HashMap<ChunkIndex, Slot>,
    /// Receivers of queues that were interrupted before their reader arrived
    parked: HashMap<ChunkIndex, mpsc::UnboundedReceiver<SlotMessage>>,
    closed: HashSet<ChunkIndex>,
    interrupted: Option<RpcError>,
}

struct DecoderShared {
    table: Mutex<SlotTable>,
    open_count: watch::Sender<usize>,
    signal: CancellationSignal,
}

impl DecoderShared {
    fn new() -> Self {
        let (open_count, _) = watch::channel(0);
        Self {
            table: Mutex::new(SlotTable::default()),
            open_count,
            signal: CancellationSignal::new(),
        }
    }

    fn table(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_count(&self, table: &SlotTable) {
        self.open_count.send_replace(table.open.len());
    }

    /// Deliver a chunk to its queue, creating the queue if needed.
    fn route(&self, raw: RawChunk) {
        let index = raw.index();
        let mut table = self.table();
        if table.closed.contains(&index) {
            trace!(chunk_index = index, "Dropping chunk for closed queue");
            return;
        }
        let slot = table.open.entry(index).or_insert_with(Slot::new);
        if slot.tx.send(SlotMessage::Chunk(raw)).is_err() {
            trace!(chunk_index = index, "Queue reader is gone");
        }
        self.publish_count(&table);
    }

    /// Take the single receiver of a queue.
    fn take_receiver(&self, index: ChunkIndex) -> mpsc::UnboundedReceiver<SlotMessage> {
        let mut table = self.table();
        if let Some(rx) = table.parked.remove(&index) {
            return rx;
        }

        let refused = if table.closed.contains(&index) {
            Some(RpcError::internal(format!("Chunk {index} was already consumed")))
        } else {
            table.interrupted.clone()
        };
        if let Some(error) = refused {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(SlotMessage::Interrupted(error));
            return rx;
        }

        let slot = table.open.entry(index).or_insert_with(Slot::new);
        let rx = slot.rx.take();
        self.publish_count(&table);
        rx.unwrap_or_else(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(SlotMessage::Interrupted(RpcError::internal(format!(
                "Chunk {index} already has a reader"
            ))));
            rx
        })
    }

    fn close(&self, index: ChunkIndex) {
        let mut table = self.table();
        if table.open.remove(&index).is_some() {
            table.closed.insert(index);
            trace!(chunk_index = index, open = table.open.len(), "Queue closed");
            self.publish_count(&table);
        }
    }

    /// Force-close every open queue with `error`.
    fn interrupt(&self, error: RpcError) {
        let mut table = self.table();
        if table.interrupted.is_none() {
            table.interrupted = Some(error.clone());
        }
        let open = std::mem::take(&mut table.open);
        if !open.is_empty() {
            debug!(open = open.len(), cause = ?error.cause, "Interrupting open queues");
        }
        for (index, mut slot) in open {
            let _ = slot.tx.send(SlotMessage::Interrupted(error.clone()));
            if let Some(rx) = slot.rx.take() {
                table.parked.insert(index, rx);
            }
            table.closed.insert(index);
        }
        self.publish_count(&table);
    }

    fn reader(self: &Arc<Self>, index: ChunkIndex) -> SlotReader {
        SlotReader {
            index,
            rx: self.take_receiver(index),
            shared: Arc::clone(self),
            closed: false,
        }
    }

    fn handle_for(self: &Arc<Self>, chunk_ref: &ChunkRef) -> DecodedValue {
        let reader = self.reader(chunk_ref.index);
        match chunk_ref.kind {
            ChunkKind::Deferred => DecodedValue::Deferred(DeferredHandle { reader }),
            ChunkKind::Sequence => DecodedValue::Sequence(SequenceReader {
                reader,
                done: false,
            }),
        }
    }

    fn decode_encoded(self: &Arc<Self>, encoded: EncodedValue) -> DecodedValue {
        let EncodedValue { data, refs } = encoded;
        let Some(data) = data else {
            return DecodedValue::Undefined;
        };
        if refs.is_empty() {
            return DecodedValue::Json(data);
        }
        if let Some(root) = refs.iter().find(|r| r.key.is_none()) {
            return self.handle_for(root);
        }

        match data {
            Value::Object(map) => {
                let mut by_key: HashMap<&str, &ChunkRef> = refs
                    .iter()
                    .filter_map(|r| match &r.key {
                        Some(PathSegment::Key(k)) => Some((k.as_str(), r)),
                        _ => None,
                    })
                    .collect();
                let fields = map
                    .into_iter()
                    .map(|(key, value)| {
                        let decoded = match by_key.remove(key.as_str()) {
                            Some(r) => self.handle_for(r),
                            None => DecodedValue::Json(value),
                        };
                        (key, decoded)
                    })
                    .collect();
                DecodedValue::Object(fields)
            }
            Value::Array(items) => {
                let mut by_index: HashMap<usize, &ChunkRef> = refs
                    .iter()
                    .filter_map(|r| match &r.key {
                        Some(PathSegment::Index(i)) => Some((*i, r)),
                        _ => None,
                    })
                    .collect();
                let items = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| match by_index.remove(&i) {
                        Some(r) => self.handle_for(r),
                        None => DecodedValue::Json(value),
                    })
                    .collect();
                DecodedValue::Array(items)
            }
            other => {
                warn!("Chunk refs attached to a non-container value; ignoring refs");
                DecodedValue::Json(other)
            }
        }
    }
}

struct SlotReader {
    index: ChunkIndex,
    rx: mpsc::UnboundedReceiver<SlotMessage>,
    shared: Arc<DecoderShared>,
    closed: bool,
}

impl SlotReader {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.close(self.index);
        }
    }

    fn poll_message(&mut self, cx: &mut Context<'_>) -> Poll<SlotMessage> {
        self.rx.poll_recv(cx).map(|message| {
            message.unwrap_or_else(|| SlotMessage::Interrupted(stream_interrupted("queue closed")))
        })
    }
}

impl Drop for SlotReader {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Readers
// =============================================================================

/// A reconstructed deferred value. Await it (or call [`resolve`](Self::resolve)).
pub struct DeferredHandle {
    reader: SlotReader,
}

impl DeferredHandle {
    pub fn index(&self) -> ChunkIndex {
        self.reader.index
    }

    pub async fn resolve(mut self) -> RpcResult<DecodedValue> {
        let message = std::future::poll_fn(|cx| self.reader.poll_message(cx)).await;
        let outcome = match message {
            SlotMessage::Chunk(raw) => match raw.interpret(ChunkKind::Deferred) {
                Ok(ChunkBody::Fulfilled(encoded)) => Ok(self.reader.shared.decode_encoded(encoded)),
                Ok(ChunkBody::Rejected(payload)) => Err(ErrorShape::error_from_value(payload)),
                Ok(other) => Err(stream_interrupted(format!(
                    "unexpected chunk for deferred value: {other:?}"
                ))),
                Err(e) => Err(stream_interrupted(e)),
            },
            SlotMessage::Interrupted(error) => Err(error),
        };
        // Nested queues are open by now, so the count never dips to zero.
        self.reader.close();
        outcome
    }
}

impl IntoFuture for DeferredHandle {
    type Output = RpcResult<DecodedValue>;
    type IntoFuture = BoxFuture<'static, RpcResult<DecodedValue>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.resolve())
    }
}

impl fmt::Debug for DeferredHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredHandle")
            .field("index", &self.reader.index)
            .finish()
    }
}

/// A reconstructed lazy sequence.
///
/// Ends after a return chunk; yields one `Err` and ends after an error chunk
/// or an interruption. Dropping the reader closes its queue.
pub struct SequenceReader {
    reader: SlotReader,
    done: bool,
}

impl SequenceReader {
    pub fn index(&self) -> ChunkIndex {
        self.reader.index
    }

    fn finish(&mut self) {
        self.done = true;
        self.reader.close();
    }
}

impl Stream for SequenceReader {
    type Item = RpcResult<DecodedValue>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        let message = match this.reader.poll_message(cx) {
            Poll::Ready(message) => message,
            Poll::Pending => return Poll::Pending,
        };
        let raw = match message {
            SlotMessage::Chunk(raw) => raw,
            SlotMessage::Interrupted(error) => {
                this.finish();
                return Poll::Ready(Some(Err(error)));
            }
        };
        let item = match raw.interpret(ChunkKind::Sequence) {
            Ok(ChunkBody::Yield(encoded)) => {
                return Poll::Ready(Some(Ok(this.reader.shared.decode_encoded(encoded))));
            }
            Ok(ChunkBody::Return(_)) => None,
            Ok(ChunkBody::Error(payload)) => Some(Err(ErrorShape::error_from_value(payload))),
            Ok(other) => Some(Err(stream_interrupted(format!(
                "unexpected chunk for sequence: {other:?}"
            )))),
            Err(e) => Some(Err(stream_interrupted(e))),
        };
        this.finish();
        Poll::Ready(item)
    }
}

impl fmt::Debug for SequenceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceReader")
            .field("index", &self.reader.index)
            .field("done", &self.done)
            .finish()
    }
}

// =============================================================================
// Decoded Values
// =============================================================================

/// A reconstructed result tree.
#[derive(Debug)]
pub enum DecodedValue {
    Undefined,
    Json(Value),
    Object(Vec<(String, DecodedValue)>),
    Array(Vec<DecodedValue>),
    Deferred(DeferredHandle),
    Sequence(SequenceReader),
}

impl DecodedValue {
    /// Await every deferred value and drain every sequence into a JSON tree.
    pub fn resolve_all(self) -> BoxFuture<'static, RpcResult<Value>> {
        Box::pin(async move {
            match self {
                Self::Undefined => Ok(Value::Null),
                Self::Json(v) => Ok(v),
                Self::Object(fields) => {
                    let mut map = serde_json::Map::new();
                    for (key, value) in fields {
                        map.insert(key, value.resolve_all().await?);
                    }
                    Ok(Value::Object(map))
                }
                Self::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(item.resolve_all().await?);
                    }
                    Ok(Value::Array(out))
                }
                Self::Deferred(handle) => handle.resolve().await?.resolve_all().await,
                Self::Sequence(mut reader) => {
                    let mut out = Vec::new();
                    while let Some(item) = reader.next().await {
                        out.push(item?.resolve_all().await?);
                    }
                    Ok(Value::Array(out))
                }
            }
        })
    }

    pub fn into_deferred(self) -> Option<DeferredHandle> {
        match self {
            Self::Deferred(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_sequence(self) -> Option<SequenceReader> {
        match self {
            Self::Sequence(reader) => Some(reader),
            _ => None,
        }
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Control surface of a running decode.
#[derive(Clone)]
pub struct DecoderHandle {
    shared: Arc<DecoderShared>,
}

impl DecoderHandle {
    /// Interrupt every open queue and stop reading the input.
    pub fn abort(&self) {
        self.shared.interrupt(stream_interrupted("decoder aborted"));
        self.shared.signal.cancel();
    }

    /// Number of queues not yet closed.
    pub fn open_queues(&self) -> usize {
        *self.shared.open_count.borrow()
    }

    pub fn is_drained(&self) -> bool {
        self.open_queues() == 0
    }

    /// Wait until every queue is closed.
    pub async fn wait_drained(&self) {
        let mut rx = self.shared.open_count.subscribe();
        let _ = rx.wait_for(|open| *open == 0).await;
    }
}

impl fmt::Debug for DecoderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderHandle")
            .field("open_queues", &self.open_queues())
            .finish()
    }
}

/// Output of [`decode`].
#[derive(Debug)]
pub struct Decoded {
    pub values: BTreeMap<String, DecodedValue>,
    pub handle: DecoderHandle,
}

/// Decode a streaming body.
///
/// Resolves once the head has been read; chunk routing continues on a
/// spawned task.
///
/// # Errors
///
/// Fails with an interruption error if the input ends or breaks before a
/// well-formed head arrives.
pub async fn decode<S, B, E>(input: S) -> RpcResult<Decoded>
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut lines = LineStream::new(input);
    let head_line = match lines.next().await {
        Some(Ok(line)) => line,
        Some(Err(e)) => return Err(stream_interrupted(e)),
        None => return Err(stream_interrupted(StreamError::MissingHead)),
    };
    let head = parse_head(&head_line).map_err(stream_interrupted)?;

    let shared = Arc::new(DecoderShared::new());
    let values: BTreeMap<String, DecodedValue> = head
        .into_iter()
        .map(|(key, encoded)| (key, shared.decode_encoded(encoded)))
        .collect();
    trace!(
        roots = values.len(),
        open = *shared.open_count.borrow(),
        "Decoded head"
    );

    let router = Arc::clone(&shared);
    tokio::spawn(async move {
        let signal = router.signal.clone();
        let cause = loop {
            tokio::select! {
                _ = signal.cancelled() => break StreamError::Transport("aborted".to_string()),
                line = lines.next() => match line {
                    Some(Ok(line)) => match RawChunk::parse(&line) {
                        Ok(raw) => router.route(raw),
                        Err(e) => {
                            warn!(error = %e, "Unparseable chunk line");
                            break e;
                        }
                    },
                    Some(Err(e)) => break e,
                    None => break StreamError::Transport("stream ended".to_string()),
                },
            }
        };
        router.interrupt(stream_interrupted(cause));
    });

    Ok(Decoded {
        values,
        handle: DecoderHandle { shared },
    })
}
