//! Streaming value encoder
//!
//! [`encode`] snapshots a set of root values into a [`Head`] and returns a
//! stream of [`Chunk`]s for every deferred value and lazy sequence found.
//!
//! The walk is one level deep: a root's own fields are inspected, but nested
//! values are only encoded once the async value holding them produces them.
//! A field that is a plain container with async values somewhere inside is
//! treated as an already-resolved deferred value, so its contents are
//! encoded one level at a time like everything else.
//!
//! Every registered value becomes one source of a [`Merger`], so chunks come
//! out in completion order.

use super::chunk::{Chunk, ChunkBody, ChunkIndex, ChunkKind, ChunkRef, EncodedValue, Head, PLACEHOLDER};
use super::merge::{Merger, MergerHandle};
use crate::config::RpcConfig;
use crate::error::{ErrorConfig, ErrorShape, RpcError};
use crate::value::{Deferred, PathSegment, StreamValue, dotted_path};
use futures::FutureExt;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace};

/// Callback invoked for every deferred rejection or sequence failure, with
/// the path of the failing value.
pub type ErrorCallback = Arc<dyn Fn(&RpcError, &[PathSegment]) + Send + Sync>;

/// Encoder settings.
#[derive(Clone, Default)]
pub struct EncoderOptions {
    /// Deepest path at which an async value may be registered
    pub max_depth: Option<usize>,
    pub on_error: Option<ErrorCallback>,
    /// Formatting applied to errors written into chunks
    pub errors: ErrorConfig,
}

impl EncoderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options derived from the core configuration.
    pub fn from_config(config: &RpcConfig) -> Self {
        Self {
            max_depth: config.stream.max_depth,
            on_error: None,
            errors: config.errors.clone(),
        }
    }

    #[must_use = "This method returns a new EncoderOptions and does not modify self"]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    #[must_use = "This method returns a new EncoderOptions and does not modify self"]
    pub fn with_on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RpcError, &[PathSegment]) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    #[must_use = "This method returns a new EncoderOptions and does not modify self"]
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }
}

impl fmt::Debug for EncoderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderOptions")
            .field("max_depth", &self.max_depth)
            .field("on_error", &self.on_error.is_some())
            .field("errors", &self.errors)
            .finish()
    }
}

/// Output of [`encode`].
pub struct Encoded {
    pub head: Head,
    pub chunks: BoxStream<'static, Chunk>,
}

impl fmt::Debug for Encoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoded")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Encode root values into a head plus a live chunk stream.
///
/// # Example
/// ```rust,ignore
/// let Encoded { head, chunks } = encode(
///     [("0".to_string(), StreamValue::deferred(async { Ok(json!(1).into()) }))],
///     EncoderOptions::new(),
/// );
/// ```
pub fn encode<I>(roots: I, options: EncoderOptions) -> Encoded
where
    I: IntoIterator<Item = (String, StreamValue)>,
{
    let merger = Merger::<Chunk, Infallible>::new();
    let state = Arc::new(EncoderState {
        next_index: AtomicU64::new(0),
        sources: merger.handle(),
        options,
    });

    let head: Head = roots
        .into_iter()
        .map(|(key, value)| {
            let path = [PathSegment::Key(key.clone())];
            let encoded = state.encode_value(value, &path);
            (key, encoded)
        })
        .collect();
    trace!(
        roots = head.len(),
        registered = state.next_index.load(Ordering::SeqCst),
        "Encoded head"
    );

    let chunks = match merger.stream() {
        Ok(merged) => merged
            .map(|item| match item {
                Ok(chunk) => chunk,
                Err(never) => match never {},
            })
            .boxed(),
        Err(e) => {
            error!(error = %e, "Fresh merger refused iteration");
            stream::empty().boxed()
        }
    };

    Encoded { head, chunks }
}

struct EncoderState {
    next_index: AtomicU64,
    sources: MergerHandle<Chunk, Infallible>,
    options: EncoderOptions,
}

enum Field {
    Plain(Value),
    Async(ChunkKind, ChunkIndex),
}

impl EncoderState {
    fn encode_value(self: &Arc<Self>, value: StreamValue, path: &[PathSegment]) -> EncodedValue {
        match value {
            StreamValue::Undefined => EncodedValue::undefined(),
            StreamValue::Json(v) => EncodedValue::plain(v),
            StreamValue::Tracked(t) => self.encode_value(
                StreamValue::Array(vec![StreamValue::Json(Value::String(t.id)), *t.data]),
                path,
            ),
            value @ (StreamValue::Deferred(_) | StreamValue::Sequence(_)) => {
                let (kind, index) = self.register(value, path.to_vec());
                EncodedValue {
                    data: Some(Value::from(PLACEHOLDER)),
                    refs: vec![ChunkRef {
                        key: None,
                        kind,
                        index,
                    }],
                }
            }
            StreamValue::Object(fields) => {
                let mut map = serde_json::Map::new();
                let mut refs = Vec::new();
                for (key, field) in fields {
                    if matches!(field, StreamValue::Undefined) {
                        continue;
                    }
                    let segment = PathSegment::Key(key.clone());
                    match self.encode_field(field, path, segment.clone()) {
                        Field::Plain(v) => {
                            map.insert(key, v);
                        }
                        Field::Async(kind, index) => {
                            map.insert(key, Value::from(PLACEHOLDER));
                            refs.push(ChunkRef {
                                key: Some(segment),
                                kind,
                                index,
                            });
                        }
                    }
                }
                EncodedValue {
                    data: Some(Value::Object(map)),
                    refs,
                }
            }
            StreamValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut refs = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    let segment = PathSegment::Index(i);
                    match self.encode_field(item, path, segment.clone()) {
                        Field::Plain(v) => out.push(v),
                        Field::Async(kind, index) => {
                            out.push(Value::from(PLACEHOLDER));
                            refs.push(ChunkRef {
                                key: Some(segment),
                                kind,
                                index,
                            });
                        }
                    }
                }
                EncodedValue {
                    data: Some(Value::Array(out)),
                    refs,
                }
            }
        }
    }

    fn encode_field(
        self: &Arc<Self>,
        field: StreamValue,
        parent: &[PathSegment],
        segment: PathSegment,
    ) -> Field {
        let mut path = parent.to_vec();
        path.push(segment);
        if field.is_async() {
            let (kind, index) = self.register(field, path);
            Field::Async(kind, index)
        } else if field.contains_async() {
            let hoisted = StreamValue::Deferred(Deferred::ready(field));
            let (kind, index) = self.register(hoisted, path);
            Field::Async(kind, index)
        } else {
            Field::Plain(field.to_plain_json().unwrap_or(Value::Null))
        }
    }

    /// Allocate an index for an async value and start its source.
    fn register(self: &Arc<Self>, value: StreamValue, path: Vec<PathSegment>) -> (ChunkKind, ChunkIndex) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let kind = match value {
            StreamValue::Sequence(_) => ChunkKind::Sequence,
            _ => ChunkKind::Deferred,
        };

        if self.options.max_depth.is_some_and(|max| path.len() > max) {
            let error = RpcError::internal(format!(
                "Max depth reached at path: {}",
                dotted_path(&path)
            ));
            debug!(chunk_index = index, path = %dotted_path(&path), "Rejecting over-depth value");
            let payload = self.report(&error, &path);
            let body = match kind {
                ChunkKind::Deferred => ChunkBody::Rejected(payload),
                ChunkKind::Sequence => ChunkBody::Error(payload),
            };
            if let StreamValue::Deferred(deferred) = value {
                self.watch_detached(deferred, path);
            }
            self.sources
                .add(stream::once(async move { Ok(Chunk { index, body }) }));
            return (kind, index);
        }

        trace!(chunk_index = index, ?kind, path = %dotted_path(&path), "Registering async value");
        let state = Arc::clone(self);
        match value {
            StreamValue::Deferred(deferred) => {
                self.sources.add(stream::once(async move {
                    let body = match AssertUnwindSafe(deferred).catch_unwind().await {
                        Ok(Ok(value)) => ChunkBody::Fulfilled(state.encode_value(value, &path)),
                        Ok(Err(error)) => ChunkBody::Rejected(state.report(&error, &path)),
                        Err(panic) => {
                            ChunkBody::Rejected(state.report(&RpcError::from_panic(panic), &path))
                        }
                    };
                    Ok(Chunk { index, body })
                }));
            }
            StreamValue::Sequence(mut sequence) => {
                self.sources.add(async_stream::stream! {
                    loop {
                        let body = match AssertUnwindSafe(sequence.next()).catch_unwind().await {
                            Ok(Some(Ok(value))) => ChunkBody::Yield(state.encode_value(value, &path)),
                            Ok(Some(Err(error))) => ChunkBody::Error(state.report(&error, &path)),
                            Ok(None) => ChunkBody::Return(EncodedValue::undefined()),
                            Err(panic) => {
                                ChunkBody::Error(state.report(&RpcError::from_panic(panic), &path))
                            }
                        };
                        let terminal = body.is_terminal();
                        yield Ok(Chunk { index, body });
                        if terminal {
                            break;
                        }
                    }
                    trace!(chunk_index = index, "Sequence source finished");
                });
            }
            _ => {}
        }
        (kind, index)
    }

    /// Drive a deferred value that will never be encoded, so its own failure
    /// still reaches the error callback.
    fn watch_detached(self: &Arc<Self>, deferred: Deferred, path: Vec<PathSegment>) {
        let state = Arc::clone(self);
        let dotted = dotted_path(&path);
        let watch = async move {
            let error = match AssertUnwindSafe(deferred).catch_unwind().await {
                Ok(Ok(_)) => return,
                Ok(Err(error)) => error,
                Err(panic) => RpcError::from_panic(panic),
            };
            state.report(&error, &path);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(watch);
            }
            Err(_) => trace!(path = %dotted, "No runtime; dropping over-depth value"),
        }
    }

    /// Notify the error callback and format the error for the wire.
    fn report(&self, error: &RpcError, path: &[PathSegment]) -> Value {
        debug!(
            code = %error.code,
            path = %dotted_path(path),
            message = %error.message,
            "Async value failed"
        );
        if let Some(on_error) = &self.options.on_error {
            on_error(error, path);
        }
        ErrorShape::to_value(error, &self.options.errors)
    }
}
