//! Result values that may contain deferred values and lazy sequences
//!
//! Resolvers return a [`StreamValue`]. Plain JSON is the common case; a value
//! tree may also embed [`Deferred`] values (exactly one eventual resolution)
//! and [`LazySequence`]s (zero or more elements, then a return or an error).
//! The streaming encoder replaces those with placeholders plus chunks.
//!
//! # Example
//! ```rust,ignore
//! use nexus_rpc::value::{Deferred, LazySequence, StreamValue};
//! use serde_json::json;
//!
//! let value = StreamValue::object([
//!     ("now", StreamValue::from(json!(1))),
//!     ("later", StreamValue::Deferred(Deferred::new(async { Ok(json!(2).into()) }))),
//!     ("ticks", StreamValue::Sequence(LazySequence::from_values(vec![json!(1), json!(2)]))),
//! ]);
//! ```

use crate::error::{RpcError, RpcResult};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

// =============================================================================
// Paths
// =============================================================================

/// One step of the path from a root value to a nested value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "{key}"),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Render a path as `a.b.0`.
pub fn dotted_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

// =============================================================================
// Deferred Values
// =============================================================================

/// A value that is not available yet and resolves exactly once.
pub struct Deferred {
    future: BoxFuture<'static, RpcResult<StreamValue>>,
}

impl Deferred {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = RpcResult<StreamValue>> + Send + 'static,
    {
        Self {
            future: Box::pin(future),
        }
    }

    /// A deferred value that is already resolved.
    pub fn ready(value: StreamValue) -> Self {
        Self::new(futures::future::ready(Ok(value)))
    }

    /// A deferred value that is already rejected.
    pub fn rejected(error: RpcError) -> Self {
        Self::new(futures::future::ready(Err(error)))
    }
}

impl Future for Deferred {
    type Output = RpcResult<StreamValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deferred(..)")
    }
}

// =============================================================================
// Lazy Sequences
// =============================================================================

struct CleanupGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

/// A pull-based producer of elements.
///
/// An `Err` item terminates the sequence; the stream ending is a normal
/// return. Dropping the sequence runs its cleanup hook, whether it finished,
/// failed or was abandoned.
pub struct LazySequence {
    stream: BoxStream<'static, RpcResult<StreamValue>>,
    cleanup: CleanupGuard,
}

impl LazySequence {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = RpcResult<StreamValue>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
            cleanup: CleanupGuard(None),
        }
    }

    /// A finite sequence of plain JSON elements.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self::new(stream::iter(values.into_iter().map(|v| Ok(StreamValue::Json(v)))))
    }

    /// Register a hook that runs when the sequence is dropped.
    #[must_use = "This method returns a new LazySequence and does not modify self"]
    pub fn with_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup = CleanupGuard(Some(Box::new(cleanup)));
        self
    }
}

impl Stream for LazySequence {
    type Item = RpcResult<StreamValue>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

impl fmt::Debug for LazySequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LazySequence(..)")
    }
}

// =============================================================================
// Stream Values
// =============================================================================

/// A sequence element marked with a resumable event id.
#[derive(Debug)]
pub struct TrackedValue {
    pub id: String,
    pub data: Box<StreamValue>,
}

/// Mark a sequence element with an event id the caller can resume from.
pub fn tracked(id: impl Into<String>, data: impl Into<StreamValue>) -> StreamValue {
    StreamValue::Tracked(TrackedValue {
        id: id.into(),
        data: Box::new(data.into()),
    })
}

/// A result tree.
#[derive(Debug)]
pub enum StreamValue {
    /// Absent value; dropped from objects, `null` in arrays
    Undefined,
    Json(Value),
    Object(Vec<(String, StreamValue)>),
    Array(Vec<StreamValue>),
    Deferred(Deferred),
    Sequence(LazySequence),
    Tracked(TrackedValue),
}

impl StreamValue {
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, StreamValue)>,
    {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = RpcResult<StreamValue>> + Send + 'static,
    {
        Self::Deferred(Deferred::new(future))
    }

    pub fn sequence<S>(stream: S) -> Self
    where
        S: Stream<Item = RpcResult<StreamValue>> + Send + 'static,
    {
        Self::Sequence(LazySequence::new(stream))
    }

    /// Serialize any value into a plain JSON tree.
    pub fn from_serialize<T: Serialize>(value: &T) -> RpcResult<Self> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| RpcError::internal(format!("Failed to serialize output: {e}")))
    }

    /// True for a deferred value or lazy sequence at this position.
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Deferred(_) | Self::Sequence(_))
    }

    /// True when any position in the tree holds a deferred value or sequence.
    pub fn contains_async(&self) -> bool {
        match self {
            Self::Deferred(_) | Self::Sequence(_) => true,
            Self::Object(fields) => fields.iter().any(|(_, v)| v.contains_async()),
            Self::Array(items) => items.iter().any(StreamValue::contains_async),
            Self::Tracked(t) => t.data.contains_async(),
            Self::Undefined | Self::Json(_) => false,
        }
    }

    /// The plain JSON form of a tree without async positions.
    ///
    /// Returns `None` when the tree contains a deferred value or sequence.
    pub fn to_plain_json(&self) -> Option<Value> {
        match self {
            Self::Undefined => Some(Value::Null),
            Self::Json(v) => Some(v.clone()),
            Self::Object(fields) => {
                let mut map = serde_json::Map::new();
                for (key, value) in fields {
                    match value {
                        Self::Undefined => {}
                        other => {
                            map.insert(key.clone(), other.to_plain_json()?);
                        }
                    }
                }
                Some(Value::Object(map))
            }
            Self::Array(items) => items
                .iter()
                .map(StreamValue::to_plain_json)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Self::Tracked(t) => Some(Value::Array(vec![
                Value::String(t.id.clone()),
                t.data.to_plain_json()?,
            ])),
            Self::Deferred(_) | Self::Sequence(_) => None,
        }
    }

    /// Await every deferred value and drain every sequence into a JSON tree.
    ///
    /// Sequences become arrays of their elements; tracked elements become
    /// `[id, data]` pairs.
    pub fn resolve_all(self) -> BoxFuture<'static, RpcResult<Value>> {
        Box::pin(async move {
            match self {
                Self::Undefined => Ok(Value::Null),
                Self::Json(v) => Ok(v),
                Self::Object(fields) => {
                    let mut map = serde_json::Map::new();
                    for (key, value) in fields {
                        if matches!(value, Self::Undefined) {
                            continue;
                        }
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
                Self::Deferred(deferred) => deferred.await?.resolve_all().await,
                Self::Sequence(mut sequence) => {
                    let mut out = Vec::new();
                    while let Some(item) = sequence.next().await {
                        out.push(item?.resolve_all().await?);
                    }
                    Ok(Value::Array(out))
                }
                Self::Tracked(t) => Ok(Value::Array(vec![
                    Value::String(t.id),
                    t.data.resolve_all().await?,
                ])),
            }
        })
    }
}

impl From<Value> for StreamValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Deferred> for StreamValue {
    fn from(value: Deferred) -> Self {
        Self::Deferred(value)
    }
}

impl From<LazySequence> for StreamValue {
    fn from(value: LazySequence) -> Self {
        Self::Sequence(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_resolve_all_flattens_async_positions() {
        let value = StreamValue::object([
            ("a", StreamValue::from(json!(1))),
            ("skip", StreamValue::Undefined),
            (
                "b",
                StreamValue::deferred(async { Ok(StreamValue::from(json!("x"))) }),
            ),
            (
                "c",
                StreamValue::Sequence(LazySequence::from_values(vec![json!(1), json!(2)])),
            ),
        ]);
        assert!(value.contains_async());
        assert!(value.to_plain_json().is_none());

        let resolved = value.resolve_all().await.unwrap();
        assert_eq!(resolved, json!({"a": 1, "b": "x", "c": [1, 2]}));
    }

    #[test]
    fn test_cleanup_runs_on_drop() {
        let flag = Arc::new(AtomicBool::new(false));
        let seen = flag.clone();
        let seq = LazySequence::from_values(vec![json!(1)])
            .with_cleanup(move || seen.store(true, Ordering::SeqCst));
        drop(seq);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dotted_path() {
        let path = vec![
            PathSegment::Key("a".into()),
            PathSegment::Index(0),
            PathSegment::Key("b".into()),
        ];
        assert_eq!(dotted_path(&path), "a.0.b");
    }
}
