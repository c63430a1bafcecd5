//! Wire records of the streaming value protocol
//!
//! A streaming body is a Head record followed by chunk records:
//!
//! ```text
//! {"post":[[{"title":"a","comments":0}],["comments",0,1]]}
//! [1,0,[[[{"id":1}]]]]
//! ```
//!
//! An [`EncodedValue`] is `[[data] | [], ...ChunkRef]` where each
//! `ChunkRef` is `[pathKey, kind, index]` and the placeholder inside `data`
//! is `0`. A chunk record is `[index, status, payload]`; how `status` reads
//! depends on the [`ChunkKind`] registered for `index`.

use crate::error::RpcResult;
use crate::value::PathSegment;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Identifies one registered deferred value or sequence within an encoding.
pub type ChunkIndex = u64;

/// Value written in place of an async position.
pub const PLACEHOLDER: u8 = 0;

pub const KIND_DEFERRED: u8 = 0;
pub const KIND_SEQUENCE: u8 = 1;

pub const DEFERRED_FULFILLED: u8 = 0;
pub const DEFERRED_REJECTED: u8 = 1;

pub const SEQUENCE_RETURN: u8 = 0;
pub const SEQUENCE_YIELD: u8 = 1;
pub const SEQUENCE_ERROR: u8 = 2;

/// Errors raised while framing or parsing streaming records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("malformed head record: {0}")]
    MalformedHead(String),
    #[error("malformed chunk record: {0}")]
    MalformedChunk(String),
    #[error("unknown status {status} for chunk {index}")]
    UnknownStatus { index: ChunkIndex, status: u8 },
    #[error("invalid utf-8 in stream line")]
    InvalidUtf8,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream ended before the head record")]
    MissingHead,
}

/// What kind of async value a chunk index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Deferred,
    Sequence,
}

impl ChunkKind {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Deferred => KIND_DEFERRED,
            Self::Sequence => KIND_SEQUENCE,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            KIND_DEFERRED => Some(Self::Deferred),
            KIND_SEQUENCE => Some(Self::Sequence),
            _ => None,
        }
    }
}

/// Where a placeholder sits relative to the encoded value that carries it.
///
/// `None` means the encoded value itself is the placeholder.
pub type PathKey = Option<PathSegment>;

/// Registration of one placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub key: PathKey,
    pub kind: ChunkKind,
    pub index: ChunkIndex,
}

/// Snapshot of a value with its async positions replaced by placeholders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedValue {
    /// `None` encodes an absent value
    pub data: Option<Value>,
    pub refs: Vec<ChunkRef>,
}

impl EncodedValue {
    pub fn plain(value: Value) -> Self {
        Self {
            data: Some(value),
            refs: Vec::new(),
        }
    }

    pub fn undefined() -> Self {
        Self::default()
    }

    fn to_json(&self) -> Value {
        let mut out = Vec::with_capacity(1 + self.refs.len());
        out.push(Value::Array(self.data.iter().cloned().collect()));
        for r in &self.refs {
            let key = match &r.key {
                None => Value::Null,
                Some(PathSegment::Key(k)) => Value::String(k.clone()),
                Some(PathSegment::Index(i)) => Value::from(*i),
            };
            out.push(Value::Array(vec![
                key,
                Value::from(r.kind.as_u8()),
                Value::from(r.index),
            ]));
        }
        Value::Array(out)
    }

    /// Parse the wire form.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let parts = value.as_array().ok_or("encoded value must be an array")?;
        let (first, rest) = parts.split_first().ok_or("encoded value is empty")?;
        let data = match first.as_array().map(Vec::as_slice) {
            Some([]) => None,
            Some([v]) => Some(v.clone()),
            _ => return Err("encoded data must be `[]` or `[value]`".to_string()),
        };

        let refs = rest
            .iter()
            .map(|r| {
                let [key, kind, index] = r.as_array().map(Vec::as_slice).unwrap_or_default() else {
                    return Err("chunk ref must be `[key, kind, index]`".to_string());
                };
                let key = match key {
                    Value::Null => None,
                    Value::String(s) => Some(PathSegment::Key(s.clone())),
                    Value::Number(n) => Some(PathSegment::Index(
                        n.as_u64().ok_or("chunk ref index key must be unsigned")? as usize,
                    )),
                    _ => return Err("chunk ref key must be null, string or integer".to_string()),
                };
                let kind = kind
                    .as_u64()
                    .and_then(|k| u8::try_from(k).ok())
                    .and_then(ChunkKind::from_u8)
                    .ok_or("unknown chunk kind")?;
                let index = index.as_u64().ok_or("chunk index must be unsigned")?;
                Ok(ChunkRef { key, kind, index })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Self { data, refs })
    }
}

impl Serialize for EncodedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EncodedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(D::Error::custom)
    }
}

/// The first record of a streaming body: every root value, encoded.
pub type Head = BTreeMap<String, EncodedValue>;

/// Parse a head line.
pub fn parse_head(line: &str) -> Result<Head, StreamError> {
    serde_json::from_str(line).map_err(|e| StreamError::MalformedHead(e.to_string()))
}

// =============================================================================
// Chunks
// =============================================================================

/// Terminal or intermediate state reported for one chunk index.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkBody {
    Fulfilled(EncodedValue),
    /// Formatted error shape
    Rejected(Value),
    Yield(EncodedValue),
    Return(EncodedValue),
    /// Formatted error shape
    Error(Value),
}

impl ChunkBody {
    /// True when no further chunk follows for this index.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Yield(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: ChunkIndex,
    pub body: ChunkBody,
}

impl Chunk {
    pub fn to_raw(&self) -> RawChunk {
        let (status, payload) = match &self.body {
            ChunkBody::Fulfilled(v) => (DEFERRED_FULFILLED, v.to_json()),
            ChunkBody::Rejected(e) => (DEFERRED_REJECTED, e.clone()),
            ChunkBody::Yield(v) => (SEQUENCE_YIELD, v.to_json()),
            ChunkBody::Return(v) => (SEQUENCE_RETURN, v.to_json()),
            ChunkBody::Error(e) => (SEQUENCE_ERROR, e.clone()),
        };
        RawChunk(self.index, status, payload)
    }

    /// One JSON line, without the trailing newline.
    pub fn to_line(&self) -> RpcResult<String> {
        Ok(serde_json::to_string(&self.to_raw())?)
    }
}

/// A chunk as read from the wire, before its kind is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChunk(pub ChunkIndex, pub u8, pub Value);

impl RawChunk {
    pub fn parse(line: &str) -> Result<Self, StreamError> {
        serde_json::from_str(line).map_err(|e| StreamError::MalformedChunk(e.to_string()))
    }

    pub fn index(&self) -> ChunkIndex {
        self.0
    }

    /// Read the status and payload under the registered kind.
    pub fn interpret(self, kind: ChunkKind) -> Result<ChunkBody, StreamError> {
        let RawChunk(index, status, payload) = self;
        let encoded = |payload: Value| {
            EncodedValue::from_json(&payload).map_err(StreamError::MalformedChunk)
        };
        match (kind, status) {
            (ChunkKind::Deferred, DEFERRED_FULFILLED) => Ok(ChunkBody::Fulfilled(encoded(payload)?)),
            (ChunkKind::Deferred, DEFERRED_REJECTED) => Ok(ChunkBody::Rejected(payload)),
            (ChunkKind::Sequence, SEQUENCE_YIELD) => Ok(ChunkBody::Yield(encoded(payload)?)),
            (ChunkKind::Sequence, SEQUENCE_RETURN) => Ok(ChunkBody::Return(encoded(payload)?)),
            (ChunkKind::Sequence, SEQUENCE_ERROR) => Ok(ChunkBody::Error(payload)),
            _ => Err(StreamError::UnknownStatus { index, status }),
        }
    }
}
