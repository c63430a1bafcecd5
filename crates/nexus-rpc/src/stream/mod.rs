//! Streaming value protocol
//!
//! A result tree containing deferred values and lazy sequences travels as a
//! head record followed by an ordered stream of tagged chunks:
//!
//! ```text
//! {"0":[[{"title":"a","comments":0}],["comments",0,0]]}   <- head
//! [0,0,[[3]]]                                              <- chunk 0 fulfilled
//! ```
//!
//! - [`merge`] fans many sources into one output in completion order
//! - [`encoder`] snapshots roots into a head and drives the chunk sources
//! - [`decoder`] rebuilds live deferred handles and sequence readers
//! - [`jsonl`] and [`sse`] frame the wire body

pub mod chunk;
pub mod decoder;
pub mod encoder;
pub mod jsonl;
pub mod merge;
pub mod sse;

pub use chunk::{Chunk, ChunkBody, ChunkIndex, ChunkKind, EncodedValue, Head, StreamError};
pub use decoder::{
    DecodedValue, Decoded, DecoderHandle, DeferredHandle, SequenceReader, decode,
    is_stream_interrupted,
};
pub use encoder::{Encoded, EncoderOptions, ErrorCallback, encode};
pub use jsonl::{LineStream, PING_LINE, to_jsonl, to_jsonl_with};
pub use merge::{MergeError, MergedStream, Merger, MergerHandle};
pub use sse::{SseEvent, SseParser, sse_events, sse_stream};
