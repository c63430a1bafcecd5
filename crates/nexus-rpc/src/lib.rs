//! # Nexus RPC
//!
//! Transport core for a typed RPC framework with streaming results.
//!
//! ## Overview
//!
//! - **Procedures**: an ordered middleware pipeline ending in a resolver,
//!   with input/output validators and context extension
//! - **Streaming values**: results may contain deferred values and lazy
//!   sequences at any depth; they are encoded as a head plus tagged chunks
//!   delivered in completion order
//! - **Sessions**: persistent connections multiplexing calls and
//!   subscriptions with stop, resume and keep-alive
//! - **Structured errors**: one error type with tRPC-aligned codes and a
//!   stable wire shape
//!
//! ## Architecture
//!
//! ```text
//!  request ──► Router ──► Procedure ──► [middleware]* ──► resolver
//!                                                            │
//!                                                       StreamValue
//!                                                            │
//!            ┌───────────────────────────┬───────────────────┤
//!            ▼                           ▼                   ▼
//!      stream::encode              sse_stream             Session
//!      (head + chunks)          (event stream body)  (envelopes over a socket)
//!            │
//!            ▼
//!      stream::decode ──► DecodedValue (deferred handles, sequence readers)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nexus_rpc::prelude::*;
//!
//! let base = Procedure::builder().use_boxed(logging_middleware(LogConfig::new()));
//!
//! let router = Router::builder()
//!     .procedure(
//!         "post.byId",
//!         base.clone()
//!             .input(SerdeValidator::<ById>::new())
//!             .query(|opts: ResolverOptions| async move {
//!                 let input: ById = opts.parse_input()?;
//!                 find_post(&input.id).ok_or_else(|| RpcError::not_found("Post not found"))
//!             }),
//!     )
//!     .build()?;
//!
//! let value = router
//!     .call(CallOptions::new("post.byId", ProcedureType::Query, json!({"id": "1"})))
//!     .await?;
//! let body = to_jsonl(encode([("0".to_string(), value)], EncoderOptions::from_config(router.config())));
//! ```
//!
//! ## Subscriptions
//!
//! A subscription resolver returns a lazy sequence. Elements wrapped with
//! [`tracked`] carry an event id that clients send back as `lastEventId`
//! to resume.
//!
//! ```rust,ignore
//! let on_add = Procedure::builder().subscription(|opts: ResolverOptions| async move {
//!     let after = opts.input.get("lastEventId").and_then(|v| v.as_str()).map(str::to_owned);
//!     Ok(LazySequence::new(feed_after(after).map(|post| Ok(tracked(post.id.clone(), post.to_value())))))
//! });
//! ```

pub mod batch;
mod config;
mod context;
pub mod envelope;
mod error;
mod handler;
pub mod logging;
pub mod middleware;
pub mod procedure;
mod router;
pub mod session;
mod signal;
pub mod stream;
pub mod validation;
pub mod value;

#[cfg(test)]
mod tests;

// Public API
pub use batch::{
    BatchCall, BatchRequest, BatchResponse, BatchResult, batch_http_status, call_batch,
    encode_batch, resolve_batch,
};
pub use config::{
    ConfigValidationError, JsonlConfig, KeepAliveConfig, RpcConfig, SseConfig, StreamConfig,
};
pub use context::{Context, ContextOverride};
pub use envelope::{EnvelopeId, Method, RequestEnvelope, ResponseEnvelope, ResultType};
pub use error::{
    ErrorConfig, ErrorShape, ErrorShapeData, ErrorTransformer, LoggingTransformer, RpcError,
    RpcErrorCode, RpcResult,
};
pub use handler::{Handler, handler};
pub use logging::{LogConfig, LogLevel, RequestId, logging_middleware};
pub use middleware::{
    Middleware, MiddlewareFn, MiddlewareOptions, MiddlewareResult, Next, NextOptions,
    ProcedureType, from_fn,
};
pub use procedure::{BuildError, CallOptions, Procedure, ProcedureBuilder, ResolverOptions, Shape};
pub use router::{RESERVED_WORDS, Router, RouterBuilder};
pub use session::{ConnectionInfo, CreateContext, Outbound, Session, SessionId, SessionState};
pub use signal::CancellationSignal;
pub use stream::{DecodedValue, Encoded, EncoderOptions, decode, encode, sse_stream, to_jsonl};
pub use validation::{
    FieldError, SerdeValidator, Validate, Validated, ValidationError, ValidationResult,
    ValidationRules, Validator,
};
pub use value::{Deferred, LazySequence, StreamValue, tracked};

/// Prelude for convenient imports
///
/// ```rust,ignore
/// use nexus_rpc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CallOptions, CancellationSignal, Context, ContextOverride, Deferred, EncoderOptions,
        ErrorConfig, LazySequence, LogConfig, Middleware, MiddlewareFn, MiddlewareOptions,
        MiddlewareResult, Next, NextOptions, Procedure, ProcedureBuilder, ProcedureType,
        ResolverOptions, Router, RouterBuilder, RpcConfig, RpcError, RpcErrorCode, RpcResult,
        SerdeValidator, Session, StreamValue, Validator, decode, encode, from_fn,
        logging_middleware, to_jsonl, tracked,
    };
}
