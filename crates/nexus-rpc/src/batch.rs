//! Batched calls
//!
//! A batch runs several calls concurrently against one router and reports
//! per-call results in request order.
//!
//! - [`call_batch`] returns the raw results
//! - [`resolve_batch`] fully resolves them into a JSON response with the
//!   HTTP status from [`batch_http_status`] (200, the shared error status,
//!   or 207 for a mix)
//! - [`encode_batch`] streams them instead: each call becomes a deferred
//!   root keyed by its index, so fast calls are delivered first
//!
//! # Example
//!
//! ```rust,ignore
//! let batch = BatchRequest::new()
//!     .add("post.byId", ProcedureType::Query, json!({"id": "1"}))
//!     .add("post.byId", ProcedureType::Query, json!({"id": "missing"}));
//!
//! let response = resolve_batch(&router, Context::new(), batch, signal).await?;
//! assert_eq!(response.status, 207);
//! ```

use crate::context::Context;
use crate::error::{ErrorConfig, ErrorShape, RpcError, RpcResult};
use crate::middleware::ProcedureType;
use crate::procedure::CallOptions;
use crate::router::Router;
use crate::signal::CancellationSignal;
use crate::stream::encoder::{Encoded, EncoderOptions, encode};
use crate::value::StreamValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, warn};

/// One call within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCall {
    pub path: String,
    pub kind: ProcedureType,
    #[serde(default)]
    pub input: Value,
}

/// Calls executed together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub calls: Vec<BatchCall>,
}

impl BatchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "This method returns a new BatchRequest and does not modify self"]
    pub fn add(mut self, path: impl Into<String>, kind: ProcedureType, input: Value) -> Self {
        self.calls.push(BatchCall {
            path: path.into(),
            kind,
            input,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Reject empty batches and batches above `max_batch_size`.
    pub fn validate(&self, max_batch_size: usize) -> RpcResult<()> {
        if self.calls.is_empty() {
            warn!("Batch validation failed: batch request cannot be empty");
            return Err(RpcError::bad_request("Batch request cannot be empty"));
        }
        if self.calls.len() > max_batch_size {
            warn!(
                batch_size = self.calls.len(),
                max_size = max_batch_size,
                "Batch validation failed: size exceeds maximum"
            );
            return Err(RpcError::bad_request(format!(
                "Batch size {} exceeds maximum allowed size {}",
                self.calls.len(),
                max_batch_size
            )));
        }
        Ok(())
    }
}

fn call_options(call: BatchCall, ctx: &Context, signal: &CancellationSignal) -> CallOptions {
    CallOptions::new(call.path, call.kind, call.input)
        .with_ctx(ctx.clone())
        .with_signal(signal.child())
}

/// Run every call concurrently; results keep request order.
///
/// # Errors
///
/// `BAD_REQUEST` if the batch is empty or larger than the router's
/// `max_batch_size`. Per-call failures are reported in the result list.
pub async fn call_batch(
    router: &Router,
    ctx: Context,
    batch: BatchRequest,
    signal: CancellationSignal,
) -> RpcResult<Vec<RpcResult<StreamValue>>> {
    batch.validate(router.config().max_batch_size)?;
    let start = Instant::now();
    let total = batch.len();

    let calls = batch
        .calls
        .into_iter()
        .map(|call| router.call(call_options(call, &ctx, &signal)));
    let results = futures::future::join_all(calls).await;

    debug!(
        total,
        errors = results.iter().filter(|r| r.is_err()).count(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Batch executed"
    );
    Ok(results)
}

/// HTTP status for a set of batch results.
///
/// 200 when every call succeeded, the common status when every call failed
/// with the same one, otherwise 207.
pub fn batch_http_status<T>(results: &[RpcResult<T>]) -> u16 {
    let mut statuses = results.iter().map(|r| match r {
        Ok(_) => 200,
        Err(e) => e.code.http_status(),
    });
    let Some(first) = statuses.next() else {
        return 200;
    };
    if statuses.all(|s| s == first) {
        first
    } else {
        207
    }
}

// =============================================================================
// Resolved Responses
// =============================================================================

/// Fully resolved outcome of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchResult {
    Result { data: Value },
    Error(ErrorShape),
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Result { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Result { data } => Some(data),
            Self::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorShape> {
        match self {
            Self::Error(shape) => Some(shape),
            Self::Result { .. } => None,
        }
    }
}

/// Fully resolved batch with its HTTP status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub status: u16,
    pub results: Vec<BatchResult>,
}

impl BatchResponse {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn error_count(&self) -> usize {
        self.results.len() - self.success_count()
    }
}

/// Run a batch and resolve every deferred value and sequence in the results.
pub async fn resolve_batch(
    router: &Router,
    ctx: Context,
    batch: BatchRequest,
    signal: CancellationSignal,
) -> RpcResult<BatchResponse> {
    let errors: ErrorConfig = router.config().errors.clone();
    let results = call_batch(router, ctx, batch, signal).await?;

    let mut resolved = Vec::with_capacity(results.len());
    for result in results {
        let outcome = match result {
            Ok(value) => value.resolve_all().await,
            Err(error) => Err(error),
        };
        resolved.push(outcome);
    }

    let status = batch_http_status(&resolved);
    let results = resolved
        .into_iter()
        .map(|outcome| match outcome {
            Ok(data) => BatchResult::Result { data },
            Err(error) => BatchResult::Error(ErrorShape::from_error(&error, &errors)),
        })
        .collect();
    Ok(BatchResponse { status, results })
}

// =============================================================================
// Streaming
// =============================================================================

/// Encode a batch as a streaming body.
///
/// Head key `"i"` is a deferred value resolving to call `i`'s result, so the
/// head is written before any call has finished.
pub fn encode_batch(
    router: &Router,
    ctx: Context,
    batch: BatchRequest,
    signal: CancellationSignal,
) -> RpcResult<Encoded> {
    batch.validate(router.config().max_batch_size)?;
    let options = EncoderOptions::from_config(router.config());

    let roots: Vec<(String, StreamValue)> = batch
        .calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let router = router.clone();
            let call = call_options(call, &ctx, &signal);
            let value = StreamValue::deferred(async move { router.call(call).await });
            (index.to_string(), value)
        })
        .collect();

    debug!(calls = roots.len(), "Encoding streaming batch");
    Ok(encode(roots, options))
}
