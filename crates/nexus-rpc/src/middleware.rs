//! Middleware support for request/response processing
//!
//! Every procedure runs as an ordered chain of middleware ending in a
//! terminal stage that calls the resolver. A middleware receives the call's
//! [`MiddlewareOptions`] plus a [`Next`] and must return the result of
//! running `next`, optionally extending the context or replacing the input
//! for everything downstream.
//!
//! # Example
//! ```rust,ignore
//! let auth = |opts: MiddlewareOptions, next: Next| async move {
//!     let user = authenticate(&opts.ctx)?;
//!     Ok(next.run_with(NextOptions::new().with_ctx("user", user)).await)
//! };
//! ```

use crate::context::{Context, ContextOverride};
use crate::error::{RpcError, RpcResult};
use crate::signal::CancellationSignal;
use crate::value::StreamValue;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, trace};

/// Message of the fatal error raised when a middleware does not hand back the
/// chain's own result.
pub const NO_RESULT_MESSAGE: &str =
    "No result from middlewares - did you forget to `return next()`?";

/// Type of procedure being called
#[derive(Clone, Debug, PartialEq, Eq, Hash, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ProcedureType {
    /// Read-only operation
    Query,
    /// Write operation
    Mutation,
    /// Streaming subscription
    Subscription,
}

impl fmt::Display for ProcedureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Mutation => write!(f, "mutation"),
            Self::Subscription => write!(f, "subscription"),
        }
    }
}

// =============================================================================
// Raw Input
// =============================================================================

/// Lazily produces the unparsed input of a call.
pub type RawInputFn = Arc<dyn Fn() -> BoxFuture<'static, RpcResult<Value>> + Send + Sync>;

/// A raw-input getter returning a fixed value.
pub fn raw_input(value: Value) -> RawInputFn {
    Arc::new(move || {
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    })
}

// =============================================================================
// Middleware Result
// =============================================================================

/// Identifies one pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallMarker(u64);

impl CallMarker {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Outcome of the downstream chain, as returned by [`Next::run`].
///
/// Only the pipeline creates these. A middleware hands back the result it
/// got from `next`, possibly after [`map_data`](Self::map_data) or
/// [`map_err`](Self::map_err).
#[derive(Debug)]
pub struct MiddlewareResult {
    marker: CallMarker,
    outcome: Result<StreamValue, RpcError>,
}

impl MiddlewareResult {
    pub(crate) fn ok(marker: CallMarker, data: StreamValue) -> Self {
        Self {
            marker,
            outcome: Ok(data),
        }
    }

    pub(crate) fn err(marker: CallMarker, error: RpcError) -> Self {
        Self {
            marker,
            outcome: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn data(&self) -> Option<&StreamValue> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.outcome.as_ref().err()
    }

    /// Transform the data of a successful result. An `Err` from `f` turns
    /// the result into a failure.
    #[must_use = "This method returns a new MiddlewareResult and does not modify self"]
    pub fn map_data<F>(self, f: F) -> Self
    where
        F: FnOnce(StreamValue) -> RpcResult<StreamValue>,
    {
        Self {
            marker: self.marker,
            outcome: self.outcome.and_then(f),
        }
    }

    /// Replace the error of a failed result.
    #[must_use = "This method returns a new MiddlewareResult and does not modify self"]
    pub fn map_err<F>(self, f: F) -> Self
    where
        F: FnOnce(RpcError) -> RpcError,
    {
        Self {
            marker: self.marker,
            outcome: self.outcome.map_err(f),
        }
    }

    pub fn into_result(self) -> RpcResult<StreamValue> {
        self.outcome
    }
}

// =============================================================================
// Options
// =============================================================================

/// What a middleware sees of the current call.
#[derive(Clone)]
pub struct MiddlewareOptions {
    /// Context accumulated by the middleware before this one
    pub ctx: Context,
    /// Input as parsed so far
    pub input: Value,
    /// Full path of the procedure (e.g., "post.byId")
    pub path: String,
    pub kind: ProcedureType,
    pub meta: Option<Value>,
    pub signal: CancellationSignal,
    raw_input: RawInputFn,
}

impl MiddlewareOptions {
    /// Fetch the unparsed input.
    pub async fn raw_input(&self) -> RpcResult<Value> {
        (self.raw_input)().await
    }

    /// Get the namespace (first part of path)
    pub fn namespace(&self) -> Option<&str> {
        self.path.split('.').next()
    }

    /// Get the procedure name (last part of path)
    pub fn procedure(&self) -> &str {
        self.path.split('.').next_back().unwrap_or(&self.path)
    }
}

impl fmt::Debug for MiddlewareOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareOptions")
            .field("ctx", &self.ctx)
            .field("input", &self.input)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Changes passed down with [`Next::run_with`].
#[derive(Default)]
pub struct NextOptions {
    pub ctx: ContextOverride,
    pub input: Option<Value>,
    pub raw_input: Option<RawInputFn>,
}

impl NextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one context entry for every downstream stage.
    #[must_use = "This method returns a new NextOptions and does not modify self"]
    pub fn with_ctx<T: std::any::Any + Send + Sync>(
        mut self,
        key: impl Into<String>,
        value: T,
    ) -> Self {
        self.ctx.insert(key, value);
        self
    }

    #[must_use = "This method returns a new NextOptions and does not modify self"]
    pub fn with_context(mut self, overrides: ContextOverride) -> Self {
        self.ctx = overrides;
        self
    }

    #[must_use = "This method returns a new NextOptions and does not modify self"]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    #[must_use = "This method returns a new NextOptions and does not modify self"]
    pub fn with_raw_input(mut self, raw_input: RawInputFn) -> Self {
        self.raw_input = Some(raw_input);
        self
    }
}

// =============================================================================
// Middleware Trait
// =============================================================================

/// Trait for implementing custom middleware
pub trait Middleware: Send + Sync {
    /// Process the call; return the result of `next` to continue the chain.
    fn handle(
        &self,
        opts: MiddlewareOptions,
        next: Next,
    ) -> BoxFuture<'static, RpcResult<MiddlewareResult>>;
}

/// Middleware for async closures.
///
/// # Example
/// ```rust,ignore
/// let timing = |opts: MiddlewareOptions, next: Next| async move {
///     let start = std::time::Instant::now();
///     let result = next.run().await;
///     println!("{} took {:?}", opts.path, start.elapsed());
///     Ok(result)
/// };
/// ```
impl<F, Fut> Middleware for F
where
    F: Fn(MiddlewareOptions, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<MiddlewareResult>> + Send + 'static,
{
    fn handle(
        &self,
        opts: MiddlewareOptions,
        next: Next,
    ) -> BoxFuture<'static, RpcResult<MiddlewareResult>> {
        Box::pin(self(opts, next))
    }
}

/// Middleware function type
pub type MiddlewareFn = Arc<dyn Middleware>;

/// Create middleware from an async function
pub fn from_fn<F, Fut>(f: F) -> MiddlewareFn
where
    F: Fn(MiddlewareOptions, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<MiddlewareResult>> + Send + 'static,
{
    Arc::new(f)
}

// =============================================================================
// Chain
// =============================================================================

struct CallInfo {
    marker: CallMarker,
    path: String,
    kind: ProcedureType,
    meta: Option<Value>,
    signal: CancellationSignal,
}

/// The rest of the chain after the current middleware.
pub struct Next {
    chain: Arc<[MiddlewareFn]>,
    position: usize,
    call: Arc<CallInfo>,
    ctx: Context,
    input: Value,
    raw_input: RawInputFn,
}

impl Next {
    /// Run the rest of the chain with the current context and input.
    pub async fn run(self) -> MiddlewareResult {
        let Next {
            chain,
            position,
            call,
            ctx,
            input,
            raw_input,
        } = self;
        run_stage(chain, position, call, ctx, input, raw_input).await
    }

    /// Run the rest of the chain with a merged context and optionally
    /// replaced input.
    pub async fn run_with(self, options: NextOptions) -> MiddlewareResult {
        let NextOptions {
            ctx: overrides,
            input,
            raw_input,
        } = options;
        let ctx = if overrides.is_empty() {
            self.ctx
        } else {
            self.ctx.merge(overrides)
        };
        let input = input.unwrap_or(self.input);
        let raw_input = raw_input.unwrap_or(self.raw_input);
        run_stage(self.chain, self.position, self.call, ctx, input, raw_input).await
    }

    /// Wrap a value as this call's successful result.
    pub(crate) fn ok(&self, data: StreamValue) -> MiddlewareResult {
        MiddlewareResult::ok(self.call.marker, data)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("position", &self.position)
            .field("remaining", &(self.chain.len() - self.position.min(self.chain.len())))
            .finish_non_exhaustive()
    }
}

/// Arguments for one pipeline invocation.
pub(crate) struct Invocation {
    pub ctx: Context,
    pub path: String,
    pub kind: ProcedureType,
    pub meta: Option<Value>,
    pub input: Value,
    pub raw_input: RawInputFn,
    pub signal: CancellationSignal,
}

/// Run a full chain; the last stage must be the terminal resolver stage.
pub(crate) async fn run_chain(
    chain: Arc<[MiddlewareFn]>,
    invocation: Invocation,
) -> RpcResult<StreamValue> {
    let Invocation {
        ctx,
        path,
        kind,
        meta,
        input,
        raw_input,
        signal,
    } = invocation;
    let call = Arc::new(CallInfo {
        marker: CallMarker::next(),
        path,
        kind,
        meta,
        signal,
    });
    run_stage(chain, 0, call, ctx, input, raw_input)
        .await
        .into_result()
}

fn run_stage(
    chain: Arc<[MiddlewareFn]>,
    position: usize,
    call: Arc<CallInfo>,
    ctx: Context,
    input: Value,
    raw_input: RawInputFn,
) -> BoxFuture<'static, MiddlewareResult> {
    Box::pin(async move {
        let marker = call.marker;
        let Some(middleware) = chain.get(position).cloned() else {
            error!(path = %call.path, position, "Middleware chain ran past its terminal stage");
            return MiddlewareResult::err(marker, RpcError::internal(NO_RESULT_MESSAGE));
        };
        trace!(path = %call.path, position, "Running middleware stage");

        let opts = MiddlewareOptions {
            ctx: ctx.clone(),
            input: input.clone(),
            path: call.path.clone(),
            kind: call.kind,
            meta: call.meta.clone(),
            signal: call.signal.clone(),
            raw_input: Arc::clone(&raw_input),
        };
        let next = Next {
            chain,
            position: position + 1,
            call: Arc::clone(&call),
            ctx,
            input,
            raw_input,
        };

        match AssertUnwindSafe(middleware.handle(opts, next))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) if result.marker == marker => result,
            Ok(Ok(_)) => {
                error!(path = %call.path, position, "Middleware returned a result it did not get from next");
                MiddlewareResult::err(marker, RpcError::internal(NO_RESULT_MESSAGE))
            }
            Ok(Err(error)) => MiddlewareResult::err(marker, error),
            Err(panic) => {
                let error = RpcError::from_panic(panic);
                error!(path = %call.path, position, cause = ?error.cause, "Middleware panicked");
                MiddlewareResult::err(marker, error)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcErrorCode;
    use serde_json::json;
    use std::sync::Mutex;

    fn terminal() -> MiddlewareFn {
        from_fn(|opts: MiddlewareOptions, next: Next| async move {
            Ok(next.ok(StreamValue::from(opts.input)))
        })
    }

    fn invocation(input: Value) -> Invocation {
        Invocation {
            ctx: Context::new(),
            path: "test.echo".to_string(),
            kind: ProcedureType::Query,
            meta: None,
            input: input.clone(),
            raw_input: raw_input(input),
            signal: CancellationSignal::new(),
        }
    }

    #[tokio::test]
    async fn test_middleware_chain_execution_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let stage = |name: &'static str| {
            let order = order.clone();
            from_fn(move |_opts: MiddlewareOptions, next: Next| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(format!("{name} before"));
                    let result = next.run().await;
                    order.lock().unwrap().push(format!("{name} after"));
                    Ok(result)
                }
            })
        };
        let chain: Arc<[MiddlewareFn]> = vec![stage("m1"), stage("m2"), terminal()].into();

        let result = run_chain(chain, invocation(json!(1))).await.unwrap();
        assert_eq!(result.to_plain_json(), Some(json!(1)));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["m1 before", "m2 before", "m2 after", "m1 after"]
        );
    }

    #[tokio::test]
    async fn test_run_with_replaces_input() {
        let replace = from_fn(|_opts: MiddlewareOptions, next: Next| async move {
            Ok(next.run_with(NextOptions::new().with_input(json!("replaced"))).await)
        });
        let chain: Arc<[MiddlewareFn]> = vec![replace, terminal()].into();
        let result = run_chain(chain, invocation(json!("original"))).await.unwrap();
        assert_eq!(result.to_plain_json(), Some(json!("replaced")));
    }

    #[tokio::test]
    async fn test_error_becomes_err_result() {
        let deny = from_fn(|_opts: MiddlewareOptions, _next: Next| async move {
            Err::<MiddlewareResult, _>(RpcError::unauthorized("no token"))
        });
        let chain: Arc<[MiddlewareFn]> = vec![deny, terminal()].into();
        let err = run_chain(chain, invocation(json!(null))).await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let boom = from_fn(|_opts: MiddlewareOptions, _next: Next| async move {
            if true {
                panic!("kaboom");
            }
            Err::<MiddlewareResult, _>(RpcError::internal("unreachable"))
        });
        let chain: Arc<[MiddlewareFn]> = vec![boom, terminal()].into();
        let err = run_chain(chain, invocation(json!(null))).await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::InternalServerError);
    }

    #[tokio::test]
    async fn test_foreign_result_is_rejected() {
        // Produces a result for a different call instead of running next.
        let forge = from_fn(|_opts: MiddlewareOptions, _next: Next| async move {
            let other: Arc<[MiddlewareFn]> = vec![terminal()].into();
            let call = Arc::new(CallInfo {
                marker: CallMarker::next(),
                path: "other".to_string(),
                kind: ProcedureType::Query,
                meta: None,
                signal: CancellationSignal::new(),
            });
            Ok(run_stage(other, 0, call, Context::new(), json!(1), raw_input(json!(1))).await)
        });
        let chain: Arc<[MiddlewareFn]> = vec![forge, terminal()].into();
        let err = run_chain(chain, invocation(json!(null))).await.unwrap_err();
        assert_eq!(err.code, RpcErrorCode::InternalServerError);
        assert_eq!(err.message, NO_RESULT_MESSAGE);
    }

    #[tokio::test]
    async fn test_map_data_failure_turns_into_error() {
        let reject_output = from_fn(|_opts: MiddlewareOptions, next: Next| async move {
            Ok(next
                .run()
                .await
                .map_data(|_| Err(RpcError::internal("Output validation failed"))))
        });
        let chain: Arc<[MiddlewareFn]> = vec![reject_output, terminal()].into();
        let err = run_chain(chain, invocation(json!(1))).await.unwrap_err();
        assert_eq!(err.message, "Output validation failed");
    }

    #[test]
    fn test_options_path_parts() {
        let opts = MiddlewareOptions {
            ctx: Context::new(),
            input: Value::Null,
            path: "post.byId".to_string(),
            kind: ProcedureType::Query,
            meta: None,
            signal: CancellationSignal::new(),
            raw_input: raw_input(Value::Null),
        };
        assert_eq!(opts.namespace(), Some("post"));
        assert_eq!(opts.procedure(), "byId");
        assert_eq!(ProcedureType::Subscription.to_string(), "subscription");
    }
}
