//! Procedure builder and pipeline invocation
//!
//! A procedure is an ordered list of stages (middleware, input validators,
//! output validators) plus a terminal resolver. The builder collects stages
//! in registration order; `query`, `mutation` and `subscription` seal it.
//!
//! # Example
//!
//! ```rust,ignore
//! use nexus_rpc::prelude::*;
//!
//! let by_id = Procedure::builder()
//!     .use_middleware(auth)
//!     .input(SerdeValidator::<ById>::new())
//!     .query(|opts: ResolverOptions| async move {
//!         let input: ById = opts.parse_input()?;
//!         find_post(&input.id).await
//!     });
//! ```
//!
//! # Composition
//!
//! Builders can be concatenated. Each side declares the context keys it
//! provides and the metadata keys it reads as a [`Shape`]; declaring the
//! same key with different kinds is a build-time error.
//!
//! ```rust,ignore
//! let authed = Procedure::builder()
//!     .provides::<User>("user")
//!     .use_middleware(auth);
//! let admin = authed.concat(audit_pipeline)?;
//! ```

use crate::context::Context;
use crate::error::{RpcError, RpcResult};
use crate::middleware::{
    Invocation, Middleware, MiddlewareFn, MiddlewareOptions, Next, ProcedureType, RawInputFn,
    from_fn, raw_input, run_chain,
};
use crate::signal::CancellationSignal;
use crate::validation::{Validator, deep_merge, input_middleware, output_middleware};
use crate::value::StreamValue;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Build-time failures of procedures and routers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Incompatible {shape} shape for key \"{key}\": \"{left}\" vs \"{right}\"")]
    IncompatibleShape {
        shape: &'static str,
        key: String,
        left: String,
        right: String,
    },

    #[error("Duplicate key: {0}")]
    DuplicatePath(String),

    #[error("Reserved word used in router path \"{path}\": \"{segment}\"")]
    ReservedWord { path: String, segment: String },

    #[error("Invalid procedure path \"{path}\": {reason}")]
    InvalidPath { path: String, reason: String },
}

// =============================================================================
// Shapes
// =============================================================================

/// Declared keys of a context or metadata object, each with a kind name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shape {
    fields: BTreeMap<String, String>,
}

impl Shape {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "This method returns a new Shape and does not modify self"]
    pub fn with(mut self, key: impl Into<String>, kind: impl Into<String>) -> Self {
        self.fields.insert(key.into(), kind.into());
        self
    }

    /// Declare a key whose kind is a Rust type.
    #[must_use = "This method returns a new Shape and does not modify self"]
    pub fn with_type<T: ?Sized>(self, key: impl Into<String>) -> Self {
        self.with(key, std::any::type_name::<T>())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Union of two shapes; fails on a key declared with two kinds.
    fn union(mut self, other: Shape, shape: &'static str) -> Result<Self, BuildError> {
        for (key, kind) in other.fields {
            match self.fields.get(&key) {
                Some(existing) if *existing != kind => {
                    return Err(BuildError::IncompatibleShape {
                        shape,
                        key,
                        left: existing.clone(),
                        right: kind,
                    });
                }
                Some(_) => {}
                None => {
                    self.fields.insert(key, kind);
                }
            }
        }
        Ok(self)
    }
}

// =============================================================================
// Resolvers
// =============================================================================

/// What the resolver of a procedure receives.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub ctx: Context,
    pub input: Value,
    pub path: String,
    pub kind: ProcedureType,
    pub meta: Option<Value>,
    pub signal: CancellationSignal,
}

impl ResolverOptions {
    /// Deserialize the (already validated) input.
    pub fn parse_input<T: DeserializeOwned>(&self) -> RpcResult<T> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| RpcError::bad_request(format!("Invalid input: {e}")))
    }
}

/// Boxed terminal resolver.
pub type Resolver =
    Arc<dyn Fn(ResolverOptions) -> BoxFuture<'static, RpcResult<StreamValue>> + Send + Sync>;

#[derive(Clone)]
enum Stage {
    Middleware(MiddlewareFn),
    Input(Arc<dyn Validator>),
    Output(Arc<dyn Validator>),
}

/// Fluent builder for a [`Procedure`].
#[derive(Clone, Default)]
pub struct ProcedureBuilder {
    stages: Vec<Stage>,
    meta: Option<Value>,
    context_shape: Shape,
    meta_shape: Shape,
}

impl ProcedureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach metadata; objects are merged with metadata set earlier.
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(match self.meta.take() {
            Some(existing) => deep_merge(existing, meta),
            None => meta,
        });
        self
    }

    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn use_middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.stages.push(Stage::Middleware(Arc::new(middleware)));
        self
    }

    /// Append an already boxed middleware.
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn use_boxed(mut self, middleware: MiddlewareFn) -> Self {
        self.stages.push(Stage::Middleware(middleware));
        self
    }

    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn input<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.stages.push(Stage::Input(Arc::new(validator)));
        self
    }

    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn output<V: Validator + 'static>(mut self, validator: V) -> Self {
        self.stages.push(Stage::Output(Arc::new(validator)));
        self
    }

    /// Declare a context key this pipeline provides.
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn provides<T: ?Sized>(mut self, key: impl Into<String>) -> Self {
        self.context_shape = self.context_shape.with_type::<T>(key);
        self
    }

    /// Declare the shape of the context this pipeline provides.
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn context_shape(mut self, shape: Shape) -> Self {
        self.context_shape = shape;
        self
    }

    /// Declare the shape of the metadata this pipeline reads.
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn meta_shape(mut self, shape: Shape) -> Self {
        self.meta_shape = shape;
        self
    }

    /// Append every stage of `other` after this builder's stages.
    ///
    /// # Errors
    ///
    /// [`BuildError::IncompatibleShape`] when both sides declare the same
    /// context or metadata key with different kinds.
    pub fn concat(mut self, other: ProcedureBuilder) -> Result<Self, BuildError> {
        self.context_shape = self.context_shape.union(other.context_shape, "context")?;
        self.meta_shape = self.meta_shape.union(other.meta_shape, "meta")?;
        if let Some(meta) = other.meta {
            self = self.meta(meta);
        }
        self.stages.extend(other.stages);
        debug!(stages = self.stages.len(), "Concatenated procedure pipelines");
        Ok(self)
    }

    pub fn query<F, Fut, R>(self, resolver: F) -> Procedure
    where
        F: Fn(ResolverOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<R>> + Send + 'static,
        R: Into<StreamValue> + 'static,
    {
        self.build(ProcedureType::Query, boxed_resolver(resolver))
    }

    pub fn mutation<F, Fut, R>(self, resolver: F) -> Procedure
    where
        F: Fn(ResolverOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<R>> + Send + 'static,
        R: Into<StreamValue> + 'static,
    {
        self.build(ProcedureType::Mutation, boxed_resolver(resolver))
    }

    /// Seal a subscription. The resolver should return a lazy sequence.
    pub fn subscription<F, Fut, R>(self, resolver: F) -> Procedure
    where
        F: Fn(ResolverOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<R>> + Send + 'static,
        R: Into<StreamValue> + 'static,
    {
        self.build(ProcedureType::Subscription, boxed_resolver(resolver))
    }

    fn build(self, kind: ProcedureType, resolver: Resolver) -> Procedure {
        let mut seen_input = false;
        let mut chain: Vec<MiddlewareFn> = self
            .stages
            .into_iter()
            .map(|stage| match stage {
                Stage::Middleware(middleware) => middleware,
                Stage::Input(validator) => {
                    let first = !seen_input;
                    seen_input = true;
                    input_middleware(validator, first)
                }
                Stage::Output(validator) => output_middleware(validator),
            })
            .collect();
        chain.push(terminal_stage(resolver));
        trace!(kind = %kind, stages = chain.len(), "Built procedure");

        Procedure {
            kind,
            chain: chain.into(),
            meta: self.meta,
            context_shape: self.context_shape,
            meta_shape: self.meta_shape,
        }
    }
}

impl fmt::Debug for ProcedureBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureBuilder")
            .field("stages", &self.stages.len())
            .field("meta", &self.meta)
            .field("context_shape", &self.context_shape)
            .field("meta_shape", &self.meta_shape)
            .finish()
    }
}

fn boxed_resolver<F, Fut, R>(resolver: F) -> Resolver
where
    F: Fn(ResolverOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<R>> + Send + 'static,
    R: Into<StreamValue> + 'static,
{
    Arc::new(move |opts| {
        let fut = resolver(opts);
        Box::pin(async move { fut.await.map(Into::into) })
    })
}

fn terminal_stage(resolver: Resolver) -> MiddlewareFn {
    from_fn(move |opts: MiddlewareOptions, next: Next| {
        let resolver = Arc::clone(&resolver);
        async move {
            let MiddlewareOptions {
                ctx,
                input,
                path,
                kind,
                meta,
                signal,
                ..
            } = opts;
            let value = resolver(ResolverOptions {
                ctx,
                input,
                path,
                kind,
                meta,
                signal,
            })
            .await?;
            Ok(next.ok(value))
        }
    })
}

// =============================================================================
// Procedure
// =============================================================================

/// Arguments of one procedure call.
pub struct CallOptions {
    pub ctx: Context,
    pub path: String,
    pub kind: ProcedureType,
    pub raw_input: RawInputFn,
    pub signal: CancellationSignal,
}

impl CallOptions {
    pub fn new(path: impl Into<String>, kind: ProcedureType, input: Value) -> Self {
        Self {
            ctx: Context::new(),
            path: path.into(),
            kind,
            raw_input: raw_input(input),
            signal: CancellationSignal::new(),
        }
    }

    #[must_use = "This method returns a new CallOptions and does not modify self"]
    pub fn with_ctx(mut self, ctx: Context) -> Self {
        self.ctx = ctx;
        self
    }

    #[must_use = "This method returns a new CallOptions and does not modify self"]
    pub fn with_signal(mut self, signal: CancellationSignal) -> Self {
        self.signal = signal;
        self
    }

    #[must_use = "This method returns a new CallOptions and does not modify self"]
    pub fn with_raw_input(mut self, raw_input: RawInputFn) -> Self {
        self.raw_input = raw_input;
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A sealed procedure. Immutable once built.
pub struct Procedure {
    kind: ProcedureType,
    chain: Arc<[MiddlewareFn]>,
    meta: Option<Value>,
    context_shape: Shape,
    meta_shape: Shape,
}

impl Procedure {
    pub fn builder() -> ProcedureBuilder {
        ProcedureBuilder::new()
    }

    pub fn kind(&self) -> ProcedureType {
        self.kind
    }

    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    pub fn context_shape(&self) -> &Shape {
        &self.context_shape
    }

    pub fn meta_shape(&self) -> &Shape {
        &self.meta_shape
    }

    /// Run the pipeline.
    ///
    /// The resolver sees the raw input unless an input validator replaced
    /// it. Errors carry the call path.
    pub async fn invoke(&self, call: CallOptions) -> RpcResult<StreamValue> {
        let CallOptions {
            ctx,
            path,
            kind,
            raw_input,
            signal,
        } = call;
        if kind != self.kind {
            return Err(RpcError::not_found(format!(
                "No \"{kind}\"-procedure on path \"{path}\""
            ))
            .with_path(path));
        }

        let input = raw_input().await.map_err(|e| e.with_path(path.clone()))?;
        let invocation = Invocation {
            ctx,
            path: path.clone(),
            kind,
            meta: self.meta.clone(),
            input,
            raw_input,
            signal,
        };
        run_chain(Arc::clone(&self.chain), invocation)
            .await
            .map_err(|e| e.with_path(path))
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("kind", &self.kind)
            .field("stages", &self.chain.len())
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcErrorCode;
    use crate::validation::SerdeValidator;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct ById {
        id: String,
    }

    #[derive(Serialize, Deserialize)]
    struct WithLimit {
        limit: u32,
    }

    #[tokio::test]
    async fn test_resolver_sees_raw_input_without_validator() {
        let echo = Procedure::builder().query(|opts: ResolverOptions| async move {
            Ok::<_, RpcError>(opts.input)
        });
        let out = echo
            .invoke(CallOptions::new("echo", ProcedureType::Query, json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(out.to_plain_json(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_chained_inputs_are_deep_merged() {
        let proc = Procedure::builder()
            .input(SerdeValidator::<ById>::new())
            .input(SerdeValidator::<WithLimit>::new())
            .query(|opts: ResolverOptions| async move { Ok::<_, RpcError>(opts.input) });
        let out = proc
            .invoke(CallOptions::new(
                "list",
                ProcedureType::Query,
                json!({"id": "a", "limit": 3, "ignored": true}),
            ))
            .await
            .unwrap();
        assert_eq!(out.to_plain_json(), Some(json!({"id": "a", "limit": 3})));
    }

    #[tokio::test]
    async fn test_invalid_input_is_bad_request() {
        let proc = Procedure::builder()
            .input(SerdeValidator::<ById>::new())
            .query(|_opts: ResolverOptions| async move { Ok::<_, RpcError>(json!(null)) });
        let err = proc
            .invoke(CallOptions::new("post.byId", ProcedureType::Query, json!({"id": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::BadRequest);
        assert!(err.cause.is_some());
        assert_eq!(err.path.as_deref(), Some("post.byId"));
    }

    #[tokio::test]
    async fn test_invalid_output_is_internal() {
        let proc = Procedure::builder()
            .output(SerdeValidator::<ById>::new())
            .query(|_opts: ResolverOptions| async move { Ok::<_, RpcError>(json!({"nope": 1})) });
        let err = proc
            .invoke(CallOptions::new("bad", ProcedureType::Query, json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::InternalServerError);
        assert_eq!(err.message, "Output validation failed");
    }

    #[tokio::test]
    async fn test_wrong_kind_is_not_found() {
        let proc = Procedure::builder()
            .mutation(|_opts: ResolverOptions| async move { Ok::<_, RpcError>(json!(1)) });
        let err = proc
            .invoke(CallOptions::new("post.add", ProcedureType::Query, json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NotFound);
        assert_eq!(err.message, "No \"query\"-procedure on path \"post.add\"");
    }

    #[test]
    fn test_concat_rejects_incompatible_shapes() {
        let a = Procedure::builder().provides::<String>("user");
        let b = Procedure::builder().provides::<u64>("user");
        let err = a.concat(b).unwrap_err();
        assert!(matches!(err, BuildError::IncompatibleShape { shape: "context", .. }));

        let a = Procedure::builder().meta_shape(Shape::new().with("role", "string"));
        let b = Procedure::builder()
            .meta_shape(Shape::new().with("role", "string").with("audit", "bool"))
            .meta(json!({"audit": true}));
        let merged = a.concat(b).unwrap();
        let proc = merged.query(|_opts: ResolverOptions| async move { Ok::<_, RpcError>(json!(1)) });
        assert_eq!(proc.meta_shape().get("audit"), Some("bool"));
        assert_eq!(proc.meta(), Some(&json!({"audit": true})));
    }

    #[tokio::test]
    async fn test_meta_visible_to_middleware() {
        let proc = Procedure::builder()
            .meta(json!({"role": "admin"}))
            .use_middleware(|opts: MiddlewareOptions, next: Next| async move {
                match opts.meta.as_ref().and_then(|m| m.get("role")) {
                    Some(role) if role == "admin" => Ok(next.run().await),
                    _ => Err(RpcError::forbidden("admins only")),
                }
            })
            .query(|_opts: ResolverOptions| async move { Ok::<_, RpcError>(json!("ok")) });
        let out = proc
            .invoke(CallOptions::new("admin.ping", ProcedureType::Query, json!(null)))
            .await
            .unwrap();
        assert_eq!(out.to_plain_json(), Some(json!("ok")));
    }
}
