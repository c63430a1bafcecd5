//! Typed handler adapters
//!
//! [`handler`] turns an `async fn(Context, Input) -> RpcResult<Output>` into a
//! resolver for [`ProcedureBuilder`](crate::procedure::ProcedureBuilder),
//! deserializing the input and serializing the output.
//!
//! ```rust,ignore
//! async fn get_post(ctx: Context, input: ById) -> RpcResult<Post> { .. }
//!
//! let by_id = Procedure::builder()
//!     .input(SerdeValidator::<ById>::new())
//!     .query(handler(get_post));
//! ```

use crate::context::Context;
use crate::error::{RpcError, RpcResult};
use crate::procedure::ResolverOptions;
use crate::value::StreamValue;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::{trace, warn};

/// Trait for handler functions
///
/// Automatically implemented for async functions with the signature:
/// `async fn(Context, Input) -> RpcResult<Output>`
pub trait Handler<Input, Output>: Clone + Send + Sync + 'static
where
    Input: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
{
    type Future: Future<Output = RpcResult<Output>> + Send;

    fn call(&self, ctx: Context, input: Input) -> Self::Future;
}

impl<Input, Output, F, Fut> Handler<Input, Output> for F
where
    Input: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
    F: Fn(Context, Input) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Output>> + Send + 'static,
{
    type Future = Fut;

    fn call(&self, ctx: Context, input: Input) -> Self::Future {
        (self)(ctx, input)
    }
}

/// Adapt a typed handler into a resolver.
pub fn handler<Input, Output, H>(
    handler: H,
) -> impl Fn(ResolverOptions) -> BoxFuture<'static, RpcResult<StreamValue>> + Send + Sync + 'static
where
    Input: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
    H: Handler<Input, Output>,
{
    move |opts: ResolverOptions| {
        let handler = handler.clone();
        Box::pin(async move {
            let input: Input = serde_json::from_value(opts.input).map_err(|e| {
                warn!(path = %opts.path, error = %e, "Handler input deserialization failed");
                RpcError::bad_request(format!("Invalid input: {e}"))
            })?;

            trace!(path = %opts.path, "Executing handler");
            let output = handler.call(opts.ctx, input).await.inspect_err(|e| {
                warn!(path = %opts.path, error_code = %e.code, "Handler execution failed");
            })?;

            StreamValue::from_serialize(&output)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcErrorCode;
    use crate::middleware::ProcedureType;
    use crate::procedure::{CallOptions, Procedure};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    async fn add(_ctx: Context, input: Add) -> RpcResult<i64> {
        Ok(input.a + input.b)
    }

    #[tokio::test]
    async fn test_typed_handler() {
        let proc = Procedure::builder().query(handler(add));
        let out = proc
            .invoke(CallOptions::new("math.add", ProcedureType::Query, json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(out.to_plain_json(), Some(json!(5)));
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_input() {
        let proc = Procedure::builder().query(handler(add));
        let err = proc
            .invoke(CallOptions::new("math.add", ProcedureType::Query, json!({"a": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::BadRequest);
    }
}
