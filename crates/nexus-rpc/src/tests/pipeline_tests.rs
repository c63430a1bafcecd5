//! Pipeline tests: context threading, input replacement and failure
//! normalization across chained middleware.

use crate::error::RpcError;
use crate::middleware::{MiddlewareOptions, Next, NextOptions, ProcedureType, raw_input};
use crate::procedure::{CallOptions, Procedure, ResolverOptions};
use crate::validation::SerdeValidator;
use crate::RpcErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

fn call(path: &str, input: Value) -> CallOptions {
    CallOptions::new(path, ProcedureType::Query, input)
}

// =============================================================================
// Context
// =============================================================================

#[tokio::test]
async fn test_context_flows_downstream_only() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let m1_seen = Arc::clone(&seen);
    let m2_seen = Arc::clone(&seen);
    let r_seen = Arc::clone(&seen);
    let proc = Procedure::builder()
        .use_middleware(move |opts: MiddlewareOptions, next: Next| {
            let seen = Arc::clone(&m1_seen);
            async move {
                let result = next.run_with(NextOptions::new().with_ctx("m1", 1u32)).await;
                // Keys added further down never leak back up.
                seen.lock().unwrap().push(format!("m1 after: m2={}", opts.ctx.contains("m2")));
                Ok(result)
            }
        })
        .use_middleware(move |opts: MiddlewareOptions, next: Next| {
            let seen = Arc::clone(&m2_seen);
            async move {
                seen.lock().unwrap().push(format!("m2: m1={}", opts.ctx.contains("m1")));
                Ok(next.run_with(NextOptions::new().with_ctx("m2", "two".to_string())).await)
            }
        })
        .query(move |opts: ResolverOptions| {
            let seen = Arc::clone(&r_seen);
            async move {
                let m1 = opts.ctx.get::<u32>("m1").copied();
                let m2 = opts.ctx.get::<String>("m2").cloned();
                seen.lock().unwrap().push(format!("resolver: m1={m1:?} m2={m2:?}"));
                Ok::<_, RpcError>(json!(null))
            }
        });

    proc.invoke(call("ctx", json!(null))).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            "m2: m1=true".to_string(),
            "resolver: m1=Some(1) m2=Some(\"two\")".to_string(),
            "m1 after: m2=false".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_call_context_is_visible_everywhere() {
    let proc = Procedure::builder()
        .use_middleware(|opts: MiddlewareOptions, next: Next| async move {
            if opts.ctx.get::<String>("user").is_none() {
                return Err(RpcError::unauthorized("login required"));
            }
            Ok(next.run().await)
        })
        .query(|opts: ResolverOptions| async move {
            Ok::<_, RpcError>(json!(opts.ctx.get::<String>("user").cloned()))
        });

    let anonymous = proc.invoke(call("me", json!(null))).await.unwrap_err();
    assert_eq!(anonymous.code, RpcErrorCode::Unauthorized);
    assert_eq!(anonymous.path.as_deref(), Some("me"));

    let ctx = crate::Context::new().with("user", "ada".to_string());
    let out = proc
        .invoke(call("me", json!(null)).with_ctx(ctx))
        .await
        .unwrap();
    assert_eq!(out.to_plain_json(), Some(json!("ada")));
}

// =============================================================================
// Input
// =============================================================================

#[derive(Serialize, Deserialize)]
struct Page {
    page: u32,
}

#[tokio::test]
async fn test_middleware_can_replace_raw_input() {
    let proc = Procedure::builder()
        .use_middleware(|opts: MiddlewareOptions, next: Next| async move {
            let mut input = opts.raw_input().await?;
            if input.get("page").is_none() {
                input = json!({"page": 1});
            }
            Ok(next.run_with(NextOptions::new().with_raw_input(raw_input(input))).await)
        })
        .input(SerdeValidator::<Page>::new())
        .query(|opts: ResolverOptions| async move {
            let page: Page = opts.parse_input()?;
            Ok::<_, RpcError>(json!(page.page))
        });

    let out = proc.invoke(call("list", json!({}))).await.unwrap();
    assert_eq!(out.to_plain_json(), Some(json!(1)));

    let out = proc.invoke(call("list", json!({"page": 4}))).await.unwrap();
    assert_eq!(out.to_plain_json(), Some(json!(4)));
}

#[tokio::test]
async fn test_raw_input_survives_parsing() {
    let proc = Procedure::builder()
        .input(SerdeValidator::<Page>::new())
        .use_middleware(|opts: MiddlewareOptions, next: Next| async move {
            let raw = opts.raw_input().await?;
            assert_eq!(raw, json!({"page": 2, "extra": true}));
            assert_eq!(opts.input, json!({"page": 2}));
            Ok(next.run().await)
        })
        .query(|opts: ResolverOptions| async move { Ok::<_, RpcError>(opts.input) });

    let out = proc
        .invoke(call("list", json!({"page": 2, "extra": true})))
        .await
        .unwrap();
    assert_eq!(out.to_plain_json(), Some(json!({"page": 2})));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_resolver_panic_becomes_internal() {
    let proc = Procedure::builder().query(|opts: ResolverOptions| async move {
        if opts.input.is_null() {
            panic!("boom");
        }
        Ok::<_, RpcError>(json!(1))
    });

    let err = proc.invoke(call("explode", json!(null))).await.unwrap_err();
    assert_eq!(err.code, RpcErrorCode::InternalServerError);
    assert_eq!(err.path.as_deref(), Some("explode"));
}

#[tokio::test]
async fn test_outer_middleware_can_recover_errors() {
    let proc = Procedure::builder()
        .use_middleware(|_opts: MiddlewareOptions, next: Next| async move {
            let result = next.run().await;
            Ok(result.map_err(|e| {
                if e.code == RpcErrorCode::NotFound {
                    RpcError::bad_request(format!("rewritten: {}", e.message))
                } else {
                    e
                }
            }))
        })
        .query(|_opts: ResolverOptions| async move {
            Err::<Value, _>(RpcError::not_found("missing"))
        });

    let err = proc.invoke(call("find", json!(null))).await.unwrap_err();
    assert_eq!(err.code, RpcErrorCode::BadRequest);
    assert_eq!(err.message, "rewritten: missing");
}
