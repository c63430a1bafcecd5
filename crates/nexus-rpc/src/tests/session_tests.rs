//! Session tests: subscriptions over envelopes, resume, stop, keep-alive
//! and connection-level failures.

use crate::config::{KeepAliveConfig, RpcConfig};
use crate::context::Context;
use crate::envelope::{EnvelopeId, RequestEnvelope, ResponseEnvelope, ResultType};
use crate::error::RpcError;
use crate::middleware::ProcedureType;
use crate::procedure::{Procedure, ResolverOptions};
use crate::router::Router;
use crate::session::{ConnectionInfo, Outbound, Session, SessionOutput, SessionState};
use crate::value::{LazySequence, StreamValue, tracked};
use crate::RpcErrorCode;
use futures::stream::{self, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// =============================================================================
// Fixtures
// =============================================================================

/// Events 1..=5, skipping everything up to `lastEventId`.
fn numbers() -> Procedure {
    Procedure::builder().subscription(|opts: ResolverOptions| async move {
        let after = opts
            .input
            .get("lastEventId")
            .and_then(Value::as_str)
            .and_then(|id| id.parse::<u64>().ok())
            .unwrap_or(0);
        let events = (after + 1..=5).map(|n| Ok(tracked(n.to_string(), json!({"n": n}))));
        Ok::<_, RpcError>(LazySequence::new(stream::iter(events)))
    })
}

/// One element, then silence until stopped. Sets the flag on cleanup.
fn forever(cleaned: Arc<AtomicBool>) -> Procedure {
    Procedure::builder().subscription(move |_opts: ResolverOptions| {
        let cleaned = Arc::clone(&cleaned);
        async move {
            let first = Ok::<_, RpcError>(StreamValue::Json(json!("hello")));
            let events = stream::iter(vec![first]).chain(stream::pending());
            Ok::<_, RpcError>(
                LazySequence::new(events).with_cleanup(move || cleaned.store(true, Ordering::SeqCst)),
            )
        }
    })
}

fn router_with(config: RpcConfig, cleaned: Arc<AtomicBool>) -> Router {
    Router::builder()
        .procedure("numbers", numbers())
        .procedure("forever", forever(cleaned))
        .procedure(
            "echo",
            Procedure::builder()
                .query(|opts: ResolverOptions| async move { Ok::<_, RpcError>(opts.input) }),
        )
        .procedure(
            "leaky",
            Procedure::builder().query(|_opts: ResolverOptions| async move {
                Ok::<_, RpcError>(LazySequence::from_values(vec![json!(1)]))
            }),
        )
        .procedure(
            "flaky",
            Procedure::builder().subscription(|_opts: ResolverOptions| async move {
                let events = vec![
                    Ok(StreamValue::Json(json!(1))),
                    Err(RpcError::forbidden("no more")),
                ];
                Ok::<_, RpcError>(LazySequence::new(stream::iter(events)))
            }),
        )
        .procedure(
            "plain",
            Procedure::builder()
                .subscription(|_opts: ResolverOptions| async move { Ok::<_, RpcError>(json!(1)) }),
        )
        .config(config)
        .build()
        .unwrap()
}

fn open(config: RpcConfig) -> (Arc<Session>, SessionOutput, Arc<AtomicBool>) {
    let cleaned = Arc::new(AtomicBool::new(false));
    let router = router_with(config, Arc::clone(&cleaned));
    let (session, output) = Session::new(router, |_info: ConnectionInfo| async {
        Ok::<_, RpcError>(Context::new())
    });
    (session, output, cleaned)
}

async fn next(output: &mut SessionOutput) -> Option<Outbound> {
    tokio::time::timeout(Duration::from_secs(5), output.next())
        .await
        .expect("session output stalled")
}

async fn next_message(output: &mut SessionOutput) -> ResponseEnvelope {
    match next(output).await {
        Some(Outbound::Message(envelope)) => envelope,
        other => panic!("expected a message, got {other:?}"),
    }
}

fn text(request: &RequestEnvelope) -> String {
    serde_json::to_string(request).unwrap()
}

fn subscribe(id: i64, path: &str) -> RequestEnvelope {
    RequestEnvelope::call(id, ProcedureType::Subscription, path, Value::Null)
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn test_subscription_streams_then_stops() {
    let (session, mut output, _) = open(RpcConfig::default());
    session.on_message(&text(&subscribe(1, "numbers"))).await;

    assert_eq!(next_message(&mut output).await, ResponseEnvelope::started(Some(1.into())));
    for n in 1..=5 {
        assert_eq!(
            next_message(&mut output).await,
            ResponseEnvelope::tracked(Some(1.into()), n.to_string(), json!({"n": n}))
        );
    }
    assert_eq!(next_message(&mut output).await, ResponseEnvelope::stopped(Some(1.into())));
    assert!(session.active_subscriptions().is_empty());
}

#[tokio::test]
async fn test_resume_from_last_event_id() {
    let (session, mut output, _) = open(RpcConfig::default());
    let request = subscribe(7, "numbers").with_last_event_id("3");
    session.on_message(&text(&request)).await;

    assert_eq!(next_message(&mut output).await.result_type(), Some(ResultType::Started));
    assert_eq!(
        next_message(&mut output).await,
        ResponseEnvelope::tracked(Some(7.into()), "4".to_string(), json!({"n": 4}))
    );
    assert_eq!(
        next_message(&mut output).await,
        ResponseEnvelope::tracked(Some(7.into()), "5".to_string(), json!({"n": 5}))
    );
    assert_eq!(next_message(&mut output).await.result_type(), Some(ResultType::Stopped));
}

#[tokio::test]
async fn test_stop_ends_subscription_and_runs_cleanup() {
    let (session, mut output, cleaned) = open(RpcConfig::default());
    session.on_message(&text(&subscribe(1, "forever"))).await;

    assert_eq!(next_message(&mut output).await.result_type(), Some(ResultType::Started));
    assert_eq!(
        next_message(&mut output).await,
        ResponseEnvelope::data(Some(1.into()), json!("hello"))
    );
    assert_eq!(session.active_subscriptions(), vec![EnvelopeId::Number(1)]);
    assert_eq!(session.subscription_path(&1.into()).as_deref(), Some("forever"));

    session.on_message(&text(&RequestEnvelope::stop(1))).await;
    assert!(session.active_subscriptions().is_empty());
    assert_eq!(next_message(&mut output).await, ResponseEnvelope::stopped(Some(1.into())));
    assert!(cleaned.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_failed_subscription_still_stops() {
    let (session, mut output, _) = open(RpcConfig::default());
    session.on_message(&text(&subscribe(1, "flaky"))).await;

    assert_eq!(next_message(&mut output).await.result_type(), Some(ResultType::Started));
    assert_eq!(
        next_message(&mut output).await,
        ResponseEnvelope::data(Some(1.into()), json!(1))
    );
    let error = next_message(&mut output).await;
    assert_eq!(error.id, Some(1.into()));
    let error = error.into_error().unwrap();
    assert_eq!(error.code, RpcErrorCode::Forbidden);
    assert_eq!(error.path.as_deref(), Some("flaky"));
    assert_eq!(next_message(&mut output).await, ResponseEnvelope::stopped(Some(1.into())));
    assert!(session.active_subscriptions().is_empty());
}

#[tokio::test]
async fn test_duplicate_live_id_is_rejected() {
    let (session, mut output, _) = open(RpcConfig::default());
    session.on_message(&text(&subscribe(1, "forever"))).await;
    assert_eq!(next_message(&mut output).await.result_type(), Some(ResultType::Started));
    next_message(&mut output).await;

    session.on_message(&text(&subscribe(1, "numbers"))).await;
    let error = next_message(&mut output).await;
    assert_eq!(error.id, Some(1.into()));
    let error = error.into_error().unwrap();
    assert_eq!(error.code, RpcErrorCode::BadRequest);
    assert!(error.message.starts_with("Duplicate id"));

    // The original subscription is untouched.
    assert_eq!(session.subscription_path(&1.into()).as_deref(), Some("forever"));
}

#[tokio::test]
async fn test_id_is_reusable_after_completion() {
    let (session, mut output, _) = open(RpcConfig::default());
    session.on_message(&text(&subscribe(1, "numbers").with_last_event_id("4"))).await;
    assert_eq!(next_message(&mut output).await.result_type(), Some(ResultType::Started));
    next_message(&mut output).await;
    assert_eq!(next_message(&mut output).await.result_type(), Some(ResultType::Stopped));

    session.on_message(&text(&subscribe(1, "numbers").with_last_event_id("4"))).await;
    assert_eq!(next_message(&mut output).await.result_type(), Some(ResultType::Started));
}

#[tokio::test]
async fn test_subscription_must_return_sequence() {
    let (session, mut output, _) = open(RpcConfig::default());
    session.on_message(&text(&subscribe(3, "plain"))).await;

    let error = next_message(&mut output).await.into_error().unwrap();
    assert_eq!(error.code, RpcErrorCode::InternalServerError);
    assert!(session.active_subscriptions().is_empty());
}

// =============================================================================
// Calls
// =============================================================================

#[tokio::test]
async fn test_query_and_batched_frame() {
    let (session, mut output, _) = open(RpcConfig::default());
    let frame = serde_json::to_string(&vec![
        RequestEnvelope::call(1, ProcedureType::Query, "echo", json!({"a": 1})),
        RequestEnvelope::call(2, ProcedureType::Query, "numbers", Value::Null),
    ])
    .unwrap();
    session.on_message(&frame).await;

    let mut replies = vec![next_message(&mut output).await, next_message(&mut output).await];
    replies.sort_by_key(|r| r.id.as_ref().map(|id| id.to_string()));

    assert_eq!(replies[0], ResponseEnvelope::data(Some(1.into()), json!({"a": 1})));
    let mismatch = replies.remove(1).into_error().unwrap();
    assert_eq!(mismatch.code, RpcErrorCode::NotFound);
    assert_eq!(mismatch.message, "No \"query\"-procedure on path \"numbers\"");
}

#[tokio::test]
async fn test_query_returning_sequence_is_rejected() {
    let (session, mut output, _) = open(RpcConfig::default());
    let request = RequestEnvelope::call(1, ProcedureType::Query, "leaky", Value::Null);
    session.on_message(&text(&request)).await;

    let error = next_message(&mut output).await.into_error().unwrap();
    assert_eq!(error.code, RpcErrorCode::UnsupportedMediaType);
}

#[tokio::test]
async fn test_missing_id_and_bad_json() {
    let (session, mut output, _) = open(RpcConfig::default());

    session.on_message("{not json").await;
    let error = next_message(&mut output).await;
    assert_eq!(error.id, None);
    assert_eq!(error.into_error().unwrap().code, RpcErrorCode::ParseError);

    session
        .on_message(r#"{"method":"query","params":{"path":"echo"}}"#)
        .await;
    let error = next_message(&mut output).await;
    assert_eq!(error.id, None);
    assert_eq!(error.into_error().unwrap().code, RpcErrorCode::BadRequest);
}

// =============================================================================
// Connection
// =============================================================================

#[tokio::test]
async fn test_ping_is_answered() {
    let (session, mut output, _) = open(RpcConfig::default());
    session.on_message("PING").await;
    assert_eq!(next(&mut output).await, Some(Outbound::Pong));

    // PONG needs no answer; the next frame is the echo reply.
    session.on_message("PONG").await;
    let request = RequestEnvelope::call(1, ProcedureType::Query, "echo", json!(1));
    session.on_message(&text(&request)).await;
    assert_eq!(
        next_message(&mut output).await,
        ResponseEnvelope::data(Some(1.into()), json!(1))
    );
}

#[tokio::test]
async fn test_context_failure_closes_session() {
    let router = router_with(RpcConfig::default(), Arc::new(AtomicBool::new(false)));
    let (session, mut output) = Session::new(router, |_info: ConnectionInfo| async {
        Err::<Context, _>(RpcError::unauthorized("bad token"))
    });
    assert_eq!(session.state(), SessionState::Idle);

    session.on_message(&text(&subscribe(1, "numbers"))).await;
    let error = next_message(&mut output).await;
    assert_eq!(error.id, None);
    assert_eq!(error.into_error().unwrap().code, RpcErrorCode::Unauthorized);
    assert_eq!(next(&mut output).await, None);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_close_aborts_everything() {
    let (session, mut output, cleaned) = open(RpcConfig::default());
    session.on_message(&text(&subscribe(1, "forever"))).await;
    assert_eq!(next_message(&mut output).await.result_type(), Some(ResultType::Started));
    next_message(&mut output).await;
    assert_eq!(session.state(), SessionState::Ready);

    session.on_close();
    session.on_close();
    assert!(session.is_closed());
    assert!(session.active_subscriptions().is_empty());

    // No `stopped` after a close; the output just ends.
    assert_eq!(next(&mut output).await, None);
    assert!(cleaned.load(Ordering::SeqCst));

    session.on_message("PING").await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_pings_and_terminates() {
    let config = RpcConfig::default().with_keep_alive(KeepAliveConfig::enabled(
        Duration::from_secs(30),
        Duration::from_secs(5),
    ));
    let (session, mut output, _) = open(config);

    assert_eq!(output.next().await, Some(Outbound::Ping));
    session.on_message("PONG").await;
    assert_eq!(output.next().await, Some(Outbound::Ping));

    // No answer this time.
    assert_eq!(output.next().await, Some(Outbound::Terminate));
    assert_eq!(output.next().await, None);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_quiet_while_traffic_flows() {
    let config = RpcConfig::default().with_keep_alive(KeepAliveConfig::enabled(
        Duration::from_secs(30),
        Duration::from_secs(5),
    ));
    let (session, mut output, _) = open(config);

    // Idle for 20 of the 30 seconds.
    let idle = tokio::time::timeout(Duration::from_secs(20), output.next()).await;
    assert!(idle.is_err());

    // The pong is outbound traffic and restarts the idle timer.
    session.on_message("PING").await;
    assert_eq!(output.next().await, Some(Outbound::Pong));

    let start = tokio::time::Instant::now();
    assert_eq!(output.next().await, Some(Outbound::Ping));
    assert!(start.elapsed() >= Duration::from_secs(30));
}
