//! End-to-end scenario: a small post service driven through the public API
//!
//! Covers direct calls, the line-framed streaming body and a session
//! subscription with resume.

use futures::StreamExt;
use nexus_rpc::prelude::*;
use nexus_rpc::validation::{Validate, ValidationResult, ValidationRules};
use nexus_rpc::{
    ConnectionInfo, Outbound, RequestEnvelope, ResponseEnvelope, ResultType, Validated,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Test Service
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Post {
    id: String,
    title: String,
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddPost {
    title: String,
    text: String,
}

impl Validate for AddPost {
    fn validate(&self) -> ValidationResult {
        ValidationRules::new()
            .required("title", &self.title)
            .min_length("text", &self.text, 1)
            .build()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ById {
    id: String,
}

type Store = Arc<Mutex<Vec<Post>>>;

fn post_router(store: Store) -> Router {
    let add_store = Arc::clone(&store);
    let find_store = Arc::clone(&store);
    let feed_store = Arc::clone(&store);

    let base = Procedure::builder().use_boxed(logging_middleware(LogConfig::new()));

    let add = base.clone().input(Validated::<AddPost>::new()).mutation(
        move |opts: ResolverOptions| {
            let store = Arc::clone(&add_store);
            async move {
                let input: AddPost = opts.parse_input()?;
                let mut posts = store.lock().unwrap();
                let post = Post {
                    id: (posts.len() + 1).to_string(),
                    title: input.title,
                    text: input.text,
                };
                posts.push(post.clone());
                StreamValue::from_serialize(&post)
            }
        },
    );

    let by_id = base.clone().input(SerdeValidator::<ById>::new()).query(
        move |opts: ResolverOptions| {
            let store = Arc::clone(&find_store);
            async move {
                let input: ById = opts.parse_input()?;
                let posts = store.lock().unwrap();
                let post = posts
                    .iter()
                    .find(|p| p.id == input.id)
                    .ok_or_else(|| RpcError::not_found(format!("No post with id {}", input.id)))?;
                StreamValue::from_serialize(post)
            }
        },
    );

    let on_add = base.subscription(move |opts: ResolverOptions| {
        let store = Arc::clone(&feed_store);
        async move {
            let after = opts
                .input
                .get("lastEventId")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let snapshot = store.lock().unwrap().clone();
            let start = after
                .and_then(|id| snapshot.iter().position(|p| p.id == id))
                .map_or(0, |i| i + 1);
            let events: Vec<RpcResult<StreamValue>> = snapshot[start..]
                .iter()
                .map(|post| Ok(tracked(post.id.clone(), serde_json::to_value(post)?)))
                .collect();
            Ok::<_, RpcError>(LazySequence::new(futures::stream::iter(events)))
        }
    });

    Router::builder()
        .merge(
            "post",
            Router::builder()
                .procedure("add", add)
                .procedure("byId", by_id)
                .procedure("onAdd", on_add),
        )
        .build()
        .unwrap()
}

async fn add_post(router: &Router, title: &str, text: &str) -> Value {
    router
        .call(CallOptions::new(
            "post.add",
            ProcedureType::Mutation,
            json!({"title": title, "text": text}),
        ))
        .await
        .unwrap()
        .to_plain_json()
        .unwrap()
}

// =============================================================================
// Direct Calls
// =============================================================================

#[tokio::test]
async fn test_add_then_find_by_id() {
    let router = post_router(Store::default());

    let created = add_post(&router, "hello", "first post").await;
    assert_eq!(created["id"], json!("1"));

    let found = router
        .call(CallOptions::new(
            "post.byId",
            ProcedureType::Query,
            json!({"id": created["id"]}),
        ))
        .await
        .unwrap()
        .to_plain_json()
        .unwrap();
    assert_eq!(found["title"], json!("hello"));
    assert_eq!(found["text"], json!("first post"));

    let err = router
        .call(CallOptions::new("post.byId", ProcedureType::Query, json!({"id": "42"})))
        .await
        .unwrap_err();
    assert_eq!(err.code, RpcErrorCode::NotFound);
    assert_eq!(err.path.as_deref(), Some("post.byId"));
}

#[tokio::test]
async fn test_invalid_post_is_rejected() {
    let router = post_router(Store::default());
    let err = router
        .call(CallOptions::new(
            "post.add",
            ProcedureType::Mutation,
            json!({"title": "", "text": ""}),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code, RpcErrorCode::BadRequest);
}

// =============================================================================
// Streaming Body
// =============================================================================

#[tokio::test]
async fn test_result_round_trips_over_jsonl() {
    let router = post_router(Store::default());
    add_post(&router, "a", "one").await;

    let value = router
        .call(CallOptions::new("post.byId", ProcedureType::Query, json!({"id": "1"})))
        .await
        .unwrap();
    let lazy = StreamValue::object([
        ("post", value),
        (
            "related",
            StreamValue::deferred(async { Ok(json!(["b", "c"]).into()) }),
        ),
    ]);

    let body = Box::pin(to_jsonl(encode(
        [("0".to_string(), lazy)],
        EncoderOptions::from_config(router.config()),
    )));
    let mut decoded = decode(body).await.unwrap();
    let root = decoded.values.remove("0").unwrap().resolve_all().await.unwrap();
    assert_eq!(
        root,
        json!({"post": {"id": "1", "title": "a", "text": "one"}, "related": ["b", "c"]})
    );
}

// =============================================================================
// Session
// =============================================================================

#[tokio::test]
async fn test_subscription_resumes_after_last_seen_post() {
    let store = Store::default();
    let router = post_router(Arc::clone(&store));
    for n in 1..=3 {
        add_post(&router, &format!("post {n}"), "body").await;
    }

    let (session, mut output) = Session::new(router, |_info: ConnectionInfo| async {
        Ok::<_, RpcError>(Context::new())
    });
    let request = RequestEnvelope::call(1, ProcedureType::Subscription, "post.onAdd", Value::Null)
        .with_last_event_id("1");
    session
        .on_message(&serde_json::to_string(&request).unwrap())
        .await;

    let mut received = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), output.next())
            .await
            .unwrap();
        let Some(Outbound::Message(envelope)) = next else {
            panic!("unexpected outbound frame");
        };
        let kind = envelope.result_type();
        received.push(envelope);
        if kind == Some(ResultType::Stopped) {
            break;
        }
    }

    assert_eq!(received.len(), 4);
    assert_eq!(received[0], ResponseEnvelope::started(Some(1.into())));
    assert_eq!(received[1].result_type(), Some(ResultType::Data));
    assert_eq!(
        serde_json::to_value(&received[1]).unwrap()["result"]["id"],
        json!("2")
    );
    assert_eq!(
        serde_json::to_value(&received[2]).unwrap()["result"]["data"]["data"]["title"],
        json!("post 3")
    );
}
