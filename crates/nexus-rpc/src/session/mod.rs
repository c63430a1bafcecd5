//! Persistent-connection sessions
//!
//! A [`Session`] serves one socket-like connection. The transport adapter
//! feeds inbound text frames to [`Session::on_message`], writes every
//! [`Outbound`] item of the session's output stream, and calls
//! [`Session::on_close`] when the connection drops.
//!
//! ```text
//! Idle -> ContextPending -> Ready -> Closed
//!                   \_________________/
//!                  context creation failed
//! ```
//!
//! Every reply, every live subscription and the keep-alive loop are sources
//! of one [`Merger`], so outbound frames are interleaved in completion order.
//!
//! # Example
//! ```rust,ignore
//! let (session, mut output) = Session::new(router, |info: ConnectionInfo| async move {
//!     Ok(Context::new().with("session", info.session_id))
//! });
//!
//! tokio::spawn(async move {
//!     while let Some(frame) = output.next().await {
//!         match frame.to_text() {
//!             Some(text) => socket.send(text).await?,
//!             None => socket.close().await?,
//!         }
//!     }
//! });
//!
//! while let Some(text) = socket.recv().await {
//!     session.on_message(&text).await;
//! }
//! session.on_close();
//! ```

mod id;
mod keepalive;

pub use id::{SessionId, SessionIdError};

use crate::context::Context;
use crate::envelope::{EnvelopeId, Method, RequestEnvelope, ResponseEnvelope, parse_requests};
use crate::error::{ErrorConfig, RpcError, RpcResult};
use crate::middleware::ProcedureType;
use crate::procedure::CallOptions;
use crate::router::Router;
use crate::signal::CancellationSignal;
use crate::stream::merge::{Merger, MergerHandle};
use crate::value::StreamValue;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{self, BoxStream, StreamExt};
use keepalive::{Activity, keep_alive};
use serde_json::Value;
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OnceCell, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};

// =============================================================================
// Context Creation
// =============================================================================

/// What context creation knows about the connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub session_id: SessionId,
}

/// Builds the call context of a session, once, on the first message.
#[async_trait]
pub trait CreateContext: Send + Sync {
    async fn create(&self, info: &ConnectionInfo) -> RpcResult<Context>;
}

#[async_trait]
impl<F, Fut> CreateContext for F
where
    F: Fn(ConnectionInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Context>> + Send + 'static,
{
    async fn create(&self, info: &ConnectionInfo) -> RpcResult<Context> {
        self(info.clone()).await
    }
}

// =============================================================================
// Outbound Frames
// =============================================================================

/// One item of a session's output.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ResponseEnvelope),
    Ping,
    Pong,
    /// The peer stopped answering pings; close the connection.
    Terminate,
}

impl Outbound {
    /// Text frame for the wire; `None` for [`Outbound::Terminate`].
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Message(envelope) => match serde_json::to_string(envelope) {
                Ok(text) => Some(text),
                Err(e) => {
                    error!(error = %e, "Failed to serialize response envelope");
                    None
                }
            },
            Self::Ping => Some("PING".to_string()),
            Self::Pong => Some("PONG".to_string()),
            Self::Terminate => None,
        }
    }
}

/// Output stream of a session. Ends once the session is closed.
pub type SessionOutput = BoxStream<'static, Outbound>;

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ContextPending,
    Ready,
    Closed,
}

struct SubscriptionEntry {
    path: String,
    signal: CancellationSignal,
}

/// State of one persistent connection.
pub struct Session {
    id: SessionId,
    router: Router,
    errors: ErrorConfig,
    create_context: Box<dyn CreateContext>,
    ctx: OnceCell<RpcResult<Context>>,
    subscriptions: DashMap<EnvelopeId, SubscriptionEntry>,
    signal: CancellationSignal,
    sources: MergerHandle<Outbound, Infallible>,
    direct: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    activity: Arc<Activity>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

impl Session {
    /// Open a session and return it with its output stream.
    pub fn new<C>(router: Router, create_context: C) -> (Arc<Self>, SessionOutput)
    where
        C: CreateContext + 'static,
    {
        let merger = Merger::<Outbound, Infallible>::new();
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        merger.add(UnboundedReceiverStream::new(direct_rx).map(Ok));

        let config = router.config().clone();
        let activity = Arc::new(Activity::new());
        let session = Arc::new(Self {
            id: SessionId::new(),
            router,
            errors: config.errors.clone(),
            create_context: Box::new(create_context),
            ctx: OnceCell::new(),
            subscriptions: DashMap::new(),
            signal: CancellationSignal::new(),
            sources: merger.handle(),
            direct: Mutex::new(Some(direct_tx)),
            activity: Arc::clone(&activity),
            state: Mutex::new(SessionState::Idle),
            closed: AtomicBool::new(false),
        });

        if config.keep_alive.enabled {
            let weak = Arc::downgrade(&session);
            merger.add(keep_alive(
                config.keep_alive.clone(),
                Arc::clone(&activity),
                session.signal.child(),
                move || {
                    if let Some(session) = weak.upgrade() {
                        session.on_close();
                    }
                },
            ));
        }

        let output = match merger.stream() {
            Ok(merged) => merged
                .map(move |item| match item {
                    Ok(outbound) => {
                        if matches!(outbound, Outbound::Message(_) | Outbound::Pong) {
                            activity.touch_outbound();
                        }
                        outbound
                    }
                    Err(never) => match never {},
                })
                .boxed(),
            Err(e) => {
                error!(error = %e, "Fresh merger refused iteration");
                stream::empty().boxed()
            }
        };

        info!(session_id = %session.id, keep_alive = config.keep_alive.enabled, "Session opened");
        (session, output)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ids of the subscriptions currently streaming.
    pub fn active_subscriptions(&self) -> Vec<EnvelopeId> {
        self.subscriptions.iter().map(|e| e.key().clone()).collect()
    }

    /// Path of a live subscription.
    pub fn subscription_path(&self, id: &EnvelopeId) -> Option<String> {
        self.subscriptions.get(id).map(|e| e.path.clone())
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    fn send(&self, outbound: Outbound) {
        let direct = self.direct.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = direct.as_ref().is_some_and(|tx| tx.send(outbound).is_ok());
        if !sent {
            trace!(session_id = %self.id, "Session output gone; discarding frame");
        }
    }

    fn send_error(&self, id: Option<EnvelopeId>, error: &RpcError) {
        self.send(Outbound::Message(ResponseEnvelope::error(id, error, &self.errors)));
    }

    /// Resolve the session context, once.
    async fn context(&self) -> RpcResult<Context> {
        self.ctx
            .get_or_init(|| async {
                self.set_state(SessionState::ContextPending);
                let info = ConnectionInfo {
                    session_id: self.id,
                };
                let result = self.create_context.create(&info).await;
                match &result {
                    Ok(_) => self.set_state(SessionState::Ready),
                    Err(e) => warn!(session_id = %self.id, code = %e.code, "Context creation failed"),
                }
                result
            })
            .await
            .clone()
    }

    /// Handle one inbound text frame.
    pub async fn on_message(self: &Arc<Self>, text: &str) {
        if self.is_closed() {
            trace!(session_id = %self.id, "Ignoring frame on closed session");
            return;
        }
        self.activity.touch_inbound();
        match text {
            "PING" => {
                self.send(Outbound::Pong);
                return;
            }
            "PONG" => return,
            _ => {}
        }

        let requests = match parse_requests(text) {
            Ok(requests) => requests,
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "Unparseable frame");
                let error = RpcError::parse_error("Unable to parse message").with_cause(e.to_string());
                self.send_error(None, &error);
                return;
            }
        };

        let ctx = match self.context().await {
            Ok(ctx) => ctx,
            Err(error) => {
                if !self.is_closed() {
                    self.send_error(None, &error);
                    self.on_close();
                }
                return;
            }
        };

        for request in requests {
            self.handle_request(&ctx, request);
        }
    }

    fn handle_request(self: &Arc<Self>, ctx: &Context, request: RequestEnvelope) {
        let RequestEnvelope { id, method, params } = request;
        let Some(id) = id else {
            self.send_error(None, &RpcError::bad_request("`id` is required"));
            return;
        };

        let Some(kind) = method.procedure_type() else {
            debug_assert_eq!(method, Method::SubscriptionStop);
            if let Some((_, entry)) = self.subscriptions.remove(&id) {
                debug!(session_id = %self.id, subscription_id = %id, path = %entry.path, "Stopping subscription");
                entry.signal.cancel();
            }
            return;
        };

        let input = match (kind, params.last_event_id) {
            (ProcedureType::Subscription, Some(last)) => merge_last_event_id(params.input, last),
            (_, _) => params.input.unwrap_or(Value::Null),
        };

        if kind == ProcedureType::Subscription {
            let signal = self.signal.child();
            match self.subscriptions.entry(id.clone()) {
                Entry::Occupied(_) => {
                    self.send_error(Some(id.clone()), &RpcError::bad_request(format!("Duplicate id {id}")));
                    return;
                }
                Entry::Vacant(slot) => {
                    slot.insert(SubscriptionEntry {
                        path: params.path.clone(),
                        signal: signal.clone(),
                    });
                }
            }
            let call = CallOptions::new(params.path, kind, input)
                .with_ctx(ctx.clone())
                .with_signal(signal.clone());
            self.sources.add(self.subscription_source(id, call, signal));
        } else {
            let call = CallOptions::new(params.path, kind, input)
                .with_ctx(ctx.clone())
                .with_signal(self.signal.child());
            self.sources.add(self.call_source(id, call));
        }
    }

    fn call_source(
        self: &Arc<Self>,
        id: EnvelopeId,
        call: CallOptions,
    ) -> impl futures::Stream<Item = Result<Outbound, Infallible>> + Send + 'static {
        let session = Arc::clone(self);
        async_stream::stream! {
            let signal = call.signal.clone();
            let path = call.path.clone();
            let run = async {
                match session.router.call(call).await? {
                    StreamValue::Sequence(_) => Err(RpcError::unsupported_media_type(
                        "Cannot return a lazy sequence from a non-subscription call",
                    )
                    .with_path(path.clone())),
                    value => value.resolve_all().await,
                }
            };
            let outcome = tokio::select! {
                _ = signal.cancelled() => None,
                outcome = run => Some(outcome),
            };
            let envelope = match outcome {
                None => return,
                Some(Ok(data)) => ResponseEnvelope::data(Some(id), data),
                Some(Err(error)) => {
                    debug!(path = %path, code = %error.code, "Call failed");
                    ResponseEnvelope::error(Some(id), &error, &session.errors)
                }
            };
            yield Ok(Outbound::Message(envelope));
        }
    }

    fn subscription_source(
        self: &Arc<Self>,
        id: EnvelopeId,
        call: CallOptions,
        signal: CancellationSignal,
    ) -> impl futures::Stream<Item = Result<Outbound, Infallible>> + Send + 'static {
        let session = Arc::clone(self);
        async_stream::stream! {
            let path = call.path.clone();
            let started = tokio::select! {
                _ = signal.cancelled() => None,
                result = session.router.call(call) => Some(result),
            };
            let mut sequence = match started {
                None => {
                    session.forget_subscription(&id, &signal);
                    return;
                }
                Some(Ok(StreamValue::Sequence(sequence))) => sequence,
                Some(Ok(_)) => {
                    session.forget_subscription(&id, &signal);
                    let error = RpcError::internal(format!(
                        "Subscription {path} did not return a lazy sequence"
                    ))
                    .with_path(path.clone());
                    yield Ok(Outbound::Message(ResponseEnvelope::error(Some(id), &error, &session.errors)));
                    return;
                }
                Some(Err(error)) => {
                    session.forget_subscription(&id, &signal);
                    yield Ok(Outbound::Message(ResponseEnvelope::error(Some(id), &error, &session.errors)));
                    return;
                }
            };

            debug!(session_id = %session.id, subscription_id = %id, path = %path, "Subscription started");
            yield Ok(Outbound::Message(ResponseEnvelope::started(Some(id.clone()))));

            let mut failed = false;
            loop {
                let item = tokio::select! {
                    biased;
                    _ = signal.cancelled() => None,
                    item = sequence.next() => item,
                };
                let value = match item {
                    None => break,
                    Some(Ok(value)) => value,
                    Some(Err(error)) => {
                        failed = true;
                        yield Ok(Outbound::Message(ResponseEnvelope::error(Some(id.clone()), &error.with_path(path.clone()), &session.errors)));
                        break;
                    }
                };
                let (event_id, data) = match value {
                    StreamValue::Tracked(tracked) => (Some(tracked.id), *tracked.data),
                    other => (None, other),
                };
                match data.resolve_all().await {
                    Ok(data) => {
                        let envelope = match event_id {
                            Some(event_id) => ResponseEnvelope::tracked(Some(id.clone()), event_id, data),
                            None => ResponseEnvelope::data(Some(id.clone()), data),
                        };
                        yield Ok(Outbound::Message(envelope));
                    }
                    Err(error) => {
                        failed = true;
                        yield Ok(Outbound::Message(ResponseEnvelope::error(Some(id.clone()), &error.with_path(path.clone()), &session.errors)));
                        break;
                    }
                }
            }

            drop(sequence);
            session.forget_subscription(&id, &signal);
            debug!(session_id = %session.id, subscription_id = %id, failed, "Subscription ended");
            if !session.is_closed() {
                yield Ok(Outbound::Message(ResponseEnvelope::stopped(Some(id))));
            }
        }
    }

    /// Remove a subscription entry, unless the id was reused since.
    fn forget_subscription(&self, id: &EnvelopeId, signal: &CancellationSignal) {
        self.subscriptions
            .remove_if(id, |_, entry| entry.signal.same_as(signal));
    }

    /// Abort every subscription and in-flight call and end the output.
    ///
    /// Safe to call more than once.
    pub fn on_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Closed);

        let live = self.subscriptions.len();
        self.signal.cancel();
        self.subscriptions.clear();
        self.direct
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(session_id = %self.id, live_subscriptions = live, "Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.signal.cancel();
    }
}

/// Thread a resume position into a subscription's input.
pub fn merge_last_event_id(input: Option<Value>, last_event_id: String) -> Value {
    match input {
        Some(Value::Object(mut map)) => {
            map.insert("lastEventId".to_string(), Value::String(last_event_id));
            Value::Object(map)
        }
        _ => serde_json::json!({ "lastEventId": last_event_id }),
    }
}
