//! Ping/pong keep-alive
//!
//! The session pings after `ping_interval` without outbound traffic, then
//! waits `pong_wait` for any inbound frame. Silence means the peer is gone.

use super::Outbound;
use crate::config::KeepAliveConfig;
use crate::signal::CancellationSignal;
use futures::stream::Stream;
use std::convert::Infallible;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Traffic counters observed by the keep-alive loop.
#[derive(Debug)]
pub(crate) struct Activity {
    outbound: watch::Sender<u64>,
    inbound: watch::Sender<u64>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            outbound: watch::Sender::new(0),
            inbound: watch::Sender::new(0),
        }
    }

    pub(crate) fn touch_outbound(&self) {
        self.outbound.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn touch_inbound(&self) {
        self.inbound.send_modify(|n| *n = n.wrapping_add(1));
    }
}

enum Idle {
    Elapsed,
    Reset,
    Cancelled,
}

enum PongWait {
    Answered,
    TimedOut,
    Cancelled,
}

/// Keep-alive source for the session's outbound merger.
///
/// Yields [`Outbound::Ping`] on idle and [`Outbound::Terminate`] when the
/// peer does not answer; `on_dead` runs right after the terminate frame.
pub(crate) fn keep_alive<F>(
    config: KeepAliveConfig,
    activity: std::sync::Arc<Activity>,
    signal: CancellationSignal,
    on_dead: F,
) -> impl Stream<Item = Result<Outbound, Infallible>> + Send + 'static
where
    F: FnOnce() + Send + 'static,
{
    async_stream::stream! {
        let mut on_dead = Some(on_dead);
        loop {
            let mut outbound = activity.outbound.subscribe();
            let idle = loop {
                let step = tokio::select! {
                    _ = signal.cancelled() => Idle::Cancelled,
                    changed = outbound.changed() => match changed {
                        Ok(()) => Idle::Reset,
                        Err(_) => Idle::Cancelled,
                    },
                    _ = tokio::time::sleep(config.ping_interval) => Idle::Elapsed,
                };
                match step {
                    Idle::Reset => continue,
                    other => break other,
                }
            };
            if matches!(idle, Idle::Cancelled) {
                return;
            }

            let mut inbound = activity.inbound.subscribe();
            trace!("Session idle; sending ping");
            yield Ok(Outbound::Ping);

            let answer = tokio::select! {
                _ = signal.cancelled() => PongWait::Cancelled,
                changed = inbound.changed() => match changed {
                    Ok(()) => PongWait::Answered,
                    Err(_) => PongWait::Cancelled,
                },
                _ = tokio::time::sleep(config.pong_wait) => PongWait::TimedOut,
            };
            match answer {
                PongWait::Answered => continue,
                PongWait::Cancelled => return,
                PongWait::TimedOut => {
                    debug!(pong_wait_ms = config.pong_wait.as_millis() as u64, "No pong; terminating session");
                    yield Ok(Outbound::Terminate);
                    if let Some(on_dead) = on_dead.take() {
                        on_dead();
                    }
                    return;
                }
            }
        }
    }
}
