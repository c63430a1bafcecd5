//! Fan-in of dynamically added streams
//!
//! A [`Merger`] multiplexes any number of sources into one output stream.
//! Sources may be added before or while the output is being consumed, from
//! any task holding a [`MergerHandle`].
//!
//! - Items are yielded in first-available order (race, not round-robin).
//! - Each source has at most one pull in flight.
//! - The first `Err` from any source drops every other source (running their
//!   cleanup) and is then yielded as the final item.
//! - The output ends once no source is active and no add is queued.
//!
//! # Example
//! ```rust,ignore
//! use futures::{stream, StreamExt};
//! use nexus_rpc::stream::Merger;
//!
//! let merger = Merger::<u32, String>::new();
//! merger.add(stream::iter(vec![Ok(1), Ok(2)]));
//! merger.add(stream::iter(vec![Ok(3)]));
//! let items: Vec<_> = merger.stream()?.collect().await;
//! ```

use futures::stream::{BoxStream, SelectAll, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

type Source<T, E> = BoxStream<'static, Result<T, E>>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("Cannot iterate twice")]
    AlreadyIterated,
}

/// Cloneable handle for adding sources to a [`Merger`].
pub struct MergerHandle<T, E> {
    tx: mpsc::UnboundedSender<Source<T, E>>,
}

impl<T, E> Clone for MergerHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T, E> fmt::Debug for MergerHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T, E> MergerHandle<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Add a source. Returns false if the merged output is gone, in which
    /// case the source is dropped immediately.
    pub fn add<S>(&self, source: S) -> bool
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        match self.tx.send(source.boxed()) {
            Ok(()) => true,
            Err(_) => {
                trace!("Merger output dropped; discarding added source");
                false
            }
        }
    }

    /// True once the merged output has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Multiplexes many sources into one stream.
pub struct Merger<T, E> {
    handle: MergerHandle<T, E>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Source<T, E>>>>,
}

impl<T, E> Merger<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: MergerHandle { tx },
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn add<S>(&self, source: S) -> bool
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        self.handle.add(source)
    }

    pub fn handle(&self) -> MergerHandle<T, E> {
        self.handle.clone()
    }

    /// Take the merged output.
    ///
    /// # Errors
    ///
    /// [`MergeError::AlreadyIterated`] on every call after the first.
    pub fn stream(&self) -> Result<MergedStream<T, E>, MergeError> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(MergeError::AlreadyIterated)?;
        Ok(MergedStream {
            rx: Some(rx),
            sources: SelectAll::new(),
            done: false,
        })
    }
}

impl<T, E> Default for Merger<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Output of a [`Merger`].
pub struct MergedStream<T, E> {
    rx: Option<mpsc::UnboundedReceiver<Source<T, E>>>,
    sources: SelectAll<Source<T, E>>,
    done: bool,
}

impl<T, E> MergedStream<T, E> {
    /// Number of sources currently being pulled.
    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }

    fn finish(&mut self) {
        self.done = true;
        self.sources = SelectAll::new();
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
    }
}

impl<T, E> Stream for MergedStream<T, E> {
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        // Pick up every queued source before racing.
        if let Some(rx) = this.rx.as_mut() {
            loop {
                match rx.poll_recv(cx) {
                    Poll::Ready(Some(source)) => this.sources.push(source),
                    Poll::Ready(None) => {
                        this.rx = None;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        match this.sources.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(error))) => {
                trace!(
                    remaining = this.sources.len(),
                    "Source failed; stopping remaining sources"
                );
                this.finish();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                // No active source. Anything added since the drain above
                // will have woken us through the receiver.
                let queued = this.rx.as_ref().is_some_and(|rx| !rx.is_empty());
                if queued {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_yields_in_first_available_order() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let a = async_stream::stream! {
            yield Ok::<_, String>("a1");
            let _ = release_rx.await;
            yield Ok("a2");
        };
        let b = stream::iter(vec![Ok::<_, String>("b1")]);

        let merger = Merger::new();
        merger.add(a);
        merger.add(b);
        let mut out = merger.stream().unwrap();

        assert_eq!(out.next().await, Some(Ok("a1")));
        assert_eq!(out.next().await, Some(Ok("b1")));
        release_tx.send(()).unwrap();
        assert_eq!(out.next().await, Some(Ok("a2")));
        assert_eq!(out.next().await, None);
    }

    #[tokio::test]
    async fn test_error_stops_other_sources_first() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        struct Guard(Arc<AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let slow = async_stream::stream! {
            let _guard = Guard(flag);
            futures::future::pending::<()>().await;
            yield Ok::<u32, String>(1);
        };
        let failing = async_stream::stream! {
            tokio::task::yield_now().await;
            yield Err::<u32, String>("boom".to_string());
        };

        let merger = Merger::new();
        merger.add(slow);
        merger.add(failing);
        let mut out = merger.stream().unwrap();

        assert_eq!(out.next().await, Some(Err("boom".to_string())));
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(out.next().await, None);
    }

    #[tokio::test]
    async fn test_add_while_iterating() {
        let merger = Merger::<u32, String>::new();
        let handle = merger.handle();
        let first = async_stream::stream! {
            handle.add(stream::iter(vec![Ok(2)]));
            yield Ok(1);
        };
        merger.add(first);
        let items: Vec<_> = merger.stream().unwrap().collect().await;
        assert_eq!(items, vec![Ok(1), Ok(2)]);
    }

    #[test]
    fn test_cannot_iterate_twice() {
        let merger = Merger::<u32, String>::new();
        assert!(merger.stream().is_ok());
        assert_eq!(merger.stream().err(), Some(MergeError::AlreadyIterated));
    }

    #[tokio::test]
    async fn test_empty_merger_ends() {
        let merger = Merger::<u32, String>::new();
        let items: Vec<_> = merger.stream().unwrap().collect().await;
        assert!(items.is_empty());
    }
}
