//! Dual-path completion
//!
//! Store and lock operations frequently have their answer ready at call time
//! (the record is in memory, the lock is free). [`Completion`] lets them hand
//! the result back without ever suspending, while still supporting the slow
//! path that waits on a lock or on I/O:
//!
//! ```ignore
//! let completion = store.conditional_get(&stxn, &key, timeout, &cancel);
//! if completion.is_synchronous() {
//!     // no continuation registered, no task scheduled
//! }
//! let result = completion.await;
//! ```
//!
//! Callback-style consumers use [`Completion::complete_with`], which invokes
//! the callback exactly once: inline when the result is ready, or later from
//! a spawned task when it is not.

use futures_util::future::BoxFuture;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Result of an operation that may complete synchronously
pub enum Completion<T> {
    /// The result was available at call time
    Ready(T),
    /// The operation suspended; awaiting the future yields the result
    Pending(BoxFuture<'static, T>),
}

impl<T: Send + 'static> Completion<T> {
    /// Wrap an immediately available result
    #[inline]
    pub fn ready(value: T) -> Self {
        Completion::Ready(value)
    }

    /// Wrap a future for the slow path
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Completion::Pending(Box::pin(future))
    }

    /// Whether the result is already available
    #[inline]
    pub fn is_synchronous(&self) -> bool {
        matches!(self, Completion::Ready(_))
    }

    /// Take the result if it is ready, otherwise return `self` unchanged
    pub fn try_ready(self) -> Result<T, Self> {
        match self {
            Completion::Ready(value) => Ok(value),
            pending => Err(pending),
        }
    }

    /// Transform the result, preserving the completion path
    pub fn map<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        match self {
            Completion::Ready(value) => Completion::Ready(f(value)),
            Completion::Pending(future) => Completion::pending(async move { f(future.await) }),
        }
    }

    /// Chain a second dual-path step
    ///
    /// The chain stays synchronous only if both steps are.
    pub fn and_then<U, F>(self, f: F) -> Completion<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Completion<U> + Send + 'static,
    {
        match self {
            Completion::Ready(value) => f(value),
            Completion::Pending(future) => Completion::pending(async move { f(future.await).await }),
        }
    }

    /// Deliver the result to `callback` exactly once
    ///
    /// Returns `true` if the callback already ran inline (synchronous
    /// completion). Otherwise the callback runs on a spawned task once the
    /// result is available; this requires a Tokio runtime.
    pub fn complete_with<F>(self, callback: F) -> bool
    where
        F: FnOnce(T) + Send + 'static,
    {
        match self {
            Completion::Ready(value) => {
                callback(value);
                true
            }
            Completion::Pending(future) => {
                tokio::spawn(async move {
                    callback(future.await);
                });
                false
            }
        }
    }
}

impl<T: Send + 'static, E: Send + 'static> Completion<Result<T, E>> {
    /// Chain a step that runs only when the first one succeeded
    pub fn and_then_ok<U, F>(self, f: F) -> Completion<Result<U, E>>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Completion<Result<U, E>> + Send + 'static,
    {
        self.and_then(|result| match result {
            Ok(value) => f(value),
            Err(e) => Completion::Ready(Err(e)),
        })
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Ready(_) => f.write_str("Completion::Ready"),
            Completion::Pending(_) => f.write_str("Completion::Pending"),
        }
    }
}

/// Future returned by awaiting a [`Completion`]
pub struct CompletionFuture<T> {
    state: CompletionState<T>,
}

enum CompletionState<T> {
    Ready(Option<T>),
    Pending(BoxFuture<'static, T>),
}

// The ready value is only ever moved out, never pinned.
impl<T> Unpin for CompletionFuture<T> {}

impl<T> Future for CompletionFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match &mut self.get_mut().state {
            CompletionState::Ready(value) => match value.take() {
                Some(value) => Poll::Ready(value),
                None => panic!("CompletionFuture polled after completion"),
            },
            CompletionState::Pending(future) => future.as_mut().poll(cx),
        }
    }
}

impl<T> IntoFuture for Completion<T> {
    type Output = T;
    type IntoFuture = CompletionFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        let state = match self {
            Completion::Ready(value) => CompletionState::Ready(Some(value)),
            Completion::Pending(future) => CompletionState::Pending(future),
        };
        CompletionFuture { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ready_is_synchronous() {
        let c = Completion::ready(7);
        assert!(c.is_synchronous());
        assert_eq!(c.await, 7);
    }

    #[tokio::test]
    async fn test_pending_is_not_synchronous() {
        let c = Completion::pending(async { 9 });
        assert!(!c.is_synchronous());
        assert_eq!(c.await, 9);
    }

    #[tokio::test]
    async fn test_map_keeps_path() {
        let sync = Completion::ready(2).map(|v| v * 10);
        assert!(sync.is_synchronous());
        assert_eq!(sync.await, 20);

        let slow = Completion::pending(async { 3 }).map(|v| v + 1);
        assert!(!slow.is_synchronous());
        assert_eq!(slow.await, 4);
    }

    #[tokio::test]
    async fn test_and_then_ok_short_circuits() {
        let c: Completion<Result<u32, String>> = Completion::ready(Err("no".to_string()));
        let chained = c.and_then_ok(|v| Completion::ready(Ok(v + 1)));
        assert!(chained.is_synchronous());
        assert_eq!(chained.await, Err("no".to_string()));
    }

    #[tokio::test]
    async fn test_complete_with_inline_fires_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let inline = Completion::ready(1).complete_with(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(inline);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_complete_with_pending_fires_once_later() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let inline = Completion::pending(async { 5 }).complete_with(move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(v);
        });
        assert!(!inline);
        assert_eq!(rx.await.unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_ready() {
        assert_eq!(Completion::ready(1).try_ready().ok(), Some(1));
        assert!(Completion::pending(async { 1 }).try_ready().is_err());
    }
}
