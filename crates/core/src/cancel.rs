//! Cancellation tokens and deadlines
//!
//! Every asynchronous operation takes a timeout and a [`CancellationToken`].
//! [`with_deadline`] races the operation against both and maps the loser to
//! `StateError::Timeout` or `StateError::OperationCanceled`. Dropping the
//! losing future releases whatever it had partially acquired.

use crate::error::{StateError, StateResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Default timeout for store and state manager operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

/// Cooperative cancellation signal
///
/// Cloning yields a handle to the same signal.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// A fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is never cancelled
    pub fn none() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder of this token
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `OperationCanceled` if cancellation has been signalled
    pub fn check(&self) -> StateResult<()> {
        if self.is_cancelled() {
            Err(StateError::OperationCanceled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Run `future` bounded by `timeout` and `token`
///
/// `operation` names what is being waited on and ends up in the timeout error.
pub async fn with_deadline<T, F>(
    future: F,
    timeout: Duration,
    token: &CancellationToken,
    operation: &str,
) -> StateResult<T>
where
    F: Future<Output = StateResult<T>>,
{
    token.check()?;
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StateError::OperationCanceled),
        result = tokio::time::timeout(timeout, future) => match result {
            Ok(inner) => inner,
            Err(_) => Err(StateError::timeout(operation)),
        },
    }
}
