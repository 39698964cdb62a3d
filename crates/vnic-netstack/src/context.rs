//! Deadline and cancellation scope for blocking operations.

use crate::error::{NetError, NetResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// An optional deadline paired with a cancellation token.
///
/// Derived contexts inherit both: their deadline is the earlier of the
/// parent's and their own, and cancelling a parent cancels every child.
/// Cancelling a child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Context {
    /// A context that never expires and is never cancelled unless
    /// [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            token: self.token.child_token(),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child that can be cancelled independently.
    pub fn with_cancel(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Why this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<NetError> {
        if self.token.is_cancelled() {
            return Some(NetError::Canceled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(NetError::Timeout),
            _ => None,
        }
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> NetError {
        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.token.cancelled() => NetError::Canceled,
            _ = expiry => NetError::Timeout,
        }
    }

    /// Drive `fut` until it completes or the context is done.
    pub async fn run<T, F>(&self, fut: F) -> NetResult<T>
    where
        F: Future<Output = NetResult<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}
