//! Per-request cancellation and deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{StateError, StateResult};

/// Caller-supplied deadline and cancellation signal.
///
/// Every cache operation and every wait on a shared fetch goes through
/// [`RequestContext::run`]. Cancelling a context only ends the caller's own wait; a
/// fetch that other callers joined keeps running.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// A context with no deadline that is never cancelled unless its token is.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline(Instant::now() + timeout)
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Drive `fut` until it completes, the context is cancelled or the deadline passes.
    pub async fn run<T, E, F>(&self, fut: F) -> StateResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<StateError>,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StateError::Cancelled),
            _ = deadline => Err(StateError::DeadlineExceeded),
            result = fut => result.map_err(Into::into),
        }
    }
}
