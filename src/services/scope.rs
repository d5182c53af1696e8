//! Per-request cancellation and deadline.

use super::object_store::{StoreError, StoreResult};
use std::{future::Future, time::Duration};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Bounds every remote call issued on behalf of one inbound request.
///
/// Cloning shares the cancellation token, so cancelling any clone cancels
/// them all.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline `timeout` from now. Keeps an earlier deadline if one is set.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Race `fut` against cancellation and the deadline.
    pub async fn run<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled("request cancelled".into())),
            _ = deadline => Err(StoreError::Cancelled("request deadline exceeded".into())),
            result = fut => result,
        }
    }
}
