use crate::services::{image_repository::ImageRepository, scope::RequestScope};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Shared handler state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AppState {
    pub repository: Arc<ImageRepository>,
    pub request_timeout: Duration,
    /// Cancelled on shutdown; aborts in-flight store calls.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(repository: ImageRepository, request_timeout: Duration) -> Self {
        Self {
            repository: Arc::new(repository),
            request_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Scope for one inbound request.
    pub fn scope(&self) -> RequestScope {
        RequestScope::new()
            .with_timeout(self.request_timeout)
            .with_cancel(self.shutdown.child_token())
    }
}
