use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Background tasks owned by one component, stopped together.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when the group closes.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a task that is dropped as soon as the group closes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        })
    }

    /// Cancel all tasks and wait for their completion.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
