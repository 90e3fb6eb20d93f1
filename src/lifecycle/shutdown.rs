//! Shutdown coordination.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::net::StreamTracker;

/// Coordinator for graceful shutdown.
///
/// Long-running tasks take a child token; cancelling the root cancels them
/// all, while a child can be cancelled alone.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for one task.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// The root token, for components that hand out their own children.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown triggered");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Trigger, then wait up to `deadline` for tracked streams to finish.
    /// Returns whether everything drained in time.
    pub async fn drain(&self, tracker: &StreamTracker, deadline: Duration) -> bool {
        self.trigger();
        let drained = tracker.wait_for_drain(deadline).await;
        if drained {
            tracing::info!("All streams drained");
        } else {
            tracing::warn!(
                remaining = tracker.active_count(),
                "Shutdown deadline reached with streams still open"
            );
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::StreamId;

    #[tokio::test]
    async fn trigger_cancels_children() {
        let shutdown = Shutdown::new();
        let child = shutdown.child_token();
        assert!(!child.is_cancelled());
        shutdown.trigger();
        assert!(child.is_cancelled());
        assert!(shutdown.is_triggered());
        shutdown.triggered().await;
    }

    #[tokio::test]
    async fn drain_waits_for_tracked_streams() {
        let shutdown = Shutdown::new();
        let tracker = StreamTracker::new();
        let guard = tracker.track(StreamId::new());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(shutdown.drain(&tracker, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn drain_reports_timeout() {
        let shutdown = Shutdown::new();
        let tracker = StreamTracker::new();
        let _guard = tracker.track(StreamId::new());
        assert!(!shutdown.drain(&tracker, Duration::from_millis(20)).await);
    }
}
