//! Stream identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique stream IDs for tracing
//! - Count live streams so shutdown can wait for them to drain

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Global atomic counter for stream IDs.
/// Relaxed ordering is enough since only uniqueness matters.
static STREAM_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub fn new() -> Self {
        Self(STREAM_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Tracks live streams for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct StreamTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicU64,
    drained: Notify,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live stream. The returned guard decrements the count on drop.
    pub fn track(&self, id: StreamId) -> StreamGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        StreamGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until every tracked stream has finished, or the deadline passes.
    ///
    /// Returns `true` when the tracker drained in time.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let drain = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, drain).await.is_ok()
    }
}

/// Guard that tracks one stream's lifetime.
#[derive(Debug)]
pub struct StreamGuard {
    inner: Arc<TrackerInner>,
    id: StreamId,
}

impl StreamGuard {
    pub fn id(&self) -> StreamId {
        self.id
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
        tracing::trace!(stream_id = %self.id, "Stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_unique() {
        assert_ne!(StreamId::new(), StreamId::new());
    }

    #[test]
    fn tracker_counts() {
        let tracker = StreamTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(StreamId::new());
        let guard2 = tracker.track(StreamId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);
        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn drain_completes_when_last_guard_drops() {
        let tracker = StreamTracker::new();
        let guard = tracker.track(StreamId::new());

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for_drain(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn drain_times_out_with_live_stream() {
        let tracker = StreamTracker::new();
        let _guard = tracker.track(StreamId::new());
        assert!(!tracker.wait_for_drain(Duration::from_millis(20)).await);
    }
}
