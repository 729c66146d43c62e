//! Keepalive pong tracking
//!
//! Keepalive pings are not correlated by id. Any unmatched pong reply counts
//! for every outstanding ping and wakes every task waiting on one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Tracks whether the last keepalive ping was answered.
///
/// Lock-free: the keepalive task records pings, the reader records pongs.
#[derive(Debug)]
pub(crate) struct PongTracker {
    /// Epoch for converting Instant to u64
    epoch: Instant,
    /// A ping was sent and no pong has arrived since
    outstanding: AtomicBool,
    /// Last pong received (ms since epoch, +1 so 0 means never)
    last_pong_ms: AtomicU64,
    pong: Notify,
}

impl PongTracker {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            outstanding: AtomicBool::new(false),
            last_pong_ms: AtomicU64::new(0),
            pong: Notify::new(),
        }
    }

    /// Call right after writing a keepalive ping.
    pub(crate) fn record_ping_sent(&self) {
        self.outstanding
            .store(true, Ordering::Release);
    }

    /// Call when an unmatched pong arrives; wakes all pong waiters.
    pub(crate) fn record_pong_received(&self) {
        let ms = self
            .epoch
            .elapsed()
            .as_millis() as u64
            + 1;
        self.last_pong_ms
            .store(ms, Ordering::Release);
        self.outstanding
            .store(false, Ordering::Release);
        self.pong
            .notify_waiters();
    }

    /// `true` if the last ping is still unanswered.
    pub(crate) fn awaiting_pong(&self) -> bool {
        self.outstanding
            .load(Ordering::Acquire)
    }

    /// Time since the last pong, `None` if none arrived yet.
    pub(crate) fn time_since_last_pong(&self) -> Option<Duration> {
        let pong_ms = self
            .last_pong_ms
            .load(Ordering::Acquire);
        if pong_ms == 0 {
            return None;
        }
        let now_ms = self
            .epoch
            .elapsed()
            .as_millis() as u64
            + 1;
        Some(Duration::from_millis(now_ms.saturating_sub(pong_ms)))
    }

    /// Future resolving at the next pong. Create it before sending the ping.
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.pong
            .notified()
    }

    /// Forget the previous session's state.
    pub(crate) fn reset(&self) {
        self.outstanding
            .store(false, Ordering::Release);
        self.last_pong_ms
            .store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_awaiting_before_first_ping() {
        let tracker = PongTracker::new();
        assert!(!tracker.awaiting_pong());
        assert!(tracker
            .time_since_last_pong()
            .is_none());
    }

    #[test]
    fn test_pong_clears_outstanding_ping() {
        let tracker = PongTracker::new();
        tracker.record_ping_sent();
        assert!(tracker.awaiting_pong());
        tracker.record_pong_received();
        assert!(!tracker.awaiting_pong());
        assert!(tracker
            .time_since_last_pong()
            .is_some());
    }

    #[test]
    fn test_reset() {
        let tracker = PongTracker::new();
        tracker.record_ping_sent();
        tracker.reset();
        assert!(!tracker.awaiting_pong());
    }

    #[tokio::test]
    async fn test_pong_wakes_every_waiter() {
        let tracker = std::sync::Arc::new(PongTracker::new());
        let a = tracker.notified();
        let b = tracker.notified();
        tracker.record_pong_received();
        tokio::time::timeout(Duration::from_millis(100), async {
            a.await;
            b.await;
        })
        .await
        .unwrap();
    }
}
