//! Latest-value telemetry cache with coalesced change notification.
//!
//! The slot holds at most one snapshot and is swapped atomically, so readers
//! never block and never observe a half-written value. Change notifications
//! are rate limited to one per tick: a burst of publishes between two ticks
//! produces a single notification carrying the last value published.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::trace;

pub const DEFAULT_TICK: Duration = Duration::from_millis(16);

/// The most recent telemetry body and when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

pub type SnapshotRef = Option<Arc<TelemetrySnapshot>>;

struct Inner {
    slot: ArcSwapOption<TelemetrySnapshot>,
    /// Set while a notification is scheduled and not yet delivered.
    pending: AtomicBool,
    wake: Arc<Notify>,
    notify_tx: watch::Sender<SnapshotRef>,
    notifications: AtomicU64,
}

impl Inner {
    fn schedule(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    fn flush(&self) {
        self.pending.store(false, Ordering::Release);
        let current = self.slot.load_full();
        self.notify_tx.send_replace(current);
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Lets the flusher observe the dead weak reference and exit.
        self.wake.notify_one();
    }
}

/// Single-slot telemetry cache. Cloning shares the slot.
///
/// Must be created inside a tokio runtime: construction spawns the task
/// that delivers coalesced notifications.
#[derive(Clone)]
pub struct LatestValueCache {
    inner: Arc<Inner>,
}

impl LatestValueCache {
    pub fn new(tick: Duration) -> Self {
        let wake = Arc::new(Notify::new());
        let (notify_tx, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            slot: ArcSwapOption::empty(),
            pending: AtomicBool::new(false),
            wake: Arc::clone(&wake),
            notify_tx,
            notifications: AtomicU64::new(0),
        });
        tokio::spawn(run_flusher(Arc::downgrade(&inner), wake, tick));
        Self { inner }
    }

    /// Replace the current value. Never blocks and never notifies inline.
    pub fn publish(&self, payload: serde_json::Value) {
        let snapshot = TelemetrySnapshot {
            payload,
            received_at: Utc::now(),
        };
        self.inner.slot.store(Some(Arc::new(snapshot)));
        self.inner.schedule();
    }

    /// Drop the current value; subscribers are notified on the next tick.
    pub fn clear(&self) {
        if self.inner.slot.swap(None).is_some() {
            self.inner.schedule();
        }
    }

    pub fn current_value(&self) -> SnapshotRef {
        self.inner.slot.load_full()
    }

    /// Coalesced change feed. The receiver sees at most one change per tick.
    pub fn subscribe(&self) -> watch::Receiver<SnapshotRef> {
        self.inner.notify_tx.subscribe()
    }

    /// Notifications delivered since creation.
    pub fn notification_count(&self) -> u64 {
        self.inner.notifications.load(Ordering::Relaxed)
    }
}

async fn run_flusher(inner: Weak<Inner>, wake: Arc<Notify>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        wake.notified().await;
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            trace!("telemetry cache dropped, flusher exiting");
            return;
        };
        inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TICK: Duration = Duration::from_millis(16);

    #[tokio::test(start_paused = true)]
    async fn current_value_is_none_until_first_publish() {
        let cache = LatestValueCache::new(TICK);
        assert!(cache.current_value().is_none());
        cache.publish(json!({"alt": 1.0}));
        assert_eq!(cache.current_value().unwrap().payload, json!({"alt": 1.0}));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_produces_single_notification_with_last_value() {
        let cache = LatestValueCache::new(TICK);
        let mut rx = cache.subscribe();

        for i in 0..50 {
            cache.publish(json!({ "seq": i }));
        }
        tokio::time::sleep(TICK * 3).await;

        assert_eq!(cache.notification_count(), 1);
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone().unwrap();
        assert_eq!(seen.payload, json!({"seq": 49}));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_publishing_is_bounded_to_one_notification_per_tick() {
        let cache = LatestValueCache::new(TICK);
        let window = Duration::from_millis(200);

        let mut elapsed = Duration::ZERO;
        let mut seq = 0;
        while elapsed < window {
            cache.publish(json!({ "seq": seq }));
            seq += 1;
            tokio::time::sleep(Duration::from_millis(2)).await;
            elapsed += Duration::from_millis(2);
        }
        tokio::time::sleep(TICK * 2).await;

        let ticks = (window.as_millis() / TICK.as_millis()) as u64 + 2;
        let count = cache.notification_count();
        assert!(count <= ticks, "{count} notifications for {ticks} ticks");
        assert!(count >= 2);
        let last = cache.subscribe().borrow().clone().unwrap();
        assert_eq!(last.payload, json!({ "seq": seq - 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_in_separate_ticks_notify_separately() {
        let cache = LatestValueCache::new(TICK);
        cache.publish(json!({"seq": 1}));
        tokio::time::sleep(TICK * 2).await;
        cache.publish(json!({"seq": 2}));
        tokio::time::sleep(TICK * 2).await;
        assert_eq!(cache.notification_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_empties_slot_and_notifies() {
        let cache = LatestValueCache::new(TICK);
        let mut rx = cache.subscribe();
        cache.publish(json!({"alt": 1.0}));
        tokio::time::sleep(TICK * 2).await;
        rx.borrow_and_update();

        cache.clear();
        assert!(cache.current_value().is_none());
        tokio::time::sleep(TICK * 2).await;
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_on_empty_cache_is_silent() {
        let cache = LatestValueCache::new(TICK);
        cache.clear();
        tokio::time::sleep(TICK * 2).await;
        assert_eq!(cache.notification_count(), 0);
    }
}
