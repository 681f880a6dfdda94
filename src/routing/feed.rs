//! # SnapshotFeed: change notification with bounded replay.
//!
//! ```text
//! publish(s) ──► replay ring (last N) ──► broadcast (drop-oldest on lag)
//!                     │                        │
//! subscribe() ────────┴─ copy of ring ─────────┴─ live receiver
//! ```
//!
//! Subscribing copies the ring and opens the live receiver under the same
//! lock `publish` takes, so a new subscriber sees every snapshot after the
//! replayed ones exactly once. Versions never go backwards on the feed: a
//! writer that lost the race to publish an older version is skipped.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::routing::table::RouteSnapshot;

struct Inner {
    replay: VecDeque<Arc<RouteSnapshot>>,
    last_version: Option<u64>,
}

/// Broadcast of route snapshots with a replay buffer for late subscribers.
pub struct SnapshotFeed {
    tx: broadcast::Sender<Arc<RouteSnapshot>>,
    inner: Mutex<Inner>,
    replay_capacity: usize,
}

impl SnapshotFeed {
    /// `replay_capacity = 0` disables replay; `capacity` is clamped to 1.
    pub fn new(replay_capacity: usize, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            inner: Mutex::new(Inner {
                replay: VecDeque::with_capacity(replay_capacity),
                last_version: None,
            }),
            replay_capacity,
        }
    }

    /// Publishes `snapshot` unless a newer version was already published.
    pub fn publish(&self, snapshot: RouteSnapshot) -> bool {
        let mut inner = self.inner.lock();
        if inner.last_version.is_some_and(|v| snapshot.version < v) {
            return false;
        }
        inner.last_version = Some(snapshot.version);
        let snapshot = Arc::new(snapshot);
        if self.replay_capacity > 0 {
            if inner.replay.len() == self.replay_capacity {
                inner.replay.pop_front();
            }
            inner.replay.push_back(Arc::clone(&snapshot));
        }
        let _ = self.tx.send(snapshot);
        true
    }

    /// New subscription: replayed history first, then live snapshots.
    pub fn subscribe(&self) -> FeedSubscription {
        let inner = self.inner.lock();
        FeedSubscription {
            replay: inner.replay.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Most recent snapshot, if any was published.
    pub fn latest(&self) -> Option<Arc<RouteSnapshot>> {
        self.inner.lock().replay.back().cloned()
    }
}

/// Receiving side of a [`SnapshotFeed`].
pub struct FeedSubscription {
    replay: VecDeque<Arc<RouteSnapshot>>,
    rx: broadcast::Receiver<Arc<RouteSnapshot>>,
}

impl FeedSubscription {
    /// Next snapshot; `None` once the feed is gone.
    ///
    /// A subscriber that fell behind skips the oldest snapshots it missed.
    pub async fn recv(&mut self) -> Option<Arc<RouteSnapshot>> {
        if let Some(s) = self.replay.pop_front() {
            return Some(s);
        }
        loop {
            match self.rx.recv().await {
                Ok(s) => return Some(s),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "route feed subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Arc<RouteSnapshot>> {
        if let Some(s) = self.replay.pop_front() {
            return Some(s);
        }
        loop {
            match self.rx.try_recv() {
                Ok(s) => return Some(s),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::table::{ConnectionStatus, RouteTable};

    fn snap(version: u64) -> RouteSnapshot {
        RouteSnapshot::new(
            Arc::new(RouteTable {
                version,
                ..RouteTable::default()
            }),
            ConnectionStatus::Unknown,
        )
    }

    #[tokio::test]
    async fn late_subscriber_gets_last_n() {
        let feed = SnapshotFeed::new(3, 8);
        for v in 1..=5 {
            assert!(feed.publish(snap(v)));
        }
        let mut sub = feed.subscribe();
        let versions: Vec<u64> = (0..3).map(|_| sub.try_recv().unwrap().version).collect();
        assert_eq!(versions, vec![3, 4, 5]);
        assert!(sub.try_recv().is_none());

        feed.publish(snap(6));
        assert_eq!(sub.recv().await.unwrap().version, 6);
    }

    #[test]
    fn older_versions_are_skipped() {
        let feed = SnapshotFeed::new(4, 8);
        feed.publish(snap(2));
        assert!(!feed.publish(snap(1)));
        assert!(feed.publish(snap(2)));
        assert_eq!(feed.latest().unwrap().version, 2);
    }

    #[test]
    fn lagging_subscriber_drops_oldest() {
        let feed = SnapshotFeed::new(0, 2);
        let mut sub = feed.subscribe();
        for v in 1..=5 {
            feed.publish(snap(v));
        }
        assert_eq!(sub.try_recv().unwrap().version, 4);
        assert_eq!(sub.try_recv().unwrap().version, 5);
        assert!(sub.try_recv().is_none());
    }
}
