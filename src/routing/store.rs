//! # RouteStore: lock-free routing state with change notification.
//!
//! ```text
//! writers ──► update_table(f) ─┐  load ─► f(cur) ─► compare_and_swap
//!                              │     ▲                  │
//!                              │     └── ptr mismatch ──┘ (retry)
//!                              └─► swapped: invalidate cache, publish snapshot
//!
//! readers ──► current_table()   (one atomic load, never blocks)
//!         ──► resolve(query)    (decision cache keyed by table version)
//! ```
//!
//! `f` may run more than once under contention, so it must be a pure
//! function of the table it receives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::routing::cache::DecisionCache;
use crate::routing::channel::{CallbackId, ChannelCallback};
use crate::routing::feed::{FeedSubscription, SnapshotFeed};
use crate::routing::rule::{RouteDecision, RouteQuery, RouteRule};
use crate::routing::table::{ConnectionStatus, RouteSnapshot, RouteTable};

/// Single source of routing truth for one chain.
pub struct RouteStore {
    table: ArcSwap<RouteTable>,
    feed: SnapshotFeed,
    cache: DecisionCache,
    connection: Mutex<ConnectionStatus>,
    callbacks: RwLock<Vec<(CallbackId, Arc<dyn ChannelCallback>)>>,
    next_callback: AtomicU64,
    callbacks_changed: watch::Sender<u64>,
}

impl RouteStore {
    /// Empty table; `replay` snapshots are kept for late subscribers.
    pub fn new(replay: usize, feed_capacity: usize) -> Self {
        Self::with_table(RouteTable::default(), replay, feed_capacity)
    }

    /// Store seeded with `table`.
    pub fn with_table(table: RouteTable, replay: usize, feed_capacity: usize) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            feed: SnapshotFeed::new(replay, feed_capacity),
            cache: DecisionCache::default(),
            connection: Mutex::new(ConnectionStatus::Unknown),
            callbacks: RwLock::new(Vec::new()),
            next_callback: AtomicU64::new(1),
            callbacks_changed: watch::Sender::new(0),
        }
    }

    /// Latest published table.
    pub fn current_table(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Applies `f` atomically and returns the table that was installed.
    pub fn update_table<F>(&self, f: F) -> Arc<RouteTable>
    where
        F: Fn(&RouteTable) -> RouteTable,
    {
        self.swap_with(f).1
    }

    fn swap_with<F>(&self, f: F) -> (Arc<RouteTable>, Arc<RouteTable>)
    where
        F: Fn(&RouteTable) -> RouteTable,
    {
        loop {
            let current = self.table.load_full();
            let mut next = f(&current);
            next.version = current.version + 1;
            let next = Arc::new(next);

            let previous = self.table.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                self.cache.invalidate();
                self.feed
                    .publish(RouteSnapshot::new(Arc::clone(&next), self.connection_status()));
                return (current, next);
            }
        }
    }

    /// Adds `rule` at the end, or replaces the rule with the same id in place.
    pub fn add_rule(&self, rule: RouteRule) -> Arc<RouteTable> {
        self.update_table(|t| {
            let mut next = t.clone();
            match next.rules.iter_mut().find(|r| r.id == rule.id) {
                Some(slot) => *slot = rule.clone(),
                None => next.rules.push(rule.clone()),
            }
            next
        })
    }

    /// Removes the rule with `id`. Returns whether it existed.
    pub fn remove_rule(&self, id: &str) -> bool {
        let (before, _) = self.swap_with(|t| {
            let mut next = t.clone();
            next.rules.retain(|r| r.id != id);
            next
        });
        before.rules.iter().any(|r| r.id == id)
    }

    /// Replaces the rule with the same id, keeping its position.
    /// Returns whether it existed; a missing id leaves the rules unchanged.
    pub fn update_rule(&self, rule: RouteRule) -> bool {
        let (before, _) = self.swap_with(|t| {
            let mut next = t.clone();
            if let Some(slot) = next.rules.iter_mut().find(|r| r.id == rule.id) {
                *slot = rule.clone();
            }
            next
        });
        before.rules.iter().any(|r| r.id == rule.id)
    }

    /// Drops every rule.
    pub fn clear_rules(&self) -> Arc<RouteTable> {
        self.update_table(|t| RouteTable {
            rules: Vec::new(),
            ..t.clone()
        })
    }

    /// Adds a batch as one update (same per-rule semantics as [`add_rule`](Self::add_rule)).
    pub fn apply_rules(&self, batch: Vec<RouteRule>) -> Arc<RouteTable> {
        self.update_table(|t| {
            let mut next = t.clone();
            for rule in &batch {
                match next.rules.iter_mut().find(|r| r.id == rule.id) {
                    Some(slot) => *slot = rule.clone(),
                    None => next.rules.push(rule.clone()),
                }
            }
            next
        })
    }

    /// Toggles host-name sniffing.
    pub fn set_sniffing(&self, enabled: bool) -> Arc<RouteTable> {
        self.update_table(|t| RouteTable {
            sniff_enabled: enabled,
            ..t.clone()
        })
    }

    /// Replaces the fallback chain.
    pub fn set_fallback_chain(&self, chain: Vec<String>) -> Arc<RouteTable> {
        self.update_table(|t| RouteTable {
            fallback_chain: chain.clone(),
            ..t.clone()
        })
    }

    /// Maps a logical outbound name to an engine tag.
    pub fn map_outbound(&self, logical: &str, tag: &str) -> Arc<RouteTable> {
        self.update_table(|t| {
            let mut next = t.clone();
            next.outbound_tag_map
                .insert(logical.to_string(), tag.to_string());
            next
        })
    }

    /// Classifies `query` against the current table.
    pub fn resolve(&self, query: &RouteQuery) -> RouteDecision {
        let table = self.table.load();
        if let Some(hit) = self.cache.get(query, table.version) {
            return hit;
        }
        let decision = table.resolve(query);
        self.cache
            .insert(query.clone(), table.version, decision.clone());
        decision
    }

    /// Drops every cached decision.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    /// Number of cached decisions.
    pub fn cached_decisions(&self) -> usize {
        self.cache.len()
    }

    /// Snapshot feed; late subscribers receive the replay buffer first.
    pub fn subscribe(&self) -> FeedSubscription {
        self.feed.subscribe()
    }

    /// Last control-channel status.
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.connection.lock()
    }

    /// Records a channel transition and re-emits the full current table.
    pub fn set_connection(&self, status: ConnectionStatus) {
        *self.connection.lock() = status;
        self.feed
            .publish(RouteSnapshot::new(self.current_table(), status));
    }

    /// Adds a data-plane callback. It is registered on the live channel (if
    /// any) and on every channel established later.
    pub fn register_callback(&self, callback: Arc<dyn ChannelCallback>) -> CallbackId {
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, callback));
        self.callbacks_changed.send_modify(|generation| *generation += 1);
        id
    }

    /// Removes a callback. Returns whether it was registered.
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        before != callbacks.len()
    }

    pub(crate) fn callbacks(&self) -> Vec<(CallbackId, Arc<dyn ChannelCallback>)> {
        self.callbacks.read().clone()
    }

    /// Ticks whenever a callback is added.
    pub(crate) fn watch_callbacks(&self) -> watch::Receiver<u64> {
        self.callbacks_changed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::rule::RuleMatcher;

    fn rule(i: usize) -> RouteRule {
        RouteRule::new(
            format!("r{i}"),
            RuleMatcher::DomainSuffix(format!("site{i}.example")),
            "proxy",
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let store = Arc::new(RouteStore::new(4, 64));
        let writers: Vec<_> = (0..8)
            .map(|w| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for i in 0..50 {
                        store.add_rule(rule(w * 1000 + i));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for w in writers {
            w.await.unwrap();
        }
        let table = store.current_table();
        assert_eq!(table.rules.len(), 400);
        assert_eq!(table.version, 400);
    }

    #[tokio::test]
    async fn batch_then_clear_publishes_snapshots() {
        let store = RouteStore::new(8, 16);
        let mut sub = store.subscribe();

        store.apply_rules((0..5).map(rule).collect());
        assert_eq!(store.current_table().rules.len(), 5);
        store.clear_rules();
        assert_eq!(store.current_table().rules.len(), 0);

        let first = sub.recv().await.unwrap();
        assert_eq!((first.version, first.table.rules.len()), (1, 5));
        let second = sub.recv().await.unwrap();
        assert_eq!((second.version, second.table.rules.len()), (2, 0));
    }

    #[test]
    fn rule_operations() {
        let store = RouteStore::new(0, 4);
        store.add_rule(rule(1));
        store.add_rule(rule(2));
        store.add_rule(RouteRule::new("r1", RuleMatcher::FullDomain("a.b".into()), "direct"));
        let t = store.current_table();
        assert_eq!(t.rules.len(), 2);
        assert_eq!(t.rules[0].outbound, "direct");

        assert!(store.update_rule(RouteRule::new("r2", RuleMatcher::FullDomain("c.d".into()), "block")));
        assert!(!store.update_rule(RouteRule::new("nope", RuleMatcher::FullDomain("c.d".into()), "block")));
        assert_eq!(store.current_table().rules[1].outbound, "block");

        assert!(store.remove_rule("r1"));
        assert!(!store.remove_rule("r1"));
        assert_eq!(store.current_table().rules.len(), 1);

        store.set_sniffing(false);
        store.set_fallback_chain(vec!["direct".into()]);
        let t = store.current_table();
        assert!(!t.sniff_enabled);
        assert_eq!(t.fallback_chain, vec!["direct".to_string()]);
    }

    #[test]
    fn cache_follows_table_version() {
        let store = RouteStore::new(0, 4);
        let q = RouteQuery::domain("www.site1.example");
        assert_eq!(store.resolve(&q).rule_id, None);
        assert_eq!(store.cached_decisions(), 1);

        store.add_rule(rule(1));
        assert_eq!(store.cached_decisions(), 0);
        assert_eq!(store.resolve(&q).rule_id.as_deref(), Some("r1"));

        store.map_outbound("proxy", "reality");
        assert_eq!(store.resolve(&q).outbound, "reality");
    }

    #[test]
    fn connection_change_reemits_current_table() {
        let store = RouteStore::new(4, 4);
        store.add_rule(rule(1));
        store.set_connection(ConnectionStatus::Disconnected);
        let mut sub = store.subscribe();
        let a = sub.try_recv().unwrap();
        let b = sub.try_recv().unwrap();
        assert_eq!((a.version, a.connection), (1, ConnectionStatus::Unknown));
        assert_eq!((b.version, b.connection), (1, ConnectionStatus::Disconnected));
    }
}
