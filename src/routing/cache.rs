//! Memoized route decisions, keyed by query and stamped with the table
//! version they were computed from.

use dashmap::DashMap;

use crate::routing::rule::{RouteDecision, RouteQuery};

/// Upper bound on cached queries; the cache is cleared when it is reached.
const MAX_ENTRIES: usize = 4096;

#[derive(Default)]
pub(crate) struct DecisionCache {
    entries: DashMap<RouteQuery, (u64, RouteDecision)>,
}

impl DecisionCache {
    /// Cached decision, only if it was computed from `version`.
    pub(crate) fn get(&self, query: &RouteQuery, version: u64) -> Option<RouteDecision> {
        self.entries
            .get(query)
            .filter(|e| e.0 == version)
            .map(|e| e.1.clone())
    }

    pub(crate) fn insert(&self, query: RouteQuery, version: u64, decision: RouteDecision) {
        if self.entries.len() >= MAX_ENTRIES {
            self.entries.clear();
        }
        self.entries.insert(query, (version, decision));
    }

    pub(crate) fn invalidate(&self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
