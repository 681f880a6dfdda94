//! Immutable routing table and its snapshot projection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::routing::rule::{DEFAULT_OUTBOUND, RouteDecision, RouteQuery, RouteRule};

/// Copy-on-write routing state. Never mutated once published; every change
/// goes through [`RouteStore::update_table`](crate::RouteStore::update_table).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    /// Incremented by the store on every successful swap.
    pub version: u64,
    /// Rules in insertion order.
    pub rules: Vec<RouteRule>,
    /// Logical outbound name → engine outbound tag.
    pub outbound_tag_map: BTreeMap<String, String>,
    /// Whether inbound traffic is sniffed for host names.
    pub sniff_enabled: bool,
    /// Outbounds to use, in order, when no rule matches.
    pub fallback_chain: Vec<String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            version: 0,
            rules: Vec::new(),
            outbound_tag_map: BTreeMap::new(),
            sniff_enabled: true,
            fallback_chain: Vec::new(),
        }
    }
}

impl RouteTable {
    /// Rules sorted by priority class; list order is kept within a class.
    pub fn ordered_rules(&self) -> Vec<&RouteRule> {
        let mut rules: Vec<&RouteRule> = self.rules.iter().collect();
        rules.sort_by_key(|r| r.matcher.priority());
        rules
    }

    /// Engine tag for a logical outbound name.
    pub fn tag_for<'a>(&'a self, outbound: &'a str) -> &'a str {
        self.outbound_tag_map
            .get(outbound)
            .map(String::as_str)
            .unwrap_or(outbound)
    }

    /// Classifies `query` against this table.
    pub fn resolve(&self, query: &RouteQuery) -> RouteDecision {
        let fallback: Vec<String> = if self.fallback_chain.is_empty() {
            vec![self.tag_for(DEFAULT_OUTBOUND).to_string()]
        } else {
            self.fallback_chain
                .iter()
                .map(|o| self.tag_for(o).to_string())
                .collect()
        };

        match self.ordered_rules().into_iter().find(|r| r.matcher.matches(query)) {
            Some(rule) => {
                let outbound = self.tag_for(&rule.outbound).to_string();
                let alternates = fallback.into_iter().filter(|o| *o != outbound).collect();
                RouteDecision {
                    outbound,
                    alternates,
                    rule_id: Some(rule.id.clone()),
                }
            }
            None => {
                let mut chain = fallback.into_iter();
                RouteDecision {
                    outbound: chain.next().unwrap_or_else(|| DEFAULT_OUTBOUND.to_string()),
                    alternates: chain.collect(),
                    rule_id: None,
                }
            }
        }
    }
}

/// Control-channel status carried by snapshots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No channel configured or not yet attempted.
    #[default]
    Unknown,
    /// Channel up and every callback registered.
    Connected,
    /// Channel lost; reconnecting.
    Disconnected,
}

/// Timestamped projection of a table plus connection status.
#[derive(Clone, Debug)]
pub struct RouteSnapshot {
    /// Table version.
    pub version: u64,
    /// The table itself (shared, immutable).
    pub table: Arc<RouteTable>,
    /// Channel status at emission time.
    pub connection: ConnectionStatus,
    /// Emission time.
    pub at: SystemTime,
}

impl RouteSnapshot {
    pub(crate) fn new(table: Arc<RouteTable>, connection: ConnectionStatus) -> Self {
        Self {
            version: table.version,
            table,
            connection,
            at: SystemTime::now(),
        }
    }
}
