//! Routing rules, lookup queries and decisions.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Outbound used when nothing matches and no fallback chain is set.
pub const DEFAULT_OUTBOUND: &str = "proxy";

/// What a rule matches on.
///
/// Priority classes, highest first: full domain, domain suffix, then
/// geosite / geoip / CIDR. Within a class the list order decides.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RuleMatcher {
    /// Exact host name.
    FullDomain(String),
    /// Host name or any subdomain of it.
    DomainSuffix(String),
    /// Site-category tag supplied by the data plane.
    Geosite(String),
    /// Country code of the destination (`"private"` = non-routable ranges).
    Geoip(String),
    /// Destination address range.
    IpCidr(IpNet),
}

impl RuleMatcher {
    /// Priority class (lower wins).
    pub fn priority(&self) -> u8 {
        match self {
            RuleMatcher::FullDomain(_) => 0,
            RuleMatcher::DomainSuffix(_) => 1,
            RuleMatcher::Geosite(_) | RuleMatcher::Geoip(_) | RuleMatcher::IpCidr(_) => 2,
        }
    }

    /// True if `query` satisfies this matcher.
    pub fn matches(&self, query: &RouteQuery) -> bool {
        match self {
            RuleMatcher::FullDomain(d) => query.domain.as_deref() == Some(normalize(d).as_str()),
            RuleMatcher::DomainSuffix(s) => {
                let suffix = normalize(s);
                query.domain.as_deref().is_some_and(|host| {
                    host == suffix
                        || (host.len() > suffix.len()
                            && host.ends_with(&suffix)
                            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
                })
            }
            RuleMatcher::Geosite(tag) => query.site_tags.iter().any(|t| t.eq_ignore_ascii_case(tag)),
            RuleMatcher::Geoip(code) if code.eq_ignore_ascii_case("private") => {
                query.ip.is_some_and(is_private)
            }
            RuleMatcher::Geoip(code) => query
                .country
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(code)),
            RuleMatcher::IpCidr(net) => query.ip.is_some_and(|ip| net.contains(&ip)),
        }
    }

    /// Matcher in the routing engine's rule syntax: (`"domain"` | `"ip"`, value).
    pub fn engine_condition(&self) -> (&'static str, String) {
        match self {
            RuleMatcher::FullDomain(d) => ("domain", format!("full:{}", normalize(d))),
            RuleMatcher::DomainSuffix(s) => ("domain", format!("domain:{}", normalize(s))),
            RuleMatcher::Geosite(tag) => ("domain", format!("geosite:{}", tag.to_ascii_lowercase())),
            RuleMatcher::Geoip(code) => ("ip", format!("geoip:{}", code.to_ascii_lowercase())),
            RuleMatcher::IpCidr(net) => ("ip", net.to_string()),
        }
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// One routing rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Caller-chosen identifier, unique within a table.
    pub id: String,
    /// Condition.
    pub matcher: RuleMatcher,
    /// Logical outbound name (mapped through the table's tag map).
    pub outbound: String,
}

impl RouteRule {
    /// Shorthand constructor.
    pub fn new(id: impl Into<String>, matcher: RuleMatcher, outbound: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            matcher,
            outbound: outbound.into(),
        }
    }
}

/// A connection to classify. Domain names are normalized on construction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RouteQuery {
    /// Destination host name, if known (sniffed or requested).
    pub domain: Option<String>,
    /// Destination address, if known.
    pub ip: Option<IpAddr>,
    /// Destination country code, if the data plane resolved one.
    pub country: Option<String>,
    /// Site-category tags the data plane attached to the host.
    pub site_tags: Vec<String>,
}

impl RouteQuery {
    /// Query for a host name.
    pub fn domain(host: &str) -> Self {
        Self {
            domain: Some(normalize(host)),
            ..Self::default()
        }
    }

    /// Query for an address.
    pub fn ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            ..Self::default()
        }
    }

    /// Adds a resolved address.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Adds a country code.
    pub fn with_country(mut self, code: impl Into<String>) -> Self {
        self.country = Some(code.into());
        self
    }

    /// Adds a site-category tag.
    pub fn with_site_tag(mut self, tag: impl Into<String>) -> Self {
        self.site_tags.push(tag.into());
        self
    }
}

/// Outcome of a lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDecision {
    /// Engine outbound tag to use.
    pub outbound: String,
    /// Alternatives to try if `outbound` fails, in order.
    pub alternates: Vec<String>,
    /// Rule that matched, `None` when the fallback applied.
    pub rule_id: Option<String>,
}
