//! Rate limit rules and request matching.
//!
//! A [`RateRule`] describes one admission policy: the methods and resources it
//! applies to, its quota and the address ranges exempt from it. Rules are
//! loaded once into a [`RuleSet`] and shared read-only by every request.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

use super::bucket::Rate;
use super::parser;
use crate::error::Result;

/// Method string covering every HTTP method.
pub const ANY_METHOD: &str = "*";

/// Resource component used for rules without an explicit resource list.
pub const ALL_RESOURCES: &str = "*";

/// One admission policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RateRule {
    /// Methods this rule covers, kept exactly as configured
    pub methods: String,
    /// Resource path prefixes; empty means every resource
    pub resources: Vec<String>,
    /// Requests allowed per `unit`
    pub rate: i64,
    /// Bucket capacity
    pub burst: i64,
    /// Quota unit; anything unrecognized means unlimited
    pub unit: String,
    /// Address ranges exempt from this rule
    pub whitelist: Vec<IpNet>,
}

impl RateRule {
    /// Create a rule applying to every resource.
    pub fn new(methods: impl Into<String>, rate: i64, burst: i64, unit: impl Into<String>) -> Self {
        Self {
            methods: methods.into(),
            resources: Vec::new(),
            rate,
            burst,
            unit: unit.into(),
            whitelist: Vec::new(),
        }
    }

    /// Restrict the rule to an additional resource prefix.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    /// Exempt an address range from the rule.
    pub fn with_whitelist(mut self, net: IpNet) -> Self {
        self.whitelist.push(net);
        self
    }

    /// Refill rate of buckets created for this rule.
    pub fn refill_rate(&self) -> Rate {
        Rate::from_quota(self.rate, &self.unit)
    }

    /// Whether the rule applies to `method`.
    ///
    /// `*` covers every method; otherwise `methods` is a comma-separated list
    /// and `method` must equal one of its entries.
    pub fn covers_method(&self, method: &str) -> bool {
        self.methods == ANY_METHOD || self.methods.split(',').any(|m| m.trim() == method)
    }

    /// The configured resources that `path` falls under, in order.
    ///
    /// A rule without resources yields [`ALL_RESOURCES`] for every path.
    pub fn matching_resources<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let implicit = self.resources.is_empty().then_some(ALL_RESOURCES);
        implicit.into_iter().chain(
            self.resources
                .iter()
                .map(String::as_str)
                .filter(move |resource| path.starts_with(resource)),
        )
    }

    /// Whether `ip` is exempt from this rule.
    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        any_contains(&self.whitelist, ip)
    }
}

/// IPv4-mapped IPv6 addresses are matched as the IPv4 address they carry,
/// so `::ffff:10.1.2.3` falls inside `10.0.0.0/8`.
fn any_contains(nets: &[IpNet], ip: &IpAddr) -> bool {
    let ip = ip.to_canonical();
    nets.iter().any(|net| net.contains(&ip))
}

/// Which whitelist the gate consults for a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhitelistScope {
    /// Union of every rule's ranges exempts from every rule
    #[default]
    Global,
    /// A rule's ranges exempt only from that rule
    Rule,
}

/// A set of parsed address ranges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Whitelist {
    nets: Vec<IpNet>,
}

impl Whitelist {
    /// Create a whitelist from parsed ranges.
    pub fn new(nets: Vec<IpNet>) -> Self {
        Self { nets }
    }

    /// Collect the ranges of every rule, in rule order.
    pub fn from_rules(rules: &[RateRule]) -> Self {
        Self::new(
            rules
                .iter()
                .flat_map(|rule| rule.whitelist.iter().copied())
                .collect(),
        )
    }

    /// Whether any range contains `ip`.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        any_contains(&self.nets, ip)
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

/// The complete, immutable rule configuration.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RateRule>,
    whitelist: Whitelist,
}

impl RuleSet {
    /// Create a rule set, precomputing the combined whitelist.
    pub fn new(rules: Vec<RateRule>) -> Self {
        let whitelist = Whitelist::from_rules(&rules);
        Self { rules, whitelist }
    }

    /// Load rules from a file in the `ratelimit` directive syntax.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse rules from a string in the `ratelimit` directive syntax.
    pub fn parse(source: &str) -> Result<Self> {
        let rules = parser::parse_rules(source)?;
        info!(
            rules = rules.len(),
            whitelist_ranges = rules.iter().map(|r| r.whitelist.len()).sum::<usize>(),
            "Rate limit rules loaded"
        );
        Ok(Self::new(rules))
    }

    /// Rules in configuration order.
    pub fn rules(&self) -> &[RateRule] {
        &self.rules
    }

    /// Union of every rule's whitelist.
    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(cidr: &str) -> IpNet {
        cidr.parse().unwrap()
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn test_any_method() {
        let rule = RateRule::new("*", 1, 1, "second");

        assert!(rule.covers_method("GET"));
        assert!(rule.covers_method("DELETE"));
    }

    #[test]
    fn test_method_list() {
        let rule = RateRule::new("GET,POST", 1, 1, "second");

        assert!(rule.covers_method("GET"));
        assert!(rule.covers_method("POST"));
        assert!(!rule.covers_method("PUT"));
        assert!(!rule.covers_method("get"));
        assert!(!rule.covers_method("GE"));
    }

    #[test]
    fn test_rule_without_resources_matches_everything() {
        let rule = RateRule::new("GET", 1, 1, "second");

        let matched: Vec<&str> = rule.matching_resources("/anything/at/all").collect();
        assert_eq!(matched, vec![ALL_RESOURCES]);
    }

    #[test]
    fn test_resources_match_by_prefix_in_order() {
        let rule = RateRule::new("GET", 1, 1, "second")
            .with_resource("/api/v1")
            .with_resource("/static")
            .with_resource("/api");

        let matched: Vec<&str> = rule.matching_resources("/api/v1/users").collect();
        assert_eq!(matched, vec!["/api/v1", "/api"]);

        assert_eq!(rule.matching_resources("/other").count(), 0);
    }

    #[test]
    fn test_rule_whitelist() {
        let rule = RateRule::new("GET", 1, 1, "second")
            .with_whitelist(net("10.0.0.0/8"))
            .with_whitelist(net("2001:db8::/32"));

        assert!(rule.is_whitelisted(&ip("10.1.2.3")));
        assert!(rule.is_whitelisted(&ip("2001:db8::1")));
        assert!(!rule.is_whitelisted(&ip("11.0.0.1")));
        assert!(!rule.is_whitelisted(&ip("::1")));
    }

    #[test]
    fn test_ipv4_mapped_addresses_match_ipv4_ranges() {
        let rule = RateRule::new("GET", 1, 1, "second").with_whitelist(net("10.0.0.0/8"));
        let set = RuleSet::new(vec![rule.clone()]);

        assert!(rule.is_whitelisted(&ip("::ffff:10.1.2.3")));
        assert!(set.whitelist().contains(&ip("::ffff:10.1.2.3")));
        assert!(!rule.is_whitelisted(&ip("::ffff:11.1.2.3")));
        assert!(!set.whitelist().contains(&ip("::ffff:11.1.2.3")));
    }

    #[test]
    fn test_rule_set_combines_whitelists() {
        let rules = vec![
            RateRule::new("GET", 1, 1, "second").with_whitelist(net("10.0.0.0/8")),
            RateRule::new("POST", 1, 1, "second"),
            RateRule::new("PUT", 1, 1, "second").with_whitelist(net("192.168.0.0/16")),
        ];
        let set = RuleSet::new(rules);

        assert_eq!(set.len(), 3);
        assert_eq!(set.whitelist().len(), 2);
        assert!(set.whitelist().contains(&ip("10.9.9.9")));
        assert!(set.whitelist().contains(&ip("192.168.1.1")));
        assert!(!set.whitelist().contains(&ip("172.16.0.1")));
    }

    #[test]
    fn test_refill_rate_follows_unit() {
        assert_eq!(RateRule::new("GET", 60, 1, "minute").refill_rate(), Rate::PerSecond(1.0));
        assert_eq!(RateRule::new("GET", 60, 1, "lightyear").refill_rate(), Rate::Unlimited);
    }

    #[test]
    fn test_rule_set_from_missing_file() {
        let err = RuleSet::from_file("/nonexistent/turnstile/rules.conf").unwrap_err();
        assert!(matches!(err, crate::error::TurnstileError::Io(_)));
    }
}
