//! Admission gate in front of a downstream handler.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};

use super::handler::{Handler, Request, Response, STATUS_TOO_MANY_REQUESTS};
use crate::ratelimit::{build_key, KeyedLimiterRegistry, RateRule, RetryAfter, RuleSet, WhitelistScope};

/// Standard header carrying the retry delay in whole seconds.
pub const RETRY_AFTER_HEADER: &str = "Retry-After";
/// Header carrying the retry delay as a human-readable duration.
pub const RATE_LIMIT_RETRY_AFTER_HEADER: &str = "X-RateLimit-RetryAfter";

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Every applicable rule admitted the request
    Allowed,
    /// The bucket for `key` rejected the request
    Denied { key: String, retry_after: RetryAfter },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Checks each request against the configured rules and forwards admitted
/// requests to the next handler.
pub struct RequestGate<H> {
    registry: Arc<KeyedLimiterRegistry>,
    rules: Arc<RuleSet>,
    whitelist_scope: WhitelistScope,
    next: H,
}

impl<H> RequestGate<H> {
    /// Create a gate consulting the combined whitelist of every rule.
    pub fn new(registry: Arc<KeyedLimiterRegistry>, rules: Arc<RuleSet>, next: H) -> Self {
        Self {
            registry,
            rules,
            whitelist_scope: WhitelistScope::default(),
            next,
        }
    }

    /// Choose which whitelist exempts a client from a rule.
    pub fn with_whitelist_scope(mut self, scope: WhitelistScope) -> Self {
        self.whitelist_scope = scope;
        self
    }

    pub fn registry(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.registry
    }

    /// Decide whether `request` may proceed.
    ///
    /// Every rule covering the request's method is checked, once per
    /// configured resource the path falls under. The first rejecting bucket
    /// decides; buckets checked before it keep the tokens they gave out.
    pub fn admit(&self, request: &Request) -> Admission {
        let client = request.client_ip.to_string();

        for rule in self.rules.rules() {
            if self.is_whitelisted(rule, &request.client_ip) {
                trace!(client = %client, methods = %rule.methods, "Client whitelisted");
                continue;
            }
            if !rule.covers_method(&request.method) {
                continue;
            }

            for resource in rule.matching_resources(&request.path) {
                let key = build_key(&client, &rule.methods, resource);
                if !self.registry.allow(&key, rule) {
                    let retry_after = self.registry.retry_after(&key).unwrap_or(RetryAfter::Never);
                    debug!(key = %key, retry_after = %retry_after, "Request rejected");
                    return Admission::Denied { key, retry_after };
                }
            }
        }

        Admission::Allowed
    }

    fn is_whitelisted(&self, rule: &RateRule, ip: &IpAddr) -> bool {
        match self.whitelist_scope {
            WhitelistScope::Global => self.rules.whitelist().contains(ip),
            WhitelistScope::Rule => rule.is_whitelisted(ip),
        }
    }
}

/// Build the rejection response for a denied request.
pub fn too_many_requests(retry_after: RetryAfter) -> Response {
    let response = Response::new(STATUS_TOO_MANY_REQUESTS);
    match retry_after.as_secs_ceil() {
        Some(secs) => response
            .with_header(RATE_LIMIT_RETRY_AFTER_HEADER, retry_after.to_string())
            .with_header(RETRY_AFTER_HEADER, secs.to_string()),
        None => response,
    }
}

#[async_trait]
impl<H: Handler> Handler for RequestGate<H> {
    #[instrument(
        skip(self, request),
        fields(
            client = %request.client_ip,
            method = %request.method,
            path = %request.path
        )
    )]
    async fn handle(&self, request: Request) -> Response {
        match self.admit(&request) {
            Admission::Allowed => self.next.handle(request).await,
            Admission::Denied { key, retry_after } => {
                info!(key = %key, retry_after = %retry_after, "Rate limit decision made");
                too_many_requests(retry_after)
            }
        }
    }
}
