//! Destination rewriting based on an A-record lookup.
//!
//! When a destination resolves into the edge network, connecting to it from
//! inside that network loops back through the edge. Such destinations are
//! replaced by a fixed fallback host.

use crate::cidr::is_edge_address;
use crate::error::RelayResult;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use tracing::debug;

/// Host substituted for destinations that resolve into the edge network.
pub const EDGE_FALLBACK_HOST: &str = "dns2.easydns.com";

/// A-record lookup collaborator (DoH, system resolver, or a test double).
pub trait ResolveA: Send + Sync {
    /// Return the first A record for `name`, if any.
    fn resolve_a<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Option<String>>> + Send + 'a>>;
}

/// The host the outbound connection is opened to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub hostname: String,
}

/// Picks the outbound host for a requested destination.
pub struct DestinationResolver<R> {
    resolver: R,
    fallback_host: String,
}

impl<R: ResolveA> DestinationResolver<R> {
    pub fn new(resolver: R) -> Self {
        Self::with_fallback(resolver, EDGE_FALLBACK_HOST)
    }

    pub fn with_fallback(resolver: R, fallback_host: impl Into<String>) -> Self {
        Self {
            resolver,
            fallback_host: fallback_host.into(),
        }
    }

    pub fn fallback_host(&self) -> &str {
        &self.fallback_host
    }

    /// Resolve `host` and substitute the fallback on an edge-network hit.
    ///
    /// Lookup failures are not fatal: the original host is kept. IP literals
    /// are never looked up.
    pub async fn resolve(&self, host: &str) -> ResolvedTarget {
        if host.parse::<IpAddr>().is_ok() {
            return ResolvedTarget {
                hostname: host.to_string(),
            };
        }

        let hostname = match self.resolver.resolve_a(host).await {
            Ok(Some(ip)) if is_edge_address(&ip) => {
                debug!(host = %host, ip = %ip, fallback = %self.fallback_host, "destination resolves into edge network");
                self.fallback_host.clone()
            }
            Ok(_) => host.to_string(),
            Err(e) => {
                debug!(host = %host, error = %e, "A lookup failed, keeping original host");
                host.to_string()
            }
        };

        ResolvedTarget { hostname }
    }
}
