//! A-record lookup backends for destination rewriting.
//!
//! [`DohResolver`] asks a DNS-over-HTTPS JSON endpoint; [`SystemResolver`]
//! goes through `tokio::net::lookup_host`. [`DnsBackend`] picks one of them
//! from config.

use crate::config::{DnsMode, DnsSettings};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use tokio::net;
use tracing::{debug, warn};
use vless_core::{RelayError, RelayResult, ResolveA};

/// DNS record type number for A records.
const RECORD_TYPE_A: u16 = 1;

/// JSON body returned by `application/dns-json` endpoints.
#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

impl DohResponse {
    /// First answer of type A. CNAME entries ahead of it are skipped.
    fn first_a_record(self) -> Option<String> {
        self.answer
            .into_iter()
            .find(|a| a.record_type == RECORD_TYPE_A)
            .map(|a| a.data)
    }
}

/// DNS-over-HTTPS resolver using the JSON API.
pub struct DohResolver {
    client: reqwest::Client,
    url: String,
}

impl DohResolver {
    pub fn new(settings: &DnsSettings) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| RelayError::Dns(format!("failed to build DoH client: {e}")))?;
        Ok(Self {
            client,
            url: settings.doh_url.clone(),
        })
    }

    async fn query(&self, name: &str) -> RelayResult<Option<String>> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("name", name), ("type", "A")])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| RelayError::Dns(format!("DoH request failed: {e}")))?
            .error_for_status()
            .map_err(|e| RelayError::Dns(format!("DoH request failed: {e}")))?;

        let body: DohResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Dns(format!("invalid DoH response: {e}")))?;

        let ip = body.first_a_record();
        debug!(name = %name, ip = ?ip, "DoH lookup");
        Ok(ip)
    }
}

impl ResolveA for DohResolver {
    fn resolve_a<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Option<String>>> + Send + 'a>> {
        Box::pin(self.query(name))
    }
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

impl SystemResolver {
    async fn lookup(name: &str) -> RelayResult<Option<String>> {
        // lookup_host needs a host:port pair
        let addrs = net::lookup_host((name, 0)).await.map_err(|e| {
            warn!(name = %name, error = %e, "DNS resolution failed");
            RelayError::Dns(format!("DNS resolution failed for {name}: {e}"))
        })?;
        let ip = addrs
            .map(|addr| addr.ip())
            .find(|ip| ip.is_ipv4())
            .map(|ip| ip.to_string());
        debug!(name = %name, ip = ?ip, "system lookup");
        Ok(ip)
    }
}

impl ResolveA for SystemResolver {
    fn resolve_a<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Option<String>>> + Send + 'a>> {
        Box::pin(Self::lookup(name))
    }
}

/// The resolver selected by `[dns] mode`.
pub enum DnsBackend {
    Doh(DohResolver),
    System(SystemResolver),
}

impl DnsBackend {
    pub fn from_settings(settings: &DnsSettings) -> RelayResult<Self> {
        Ok(match settings.mode {
            DnsMode::Doh => Self::Doh(DohResolver::new(settings)?),
            DnsMode::System => Self::System(SystemResolver),
        })
    }
}

impl ResolveA for DnsBackend {
    fn resolve_a<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = RelayResult<Option<String>>> + Send + 'a>> {
        match self {
            Self::Doh(r) => r.resolve_a(name),
            Self::System(r) => r.resolve_a(name),
        }
    }
}
