//! DNS-to-CIDR resolution
//!
//! NetworkPolicy only matches IP blocks, so DNS peers are resolved at
//! reconcile time into one host-length CIDR per address. The result is a
//! snapshot; it goes stale when the provider rotates addresses and heals on
//! the next reconcile.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use langop_common::Error;

/// CIDR emitted for a bare `*` wildcard
pub const ANY_IPV4: &str = "0.0.0.0/0";

/// Name resolution seam
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolve a hostname to its current addresses
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, Error>;
}

/// Resolver backed by the system resolver via tokio
#[derive(Clone, Debug)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    /// Resolver with a per-lookup deadline
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        let lookup = tokio::net::lookup_host((host, 0));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| Error::timeout(format!("dns lookup {}", host), self.timeout.as_secs()))?
            .map_err(|e| {
                Error::internal_with_context("dns", format!("lookup {} failed: {}", host, e))
            })?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Fixed host table, for tests and air-gapped setups
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    hosts: BTreeMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host entry
    pub fn with_host(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.hosts.insert(host.to_string(), addrs.to_vec());
        self
    }
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        self.hosts.get(host).cloned().ok_or_else(|| {
            Error::internal_with_context("dns", format!("no such host: {}", host))
        })
    }
}

/// Host-length CIDR for an address (`/32` or `/128`)
pub fn host_cidr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}/32", v4),
        IpAddr::V6(v6) => format!("{}/128", v6),
    }
}

/// Resolve one DNS peer entry into sorted, de-duplicated CIDRs
///
/// `*` allows everything; `*.example.com` resolves the apex
/// `example.com`, since subdomains cannot be enumerated.
pub async fn resolve_to_cidrs(resolver: &dyn DnsResolver, name: &str) -> Result<Vec<String>, Error> {
    let name = name.trim().trim_end_matches('.');
    if name == "*" {
        return Ok(vec![ANY_IPV4.to_string()]);
    }
    let host = name.strip_prefix("*.").unwrap_or(name);

    let addrs = resolver.lookup(host).await?;
    if addrs.is_empty() {
        return Err(Error::internal_with_context(
            "dns",
            format!("{} resolved to no addresses", host),
        ));
    }

    let cidrs: BTreeSet<String> = addrs.into_iter().map(host_cidr).collect();
    debug!(host = %host, count = cidrs.len(), "resolved dns peer");
    Ok(cidrs.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[tokio::test]
    async fn resolves_and_dedups() {
        let resolver = StaticResolver::new().with_host(
            "api.openai.com",
            &[v4(1, 2, 3, 4), v4(1, 2, 3, 4), v4(5, 6, 7, 8)],
        );
        let cidrs = resolve_to_cidrs(&resolver, "api.openai.com").await.unwrap();
        assert_eq!(cidrs, vec!["1.2.3.4/32", "5.6.7.8/32"]);
    }

    #[tokio::test]
    async fn ipv6_uses_full_prefix() {
        let resolver = StaticResolver::new()
            .with_host("v6.example.com", &[IpAddr::V6(Ipv6Addr::LOCALHOST)]);
        let cidrs = resolve_to_cidrs(&resolver, "v6.example.com").await.unwrap();
        assert_eq!(cidrs, vec!["::1/128"]);
    }

    #[tokio::test]
    async fn wildcards() {
        let mut mock = MockDnsResolver::new();
        mock.expect_lookup().times(1).returning(|host| {
            assert_eq!(host, "example.com");
            Ok(vec![IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))])
        });

        assert_eq!(resolve_to_cidrs(&mock, "*").await.unwrap(), vec![ANY_IPV4]);
        assert_eq!(
            resolve_to_cidrs(&mock, "*.example.com").await.unwrap(),
            vec!["9.9.9.9/32"]
        );
    }

    #[tokio::test]
    async fn unknown_and_empty_hosts_fail() {
        let resolver = StaticResolver::new().with_host("empty.example.com", &[]);
        assert!(resolve_to_cidrs(&resolver, "missing.example.com").await.is_err());
        assert!(resolve_to_cidrs(&resolver, "empty.example.com").await.is_err());
    }

    #[tokio::test]
    async fn system_resolver_handles_ip_literals() {
        let resolver = SystemResolver::new(Duration::from_secs(2));
        let addrs = resolver.lookup("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec![v4(127, 0, 0, 1)]);
    }
}
