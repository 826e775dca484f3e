//! Asynchronous DNS resolver querying A and AAAA records in parallel.

use crate::errors::{Error, Result};
use crate::resolve::base::{Record, ResolvedResult, Resolver, ResolverCache};
use crate::resolve::hosts::HostsResolver;
use async_trait::async_trait;
use log::debug;
use std::net::IpAddr;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Builds a [`DnsResolver`].
#[derive(Debug, Clone)]
pub struct DnsResolverBuilder {
    min_ttl: u64,
    respect_remote_ttl: bool,
    respect_hosts_file: bool,
    dns_servers: Option<Vec<IpAddr>>,
}

impl Default for DnsResolverBuilder {
    fn default() -> Self {
        Self {
            min_ttl: 60,
            respect_remote_ttl: true,
            respect_hosts_file: true,
            dns_servers: None,
        }
    }
}

impl DnsResolverBuilder {
    /// Lower bound in seconds on how long answers stay cached.
    pub fn min_ttl(mut self, min_ttl: u64) -> Self {
        self.min_ttl = min_ttl;
        self
    }

    /// Whether authoritative TTLs above `min_ttl` are honoured.
    pub fn respect_remote_ttl(mut self, respect: bool) -> Self {
        self.respect_remote_ttl = respect;
        self
    }

    /// Whether a hosts-file hit short-circuits the remote queries.
    pub fn respect_hosts_file(mut self, respect: bool) -> Self {
        self.respect_hosts_file = respect;
        self
    }

    /// Custom DNS servers (port 53) instead of the defaults.
    pub fn dns_servers(mut self, servers: Vec<IpAddr>) -> Self {
        self.dns_servers = Some(servers);
        self
    }

    pub fn build(self) -> DnsResolver {
        let config = match &self.dns_servers {
            Some(servers) => ResolverConfig::from_parts(
                None,
                Vec::new(),
                NameServerConfigGroup::from_ips_clear(servers, 53, true),
            ),
            None => ResolverConfig::default(),
        };

        // The crate keeps its own TTL cache; a second one underneath
        // would defeat lookup_now's no-cache contract.
        let mut opts = ResolverOpts::default();
        opts.cache_size = 0;

        DnsResolver {
            cache: ResolverCache::new(self.min_ttl, self.respect_remote_ttl),
            hosts: self.respect_hosts_file.then(|| {
                HostsResolver::with_options(
                    self.min_ttl,
                    self.respect_remote_ttl,
                    crate::resolve::hosts::system_hosts_path(),
                )
            }),
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

/// Resolves names by issuing `A` and `AAAA` queries concurrently and
/// merging the answers. Both queries are awaited; the effective TTL is
/// the smallest observed, floored at `min_ttl`.
pub struct DnsResolver {
    cache: ResolverCache,
    hosts: Option<HostsResolver>,
    resolver: TokioAsyncResolver,
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> DnsResolverBuilder {
        DnsResolverBuilder::default()
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    async fn lookup_now(&self, host: &str, port: u16) -> Result<ResolvedResult> {
        if let Some(hosts) = &self.hosts {
            if let Ok(result) = hosts.lookup(host, port).await {
                return Ok(ResolvedResult::new(
                    host,
                    port,
                    result.records().to_vec(),
                    result.ttl(),
                ));
            }
        }

        let (v4, v6) = futures::join!(
            self.resolver.ipv4_lookup(host),
            self.resolver.ipv6_lookup(host),
        );

        let mut records = Vec::new();
        let mut remote_ttl: Option<u64> = None;

        match v4 {
            Ok(lookup) => {
                for a in lookup.iter() {
                    records.push(Record::V4(a.0, port));
                }

                for record in lookup.as_lookup().records() {
                    let ttl = record.ttl() as u64;
                    remote_ttl = Some(remote_ttl.map_or(ttl, |t| t.min(ttl)));
                }
            }
            Err(e) => debug!("A lookup for {host} failed: {e}"),
        }

        match v6 {
            Ok(lookup) => {
                for aaaa in lookup.iter() {
                    records.push(Record::V6(aaaa.0, port));
                }

                for record in lookup.as_lookup().records() {
                    let ttl = record.ttl() as u64;
                    remote_ttl = Some(remote_ttl.map_or(ttl, |t| t.min(ttl)));
                }
            }
            Err(e) => debug!("AAAA lookup for {host} failed: {e}"),
        }

        if records.is_empty() {
            return Err(Error::UnresolvableHost(format!(
                "Failed to resolve {host}:{port}"
            )));
        }

        Ok(ResolvedResult::new(
            host,
            port,
            records,
            self.cache.effective_ttl(remote_ttl),
        ))
    }
}
