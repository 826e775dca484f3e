//! Operating-system resolver.

use crate::errors::{Error, Result};
use crate::resolve::base::{Record, ResolvedResult, Resolver, ResolverCache};
use async_trait::async_trait;

/// Delegates to the operating system's `getaddrinfo`.
///
/// The OS consults its own hosts file and any system-level DNS cache, so
/// this is a good default on platforms that cache resolver answers.
#[derive(Debug)]
pub struct SystemResolver {
    cache: ResolverCache,
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemResolver {
    pub fn new() -> Self {
        Self::with_options(60, true)
    }

    pub fn with_options(min_ttl: u64, respect_remote_ttl: bool) -> Self {
        Self {
            cache: ResolverCache::new(min_ttl, respect_remote_ttl),
        }
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    async fn lookup_now(&self, host: &str, port: u16) -> Result<ResolvedResult> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| Error::UnresolvableHost(format!("Failed to resolve {host}:{port}")))?;

        let mut records: Vec<Record> = addrs
            .map(|addr| Record::from_ip(addr.ip(), addr.port()))
            .collect();

        records.dedup();

        if records.is_empty() {
            return Err(Error::UnresolvableHost(format!(
                "Failed to resolve {host}:{port}"
            )));
        }

        Ok(ResolvedResult::new(
            host,
            port,
            records,
            self.cache.effective_ttl(None),
        ))
    }
}
