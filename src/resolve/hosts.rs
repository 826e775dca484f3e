//! Hosts-file resolver.

use crate::errors::{Error, Result};
use crate::resolve::base::{Record, ResolvedResult, Resolver, ResolverCache};
use async_trait::async_trait;
use log::trace;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::Mutex;

#[cfg(windows)]
pub(crate) fn system_hosts_path() -> PathBuf {
    let root = std::env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
    Path::new(&root)
        .join("system32")
        .join("drivers")
        .join("etc")
        .join("hosts")
}

#[cfg(not(windows))]
pub(crate) fn system_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

#[derive(Debug, Default)]
struct HostsContent {
    entries: HashMap<String, Vec<IpAddr>>,
    last_read: Option<Instant>,
}

/// Resolves names by reading a hosts file.
///
/// The file is re-read at most once per `min_ttl` window. Lines are
/// `<ip> <name>` pairs; comments and lines that do not parse are
/// silently ignored.
#[derive(Debug)]
pub struct HostsResolver {
    cache: ResolverCache,
    path: PathBuf,
    content: Mutex<HostsContent>,
}

impl Default for HostsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostsResolver {
    pub fn new() -> Self {
        Self::with_options(60, true, system_hosts_path())
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self::with_options(60, true, path)
    }

    pub fn with_options(
        min_ttl: u64,
        respect_remote_ttl: bool,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache: ResolverCache::new(min_ttl, respect_remote_ttl),
            path: path.into(),
            content: Mutex::new(HostsContent::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn refresh(&self, content: &mut HostsContent) -> std::io::Result<()> {
        if let Some(last_read) = content.last_read {
            if last_read.elapsed().as_secs() < self.cache.min_ttl() {
                return Ok(());
            }
        }

        let raw = tokio::fs::read_to_string(&self.path).await?;
        content.entries = parse_hosts(&raw);
        content.last_read = Some(Instant::now());
        trace!("hosts file {} re-read", self.path.display());

        Ok(())
    }
}

fn parse_hosts(raw: &str) -> HashMap<String, Vec<IpAddr>> {
    let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();

    for line in raw.lines() {
        let line = match line.split_once('#') {
            Some((before, _)) => before,
            None => line,
        };

        let mut tokens = line.split_whitespace();

        let (Some(ip), Some(host), None) = (tokens.next(), tokens.next(), tokens.next())
        else {
            continue;
        };

        let Ok(ip) = ip.parse::<IpAddr>() else {
            continue;
        };

        entries.entry(host.to_owned()).or_default().push(ip);
    }

    entries
}

#[async_trait]
impl Resolver for HostsResolver {
    fn cache(&self) -> &ResolverCache {
        &self.cache
    }

    async fn lookup_now(&self, host: &str, port: u16) -> Result<ResolvedResult> {
        let mut content = self.content.lock().await;

        self.refresh(&mut content)
            .await
            .map_err(|_| Error::UnresolvableHost(format!("Failed to resolve {host}:{port}")))?;

        let ips = content
            .entries
            .get(host)
            .ok_or_else(|| Error::UnresolvableHost(format!("Failed to resolve {host}:{port}")))?;

        let records = ips.iter().map(|&ip| Record::from_ip(ip, port)).collect();

        Ok(ResolvedResult::new(
            host,
            port,
            records,
            self.cache.effective_ttl(None),
        ))
    }
}
