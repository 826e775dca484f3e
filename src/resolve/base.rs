//! Resolver contract, TTL cache and happy-eyeballs dialing.

use crate::errors::{Error, Result};
use crate::http::wire::BoxedTransport;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, trace};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// One resolved endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Record {
    /// IPv4 address and port.
    V4(Ipv4Addr, u16),
    /// IPv6 address and port.
    V6(Ipv6Addr, u16),
    /// Local socket path (unix domain socket).
    Local(PathBuf),
}

impl Record {
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(ip) => Record::V4(ip, port),
            IpAddr::V6(ip) => Record::V6(ip, port),
        }
    }
}

/// Dials one record, wrapping the stream in TLS when a connector is
/// supplied. The SNI name is always the original hostname, never the
/// connected address.
async fn open_connection(
    record: &Record,
    host: &str,
    tls: Option<&TlsConnector>,
) -> Result<BoxedTransport> {
    let plain: BoxedTransport = match record {
        Record::V4(ip, port) => {
            Box::new(TcpStream::connect((IpAddr::V4(*ip), *port)).await?)
        }
        Record::V6(ip, port) => {
            Box::new(TcpStream::connect((IpAddr::V6(*ip), *port)).await?)
        }
        #[cfg(unix)]
        Record::Local(path) => Box::new(tokio::net::UnixStream::connect(path).await?),
        #[cfg(not(unix))]
        Record::Local(_) => {
            return Err(Error::UnresolvableHost(
                "local socket records are not supported on this platform".to_owned(),
            ))
        }
    };

    match tls {
        Some(connector) => {
            let server_name = rustls::ServerName::try_from(host).map_err(|_| {
                Error::UnresolvableHost(format!("{host} is not a valid server name"))
            })?;

            let stream = connector.connect(server_name, plain).await?;

            Ok(Box::new(stream))
        }
        None => Ok(plain),
    }
}

/// A resolver answer: the record set for `host:port` plus its freshness
/// window and the remembered fastest record.
#[derive(Debug)]
pub struct ResolvedResult {
    host: String,
    port: u16,
    results: Vec<Record>,
    ttl: i64,
    resolved_at: Instant,
    fastest: Mutex<Option<Record>>,
}

impl ResolvedResult {
    /// `ttl` is in seconds; `-1` marks a sticky entry that never
    /// expires.
    pub fn new(host: impl Into<String>, port: u16, results: Vec<Record>, ttl: i64) -> Self {
        Self {
            host: host.into(),
            port,
            results,
            ttl,
            resolved_at: Instant::now(),
            fastest: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn records(&self) -> &[Record] {
        &self.results
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn expired(&self) -> bool {
        if self.ttl < 0 {
            return false;
        }

        self.resolved_at.elapsed() >= Duration::from_secs(self.ttl as u64)
    }

    /// Connects to the fastest reachable record.
    ///
    /// A previously successful record is attempted alone first; when it
    /// fails it is forgotten and every record is raced concurrently. The
    /// first successful attempt wins and is remembered; losing attempts
    /// are dropped before this returns, so no connect task outlives the
    /// call.
    pub(crate) async fn connect_fastest(
        &self,
        tls: Option<&TlsConnector>,
    ) -> Result<BoxedTransport> {
        let cached = self.fastest.lock().unwrap().clone();

        if let Some(record) = cached {
            trace!("trying cached fastest record for {}:{}", self.host, self.port);

            match open_connection(&record, &self.host, tls).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    debug!(
                        "cached fastest record for {}:{} failed: {}",
                        self.host, self.port, e
                    );
                    *self.fastest.lock().unwrap() = None;
                }
            }
        }

        let mut attempts: FuturesUnordered<_> = self
            .results
            .iter()
            .map(|record| async move {
                (record, open_connection(record, &self.host, tls).await)
            })
            .collect();

        while let Some((record, outcome)) = attempts.next().await {
            match outcome {
                Ok(transport) => {
                    trace!("connected to {record:?} for {}:{}", self.host, self.port);
                    *self.fastest.lock().unwrap() = Some(record.clone());

                    return Ok(transport);
                }
                Err(e) => {
                    debug!("connect attempt {record:?} failed: {e}");
                }
            }
        }

        Err(Error::UnresolvableHost(format!(
            "{}:{} is not reachable.",
            self.host, self.port
        )))
    }
}

type CacheKey = (String, u16);

/// Shared lookup state every resolver embeds: the TTL cache, sticky
/// overrides and the TTL policy knobs.
#[derive(Debug)]
pub struct ResolverCache {
    min_ttl: u64,
    respect_remote_ttl: bool,
    cache: Mutex<HashMap<CacheKey, std::sync::Arc<ResolvedResult>>>,
    overrides: Mutex<HashMap<CacheKey, std::sync::Arc<ResolvedResult>>>,
}

impl ResolverCache {
    pub fn new(min_ttl: u64, respect_remote_ttl: bool) -> Self {
        Self {
            min_ttl,
            respect_remote_ttl,
            cache: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_ttl(&self) -> u64 {
        self.min_ttl
    }

    /// Effective TTL for a lookup: the authoritative TTL when it is
    /// respected and above the floor, the floor otherwise.
    pub fn effective_ttl(&self, remote_ttl: Option<u64>) -> i64 {
        match remote_ttl {
            Some(ttl) if self.respect_remote_ttl && ttl > self.min_ttl => ttl as i64,
            _ => self.min_ttl as i64,
        }
    }

    fn get_override(&self, host: &str, port: u16) -> Option<std::sync::Arc<ResolvedResult>> {
        self.overrides
            .lock()
            .unwrap()
            .get(&(host.to_owned(), port))
            .cloned()
    }

    fn get_cached(&self, host: &str, port: u16) -> Option<std::sync::Arc<ResolvedResult>> {
        let key = (host.to_owned(), port);
        let mut cache = self.cache.lock().unwrap();

        match cache.get(&key) {
            Some(result) if result.expired() => {
                trace!("resolver cache entry for {host}:{port} expired");
                cache.remove(&key);
                None
            }
            Some(result) => Some(result.clone()),
            None => None,
        }
    }

    fn store(&self, host: &str, port: u16, result: std::sync::Arc<ResolvedResult>) {
        self.cache
            .lock()
            .unwrap()
            .insert((host.to_owned(), port), result);
    }

    fn set_override(&self, host: &str, port: u16, record: Record) {
        self.overrides.lock().unwrap().insert(
            (host.to_owned(), port),
            std::sync::Arc::new(ResolvedResult::new(host, port, vec![record], -1)),
        );
    }

    fn remove_override(&self, host: &str, port: u16) {
        self.overrides
            .lock()
            .unwrap()
            .remove(&(host.to_owned(), port));
    }
}

/// A pluggable name resolver.
///
/// Implementations provide [`lookup_now`](Resolver::lookup_now); caching,
/// override precedence and the IP-literal fast path come with the
/// default [`lookup`](Resolver::lookup).
#[async_trait]
pub trait Resolver: Send + Sync {
    /// The shared cache/override store of this resolver.
    fn cache(&self) -> &ResolverCache;

    /// Resolves without consulting the in-memory cache. Implementations
    /// with their own caching layer must bypass it here.
    async fn lookup_now(&self, host: &str, port: u16) -> Result<ResolvedResult>;

    /// Resolves `host:port`, serving manual overrides first, then the
    /// TTL cache, then a live lookup. IP-literal hosts short-circuit
    /// without touching either.
    async fn lookup(&self, host: &str, port: u16) -> Result<std::sync::Arc<ResolvedResult>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(std::sync::Arc::new(ResolvedResult::new(
                host,
                port,
                vec![Record::from_ip(ip, port)],
                -1,
            )));
        }

        if let Some(result) = self.cache().get_override(host, port) {
            return Ok(result);
        }

        if let Some(result) = self.cache().get_cached(host, port) {
            return Ok(result);
        }

        let fresh = std::sync::Arc::new(self.lookup_now(host, port).await?);
        self.cache().store(host, port, fresh.clone());

        Ok(fresh)
    }

    /// Pins `host:port` to `record` until removed, bypassing cache and
    /// live lookups.
    fn add_override(&self, host: &str, port: u16, record: Record) {
        self.cache().set_override(host, port, record);
    }

    fn remove_override(&self, host: &str, port: u16) {
        self.cache().remove_override(host, port);
    }
}
