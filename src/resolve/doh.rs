//! DNS-over-HTTPS resolver.

use crate::client::client_impl::{FetchOpts, HttpClient};
use crate::errors::{Error, Result};
use crate::limits::ClientLimits;
use crate::resolve::base::{Record, ResolvedResult, Resolver, ResolverCache};
use crate::resolve::hosts::HostsResolver;
use crate::resolve::system::SystemResolver;
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DNS_URL: &str = "https://cloudflare-dns.com/dns-query";

/// `application/dns-json` answer document.
#[derive(Debug, Deserialize)]
struct DnsJsonReply {
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsJsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct DnsJsonAnswer {
    data: String,
    #[serde(rename = "TTL")]
    ttl: u64,
}

/// Builds an [`HttpsResolver`].
pub struct HttpsResolverBuilder {
    min_ttl: u64,
    respect_remote_ttl: bool,
    respect_hosts_file: bool,
    dns_url: String,
    fallback_resolver: Option<Arc<dyn Resolver>>,
}

impl Default for HttpsResolverBuilder {
    fn default() -> Self {
        Self {
            min_ttl: 60,
            respect_remote_ttl: true,
            respect_hosts_file: true,
            dns_url: DEFAULT_DNS_URL.to_owned(),
            fallback_resolver: None,
        }
    }
}

impl HttpsResolverBuilder {
    pub fn min_ttl(mut self, min_ttl: u64) -> Self {
        self.min_ttl = min_ttl;
        self
    }

    pub fn respect_remote_ttl(mut self, respect: bool) -> Self {
        self.respect_remote_ttl = respect;
        self
    }

    pub fn respect_hosts_file(mut self, respect: bool) -> Self {
        self.respect_hosts_file = respect;
        self
    }

    /// The DoH endpoint. It must support `application/dns-json`
    /// responses.
    pub fn dns_url(mut self, dns_url: impl Into<String>) -> Self {
        self.dns_url = dns_url.into();
        self
    }

    /// The resolver used to resolve the DoH endpoint's own hostname.
    /// Defaults to [`SystemResolver`], which breaks the cycle between
    /// this resolver and the client it rides on.
    pub fn fallback_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.fallback_resolver = Some(resolver);
        self
    }

    pub fn build(self) -> HttpsResolver {
        let fallback = self
            .fallback_resolver
            .unwrap_or_else(|| Arc::new(SystemResolver::new()));

        let client = HttpClient::builder()
            .limits(ClientLimits {
                timeout: Duration::from_secs(15),
                ..ClientLimits::default()
            })
            .resolver(fallback)
            .build();

        HttpsResolver {
            cache: ResolverCache::new(self.min_ttl, self.respect_remote_ttl),
            hosts: self.respect_hosts_file.then(|| {
                HostsResolver::with_options(
                    self.min_ttl,
                    self.respect_remote_ttl,
                    crate::resolve::hosts::system_hosts_path(),
                )
            }),
            dns_url: self.dns_url,
            client,
        }
    }
}

/// Resolves names over DNS-over-HTTPS: two parallel GETs (`A` and
/// `AAAA`) against the endpoint, answers merged with a min-TTL floor.
pub struct HttpsResolver {
    cache: ResolverCache,
    hosts: Option<HostsResolver>,
    dns_url: String,
    client: HttpClient,
}

impl Default for HttpsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpsResolver {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HttpsResolverBuilder {
        HttpsResolverBuilder::default()
    }

    async fn query(
        &self,
        host: &str,
        port: u16,
        record_type: &str,
    ) -> Result<(Vec<Record>, u64)> {
        let unresolvable =
            || Error::UnresolvableHost(format!("Failed to resolve {host}:{port}"));

        let mut headers = crate::http::types::HeaderMap::new();
        headers.append("accept", "application/dns-json");

        let response = self
            .client
            .get(
                &self.dns_url,
                FetchOpts {
                    path_args: Some(vec![
                        ("name".to_owned(), host.to_owned()),
                        ("type".to_owned(), record_type.to_owned()),
                    ]),
                    headers: Some(headers),
                    ..FetchOpts::default()
                },
            )
            .await
            .map_err(|e| {
                debug!("doh {record_type} query for {host} failed: {e}");
                unresolvable()
            })?;

        let reply: DnsJsonReply = response.json().map_err(|_| unresolvable())?;

        if reply.answer.is_empty() {
            return Err(unresolvable());
        }

        let mut records = Vec::with_capacity(reply.answer.len());
        let mut ttl = u64::MAX;

        for answer in &reply.answer {
            let ip: IpAddr = answer.data.parse().map_err(|_| unresolvable())?;
            records.push(Record::from_ip(ip, port));
            ttl = ttl.min(answer.ttl);
        }

        Ok((records, ttl))
    }
}

#[async_trait]
impl Resolver for HttpsResolver {
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

        let (a, aaaa) = futures::join!(
            self.query(host, port, "A"),
            self.query(host, port, "AAAA"),
        );

        let mut records = Vec::new();
        let mut remote_ttl: Option<u64> = None;

        for outcome in [a, aaaa] {
            if let Ok((found, ttl)) = outcome {
                records.extend(found);
                remote_ttl = Some(remote_ttl.map_or(ttl, |t| t.min(ttl)));
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::client_impl::HttpClient;
    use crate::resolve::system::SystemResolver;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A plain-HTTP DoH endpoint good enough for the resolver under
    /// test. The two record-type queries may arrive on one reused
    /// connection or on two concurrent ones; replies are handed out in
    /// queue order either way.
    async fn spawn_doh_server(replies: Vec<&'static str>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let replies = Arc::new(std::sync::Mutex::new(
            replies
                .into_iter()
                .map(str::to_owned)
                .collect::<std::collections::VecDeque<String>>(),
        ));

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };

                let replies = Arc::clone(&replies);

                tokio::spawn(async move {
                    loop {
                        let mut buf = [0u8; 4096];
                        let Ok(n) = socket.read(&mut buf).await else {
                            return;
                        };

                        if n == 0 {
                            return;
                        }

                        let Some(body) = replies.lock().unwrap().pop_front() else {
                            return;
                        };

                        let response = format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/dns-json\r\ncontent-length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        );

                        if socket.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        addr
    }

    fn resolver_against(addr: std::net::SocketAddr) -> HttpsResolver {
        HttpsResolver {
            cache: ResolverCache::new(60, true),
            hosts: None,
            dns_url: format!("http://127.0.0.1:{}/dns-query", addr.port()),
            client: HttpClient::builder()
                .resolver(Arc::new(SystemResolver::new()))
                .build(),
        }
    }

    #[tokio::test]
    async fn parses_answers_and_floors_ttl() {
        let addr = spawn_doh_server(vec![
            r#"{"Status":0,"Answer":[{"name":"x.example","type":1,"TTL":3600,"data":"93.184.216.34"}]}"#,
            r#"{"Status":0,"Answer":[{"name":"x.example","type":28,"TTL":30,"data":"2606:2800:220:1:248:1893:25c8:1946"}]}"#,
        ])
        .await;

        let resolver = resolver_against(addr);
        let result = resolver.lookup("x.example", 443).await.unwrap();

        assert_eq!(result.records().len(), 2);
        assert!(result
            .records()
            .contains(&Record::V4(Ipv4Addr::new(93, 184, 216, 34), 443)));
        // The smaller answer TTL is below the floor, so min_ttl wins.
        assert_eq!(result.ttl(), 60);
    }

    #[tokio::test]
    async fn empty_answers_are_unresolvable() {
        let addr = spawn_doh_server(vec![
            r#"{"Status":3,"Answer":[]}"#,
            r#"{"Status":3,"Answer":[]}"#,
        ])
        .await;

        let resolver = resolver_against(addr);
        let err = resolver.lookup("missing.example", 443).await.unwrap_err();

        assert!(matches!(err, Error::UnresolvableHost(_)));
    }

    #[tokio::test]
    async fn malformed_answers_are_unresolvable() {
        let addr = spawn_doh_server(vec![
            r#"{"Status":0,"Answer":[{"name":"x","type":1,"TTL":60,"data":"not-an-ip"}]}"#,
            r#"{"Status":0,"Answer":[{"name":"x","type":28,"TTL":60,"data":"also-not-an-ip"}]}"#,
        ])
        .await;

        let resolver = resolver_against(addr);
        let err = resolver.lookup("x.example", 443).await.unwrap_err();

        assert!(matches!(err, Error::UnresolvableHost(_)));
    }

    #[tokio::test]
    async fn one_successful_record_type_is_enough() {
        let addr = spawn_doh_server(vec![
            r#"{"Status":0,"Answer":[{"name":"x.example","type":1,"TTL":120,"data":"192.0.2.10"}]}"#,
            r#"{"Status":3,"Answer":[]}"#,
        ])
        .await;

        let resolver = resolver_against(addr);
        let result = resolver.lookup("x.example", 80).await.unwrap();

        assert_eq!(
            result.records(),
            &[Record::V4(Ipv4Addr::new(192, 0, 2, 10), 80)]
        );
        assert_eq!(result.ttl(), 120);
    }
}
