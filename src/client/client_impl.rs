//! The HTTP client: request pipeline, redirect driver and lifecycle.

use crate::bodies::{BodyError, BytesBody, EmptyBody, RequestBody};
use crate::client::conn::Connection;
use crate::client::pool::ConnectionPool;
use crate::errors::{Error, Result};
use crate::http::messages::{PendingRequest, Response};
use crate::http::types::{HeaderMap, Method, Scheme, StatusCode};
use crate::limits::ClientLimits;
use crate::multipart::{Form, FormValue, MultipartBody};
use crate::resolve::base::Resolver;
use crate::resolve::dns::DnsResolver;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_rustls::TlsConnector;
use url::Url;

/// A request payload argument for [`HttpClient::fetch`].
pub enum Body {
    /// Raw bytes, sent as-is with no content-type derived.
    Bytes(Vec<u8>),
    /// A form map: URL-encoded when every value is text, multipart when
    /// any value is a file.
    Form(Form),
    /// A custom streaming producer.
    Stream(Box<dyn RequestBody>),
}

impl From<Vec<u8>> for Body {
    fn from(buf: Vec<u8>) -> Self {
        Body::Bytes(buf)
    }
}

impl From<&[u8]> for Body {
    fn from(buf: &[u8]) -> Self {
        Body::Bytes(buf.to_vec())
    }
}

impl From<Form> for Body {
    fn from(form: Form) -> Self {
        Body::Form(form)
    }
}

/// Per-call options for [`HttpClient::fetch`] and the verb helpers.
/// `None` fields fall back to the client's [`ClientLimits`].
pub struct FetchOpts {
    /// Extra query parameters appended after the URL's own.
    pub path_args: Option<Vec<(String, String)>>,
    /// Request headers.
    pub headers: Option<HeaderMap>,
    /// Request payload; mutually exclusive with `json`.
    pub body: Option<Body>,
    /// JSON payload; mutually exclusive with `body`.
    pub json: Option<serde_json::Value>,
    /// Buffer the response body into [`Response::body`] (default `true`).
    /// When `false` the connection is not reused and the body streams
    /// through [`Response::reader`].
    pub read_response_body: bool,
    /// Whole-request deadline override.
    pub timeout: Option<Duration>,
    /// Follow 3xx redirects (default `false`).
    pub follow_redirection: bool,
    /// Redirect budget override.
    pub max_redirects: Option<usize>,
    /// Response-body bound override.
    pub max_body_size: Option<usize>,
    /// Whether >= 400 responses become [`Error::HttpError`].
    pub raise_error: Option<bool>,
}

impl Default for FetchOpts {
    fn default() -> Self {
        Self {
            path_args: None,
            headers: None,
            body: None,
            json: None,
            read_response_body: true,
            timeout: None,
            follow_redirection: false,
            max_redirects: None,
            max_body_size: None,
            raise_error: None,
        }
    }
}

/// The per-call knobs that survive past body derivation.
struct SendOpts {
    read_response_body: bool,
    timeout: Option<Duration>,
    max_redirects: Option<usize>,
    max_body_size: Option<usize>,
    raise_error: Option<bool>,
}

impl SendOpts {
    fn from_fetch(opts: &FetchOpts) -> Self {
        Self {
            read_response_body: opts.read_response_body,
            timeout: opts.timeout,
            max_redirects: opts.max_redirects,
            max_body_size: opts.max_body_size,
            raise_error: opts.raise_error,
        }
    }
}

fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();

    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            anchor.subject,
            anchor.spki,
            anchor.name_constraints,
        )
    }));

    Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Builds an [`HttpClient`].
#[derive(Default)]
pub struct HttpClientBuilder {
    limits: Option<ClientLimits>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    resolver: Option<Arc<dyn Resolver>>,
}

impl HttpClientBuilder {
    pub fn limits(mut self, limits: ClientLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// TLS material for HTTPS connections. Defaults to a configuration
    /// trusting the bundled webpki root set.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Custom resolver. Defaults to [`DnsResolver`].
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> HttpClient {
        let limits = self.limits.unwrap_or_default();
        let tls_config = self.tls_config.unwrap_or_else(default_tls_config);
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(DnsResolver::new()));

        HttpClient {
            pool: ConnectionPool::new(limits.max_idle_connections, limits.allow_keep_alive),
            limits,
            tls: TlsConnector::from(tls_config),
            resolver,
            closing: AtomicBool::new(false),
            inflight: RwLock::new(()),
        }
    }
}

/// An asynchronous HTTP/1.1 client holding persistent connections.
///
/// Connections are pooled per `(authority, scheme, version)` identity
/// and reused while the peer allows it. Any number of requests may run
/// concurrently through a shared client; [`close`](HttpClient::close)
/// waits for them to drain.
pub struct HttpClient {
    limits: ClientLimits,
    tls: TlsConnector,
    resolver: Arc<dyn Resolver>,
    pool: ConnectionPool,

    closing: AtomicBool,
    inflight: RwLock<()>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    /// Performs a request against `url`.
    ///
    /// The URL's query string and `opts.path_args` are merged (URL query
    /// first). The body derives from `opts`: a text-only form becomes
    /// URL-encoded, a form with files becomes multipart, `json` becomes
    /// a JSON payload, raw bytes pass through untouched.
    pub async fn fetch(&self, method: Method, url: &str, opts: FetchOpts) -> Result<Response> {
        let _guard = self.begin().await?;
        self.fetch_inner(method, url, opts).await
    }

    /// Sends a prepared [`PendingRequest`]. The payload travels inside
    /// the request; `opts.body` and `opts.json` must be empty.
    pub async fn send_request(
        &self,
        mut request: PendingRequest,
        opts: FetchOpts,
    ) -> Result<Response> {
        let _guard = self.begin().await?;

        if opts.body.is_some() || opts.json.is_some() {
            return Err(Error::InvalidRequest(
                "send_request takes the payload from the request itself".to_owned(),
            ));
        }

        let send = SendOpts::from_fetch(&opts);

        if opts.follow_redirection {
            self.handle_redirection(request, send).await
        } else {
            self.send_once(&mut request, &send).await
        }
    }

    /// Closes the client: new requests are rejected, in-flight requests
    /// drain, then every pooled connection is torn down.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let _write = self.inflight.write().await;
        self.pool.close_all().await;
    }

    pub async fn head(&self, url: &str, opts: FetchOpts) -> Result<Response> {
        self.fetch(Method::Head, url, opts).await
    }

    pub async fn get(&self, url: &str, opts: FetchOpts) -> Result<Response> {
        self.fetch(Method::Get, url, opts).await
    }

    pub async fn post(&self, url: &str, opts: FetchOpts) -> Result<Response> {
        self.fetch(Method::Post, url, opts).await
    }

    pub async fn put(&self, url: &str, opts: FetchOpts) -> Result<Response> {
        self.fetch(Method::Put, url, opts).await
    }

    pub async fn delete(&self, url: &str, opts: FetchOpts) -> Result<Response> {
        self.fetch(Method::Delete, url, opts).await
    }

    pub async fn patch(&self, url: &str, opts: FetchOpts) -> Result<Response> {
        self.fetch(Method::Patch, url, opts).await
    }

    pub async fn options(&self, url: &str, opts: FetchOpts) -> Result<Response> {
        self.fetch(Method::Options, url, opts).await
    }

    /// Rejects new work while `close()` is in progress, and counts the
    /// caller as in-flight otherwise. The guard is taken once per public
    /// entry point; internal hops run under the caller's guard.
    async fn begin(&self) -> Result<RwLockReadGuard<'_, ()>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::ClientClosing);
        }

        Ok(self.inflight.read().await)
    }

    async fn fetch_inner(&self, method: Method, url: &str, opts: FetchOpts) -> Result<Response> {
        if opts.body.is_some() && opts.json.is_some() {
            return Err(Error::InvalidRequest(
                "cannot supply both body and json".to_owned(),
            ));
        }

        if method == Method::Head && (opts.body.is_some() || opts.json.is_some()) {
            return Err(Error::InvalidRequest(
                "HEAD requests cannot carry a body".to_owned(),
            ));
        }

        let send = SendOpts::from_fetch(&opts);

        let (body, content_type) = derive_body(opts.body, opts.json)?;

        let mut request = self.build_request(
            method,
            url,
            opts.path_args.unwrap_or_default(),
            opts.headers,
            body,
        )?;

        if let Some(content_type) = content_type {
            request.headers_mut().insert("content-type", content_type);
        }

        if opts.follow_redirection {
            self.handle_redirection(request, send).await
        } else {
            self.send_once(&mut request, &send).await
        }
    }

    fn build_request(
        &self,
        method: Method,
        url: &str,
        extra_args: Vec<(String, String)>,
        headers: Option<HeaderMap>,
        body: Box<dyn RequestBody>,
    ) -> Result<PendingRequest> {
        let (scheme, authority, path, mut path_args) = split_url(url)?;
        path_args.extend(extra_args);

        Ok(PendingRequest::new(method, authority)
            .scheme(scheme)
            .path(path)
            .path_args(path_args)
            .with_headers(headers.unwrap_or_default())
            .body(body))
    }

    /// One pool-checkout/exchange/check-in round under the whole-request
    /// deadline.
    async fn send_once(&self, request: &mut PendingRequest, opts: &SendOpts) -> Result<Response> {
        let timeout = opts.timeout.unwrap_or(self.limits.timeout);
        let max_body_size = opts.max_body_size.unwrap_or(self.limits.max_body_size);
        let raise_error = opts.raise_error.unwrap_or(self.limits.raise_error);

        let id = request.conn_id();

        let mut conn = match self.pool.get(&id).await {
            Some(conn) => conn,
            None => {
                let tls = (id.scheme == Scheme::Https).then(|| self.tls.clone());
                Connection::new(id, Arc::clone(&self.resolver), tls, &self.limits)
            }
        };

        let outcome = tokio::time::timeout(
            timeout,
            conn.send_request(request, opts.read_response_body, max_body_size),
        )
        .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                conn.close();
                conn.wait_closed().await;

                return Err(err);
            }
            Err(_) => {
                conn.close();
                conn.wait_closed().await;

                return Err(Error::RequestTimeout);
            }
        };

        if opts.read_response_body {
            self.pool.put(conn).await;
        }

        if raise_error && response.status_code() >= 400 {
            return Err(Error::HttpError(Box::new(response)));
        }

        Ok(response)
    }

    /// Follows redirects up to the budget. 301/302/303 rewrite to a bare
    /// GET; 307/308 replay method, headers and a rewound body. Every hop
    /// runs the full pipeline, so it hits the pool like any request.
    async fn handle_redirection(
        &self,
        mut request: PendingRequest,
        opts: SendOpts,
    ) -> Result<Response> {
        let max_redirects = opts.max_redirects.unwrap_or(self.limits.max_redirects);

        let mut response = self.send_once(&mut request, &opts).await?;
        let mut hops = 0;

        loop {
            if !is_redirect(response.status_code()) {
                return Ok(response);
            }

            if hops == max_redirects {
                return Err(Error::TooManyRedirects(Box::new(
                    response.request().clone(),
                )));
            }

            hops += 1;

            let location = response
                .headers()
                .get("location")
                .ok_or_else(|| {
                    Error::BadResponse(
                        "server asked for a redirection without a location".to_owned(),
                    )
                })?
                .to_owned();

            let location = if location.starts_with("http://")
                || location.starts_with("https://")
            {
                location
            } else if location.starts_with('/') {
                format!(
                    "{}://{}{}",
                    request.scheme_ref(),
                    request.authority(),
                    location
                )
            } else {
                return Err(Error::FailedRedirection(
                    "relative-path redirects are not supported".to_owned(),
                ));
            };

            request = if response.status_code() < 304 {
                self.build_request(
                    Method::Get,
                    &location,
                    Vec::new(),
                    None,
                    Box::new(EmptyBody),
                )?
            } else {
                let mut body = request.take_body();

                match body.rewind().await {
                    Ok(()) => {}
                    Err(BodyError::Unsupported) => {
                        return Err(Error::FailedRedirection(
                            "request body cannot be rewound".to_owned(),
                        ))
                    }
                    Err(BodyError::Io(e)) => return Err(Error::Io(e)),
                    Err(e) => return Err(e.into()),
                }

                self.build_request(
                    request.method(),
                    &location,
                    Vec::new(),
                    Some(request.headers().clone()),
                    body,
                )?
            };

            debug!("following redirect to {location}");
            response = self.send_once(&mut request, &opts).await?;
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn derive_body(
    body: Option<Body>,
    json: Option<serde_json::Value>,
) -> Result<(Box<dyn RequestBody>, Option<String>)> {
    match (body, json) {
        (Some(Body::Form(form)), None) => {
            if form
                .iter()
                .all(|(_, value)| matches!(value, FormValue::Text(_)))
            {
                let pairs: Vec<(String, String)> = form
                    .into_iter()
                    .map(|(name, value)| match value {
                        FormValue::Text(text) => (name, text),
                        FormValue::File(_) => unreachable!(),
                    })
                    .collect();

                Ok((
                    Box::new(BytesBody::url_encoded(&pairs)?),
                    Some("application/x-www-form-urlencoded".to_owned()),
                ))
            } else {
                let multipart = MultipartBody::new(form);
                let content_type = multipart.content_type();

                Ok((Box::new(multipart), Some(content_type)))
            }
        }
        (Some(Body::Bytes(buf)), None) => Ok((Box::new(BytesBody::new(buf)), None)),
        (Some(Body::Stream(body)), None) => Ok((body, None)),
        (None, Some(value)) => Ok((
            Box::new(BytesBody::json(&value)?),
            Some("application/json".to_owned()),
        )),
        (None, None) => Ok((Box::new(EmptyBody), None)),
        (Some(_), Some(_)) => Err(Error::InvalidRequest(
            "cannot supply both body and json".to_owned(),
        )),
    }
}

/// Splits a URL into scheme, authority, path and decoded query pairs.
/// Scheme-less URLs default to `http`.
fn split_url(url: &str) -> Result<(Scheme, String, String, Vec<(String, String)>)> {
    let normalized;
    let text = if url.contains("://") {
        url
    } else {
        normalized = format!("http://{url}");
        &normalized
    };

    let parsed =
        Url::parse(text).map_err(|e| Error::InvalidRequest(format!("invalid url {url}: {e}")))?;

    let scheme = Scheme::from_str_lower(parsed.scheme())
        .ok_or_else(|| Error::InvalidRequest(format!("unsupported scheme: {}", parsed.scheme())))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::InvalidRequest(format!("url has no host: {url}")))?;

    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };

    let path = if parsed.path().is_empty() {
        "/".to_owned()
    } else {
        parsed.path().to_owned()
    };

    let path_args = parsed
        .query_pairs()
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    Ok((scheme, authority, path, path_args))
}

/// One-shot request through a throwaway client.
pub async fn fetch(method: Method, url: &str, opts: FetchOpts) -> Result<Response> {
    let client = HttpClient::new();
    let response = client.fetch(method, url, opts).await;
    client.close().await;

    response
}

/// One-shot GET through a throwaway client.
pub async fn get(url: &str, opts: FetchOpts) -> Result<Response> {
    fetch(Method::Get, url, opts).await
}

/// One-shot HEAD through a throwaway client.
pub async fn head(url: &str, opts: FetchOpts) -> Result<Response> {
    fetch(Method::Head, url, opts).await
}

/// One-shot POST through a throwaway client.
pub async fn post(url: &str, opts: FetchOpts) -> Result<Response> {
    fetch(Method::Post, url, opts).await
}

/// One-shot PUT through a throwaway client.
pub async fn put(url: &str, opts: FetchOpts) -> Result<Response> {
    fetch(Method::Put, url, opts).await
}

/// One-shot DELETE through a throwaway client.
pub async fn delete(url: &str, opts: FetchOpts) -> Result<Response> {
    fetch(Method::Delete, url, opts).await
}

/// One-shot PATCH through a throwaway client.
pub async fn patch(url: &str, opts: FetchOpts) -> Result<Response> {
    fetch(Method::Patch, url, opts).await
}

/// One-shot OPTIONS through a throwaway client.
pub async fn options(url: &str, opts: FetchOpts) -> Result<Response> {
    fetch(Method::Options, url, opts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::File;
    use crate::resolve::base::Record;
    use crate::resolve::system::SystemResolver;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct MockServer {
        addr: SocketAddr,
        requests: mpsc::UnboundedReceiver<Vec<u8>>,
        accepted: Arc<AtomicUsize>,
    }

    impl MockServer {
        fn url(&self, path: &str) -> String {
            format!("http://127.0.0.1:{}{path}", self.addr.port())
        }

        async fn request_text(&mut self) -> String {
            let raw = self.requests.recv().await.expect("no captured request");
            String::from_utf8(raw).expect("request was not utf-8")
        }
    }

    /// Serves the canned responses in order, across any number of
    /// connections, and captures every parsed request.
    async fn spawn_server(responses: Vec<Vec<u8>>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (captured_tx, captured_rx) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_clone = Arc::clone(&accepted);

        let responses = Arc::new(StdMutex::new(VecDeque::from(responses)));

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };

                accepted_clone.fetch_add(1, Ordering::SeqCst);
                let responses = Arc::clone(&responses);
                let captured_tx = captured_tx.clone();

                tokio::spawn(async move {
                    let mut pending = Vec::new();

                    loop {
                        let Some(request) = read_request(&mut socket, &mut pending).await
                        else {
                            return;
                        };

                        let Some(response) = responses.lock().unwrap().pop_front() else {
                            return;
                        };

                        if captured_tx.send(request).is_err() {
                            return;
                        }

                        if socket.write_all(&response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        MockServer {
            addr,
            requests: captured_rx,
            accepted,
        }
    }

    /// Reads one request (head plus content-length body) off the socket.
    async fn read_request(
        socket: &mut tokio::net::TcpStream,
        pending: &mut Vec<u8>,
    ) -> Option<Vec<u8>> {
        let head_end = loop {
            if let Some(pos) = memchr::memmem::find(pending, b"\r\n\r\n") {
                break pos + 4;
            }

            let mut buf = [0u8; 4096];
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        };

        let head_text = String::from_utf8_lossy(&pending[..head_end]).into_owned();
        let body_len = head_text
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);

        while pending.len() < head_end + body_len {
            let mut buf = [0u8; 4096];
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        }

        let request = pending[..head_end + body_len].to_vec();
        pending.drain(..head_end + body_len);

        Some(request)
    }

    fn test_client() -> HttpClient {
        HttpClient::builder()
            .resolver(Arc::new(SystemResolver::new()))
            .build()
    }

    fn response_200() -> Vec<u8> {
        b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nHello, World!".to_vec()
    }

    fn response_302(location: &str) -> Vec<u8> {
        format!("HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n")
            .into_bytes()
    }

    #[tokio::test]
    async fn simple_get() {
        let mut server = spawn_server(vec![response_200()]).await;
        let client = test_client();

        let response = client
            .get(&server.url("/"), FetchOpts::default())
            .await
            .unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text().unwrap(), "Hello, World!");

        let request = server.request_text().await;
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains(&format!(
            "user-agent: hiyori/{v} wire/{v}\r\n",
            v = env!("CARGO_PKG_VERSION")
        )));
        assert!(request.contains("accept: */*\r\n"));
        assert!(request.contains(&format!(
            "host: 127.0.0.1:{}\r\n",
            server.addr.port()
        )));

        client.close().await;
    }

    #[tokio::test]
    async fn query_parameters_are_merged() {
        let mut server = spawn_server(vec![response_200()]).await;
        let client = test_client();

        client
            .get(
                &server.url("/p?x=1"),
                FetchOpts {
                    path_args: Some(vec![("y".to_owned(), "2".to_owned())]),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap();

        let request = server.request_text().await;
        assert!(request.starts_with("GET /p?x=1&y=2 HTTP/1.1\r\n"));

        client.close().await;
    }

    #[tokio::test]
    async fn redirect_chain_within_budget_succeeds() {
        let mut responses: Vec<Vec<u8>> =
            (0..10).map(|_| response_302("/")).collect();
        responses.push(response_200());

        let server = spawn_server(responses).await;
        let client = test_client();

        let response = client
            .get(
                &server.url("/"),
                FetchOpts {
                    follow_redirection: true,
                    max_redirects: Some(10),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text().unwrap(), "Hello, World!");

        client.close().await;
    }

    #[tokio::test]
    async fn redirect_chain_over_budget_fails() {
        let mut responses: Vec<Vec<u8>> =
            (0..10).map(|_| response_302("/")).collect();
        responses.push(response_200());

        let server = spawn_server(responses).await;
        let client = test_client();

        let err = client
            .get(
                &server.url("/"),
                FetchOpts {
                    follow_redirection: true,
                    max_redirects: Some(9),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TooManyRedirects(_)));
        assert!(err.is_failed_redirection());

        client.close().await;
    }

    #[tokio::test]
    async fn redirect_without_location_is_a_bad_response() {
        let server = spawn_server(vec![
            b"HTTP/1.1 302 Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
        ])
        .await;
        let client = test_client();

        let err = client
            .get(
                &server.url("/"),
                FetchOpts {
                    follow_redirection: true,
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BadResponse(_)));

        client.close().await;
    }

    #[tokio::test]
    async fn relative_path_redirect_is_rejected() {
        let server = spawn_server(vec![response_302("relative/path")]).await;
        let client = test_client();

        let err = client
            .get(
                &server.url("/"),
                FetchOpts {
                    follow_redirection: true,
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::FailedRedirection(_)));

        client.close().await;
    }

    #[tokio::test]
    async fn temporary_redirect_replays_the_body() {
        let server_responses = vec![
            b"HTTP/1.1 307 Temporary Redirect\r\nLocation: /other\r\nContent-Length: 0\r\n\r\n"
                .to_vec(),
            response_200(),
        ];
        let mut server = spawn_server(server_responses).await;
        let client = test_client();

        let response = client
            .post(
                &server.url("/"),
                FetchOpts {
                    body: Some(Body::Bytes(b"1234567890".to_vec())),
                    follow_redirection: true,
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(response.status_code(), 200);

        let first = server.request_text().await;
        assert!(first.starts_with("POST / HTTP/1.1\r\n"));
        assert!(first.ends_with("\r\n\r\n1234567890"));

        let second = server.request_text().await;
        assert!(second.starts_with("POST /other HTTP/1.1\r\n"));
        assert!(second.contains("content-length: 10\r\n"));
        assert!(second.ends_with("\r\n\r\n1234567890"));

        client.close().await;
    }

    #[tokio::test]
    async fn see_other_rewrites_to_a_bare_get() {
        let server_responses = vec![
            b"HTTP/1.1 303 See Other\r\nLocation: /result\r\nContent-Length: 0\r\n\r\n"
                .to_vec(),
            response_200(),
        ];
        let mut server = spawn_server(server_responses).await;
        let client = test_client();

        client
            .post(
                &server.url("/submit"),
                FetchOpts {
                    body: Some(Body::Bytes(b"payload".to_vec())),
                    follow_redirection: true,
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap();

        let _first = server.request_text().await;
        let second = server.request_text().await;
        assert!(second.starts_with("GET /result HTTP/1.1\r\n"));
        assert!(!second.contains("content-length"));
        assert!(second.ends_with("\r\n\r\n"));

        client.close().await;
    }

    #[tokio::test]
    async fn url_encoded_form_body() {
        let mut server = spawn_server(vec![response_200()]).await;
        let client = test_client();

        client
            .post(
                &server.url("/"),
                FetchOpts {
                    body: Some(Body::Form(vec![
                        ("a".to_owned(), FormValue::Text("b".to_owned())),
                        ("c".to_owned(), FormValue::Text("d".to_owned())),
                    ])),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap();

        let request = server.request_text().await;
        assert!(request.contains("content-type: application/x-www-form-urlencoded\r\n"));
        assert!(request.contains("content-length: 7\r\n"));
        assert!(request.ends_with("\r\n\r\na=b&c=d"));

        client.close().await;
    }

    #[tokio::test]
    async fn multipart_form_body() {
        let mut server = spawn_server(vec![response_200()]).await;
        let client = test_client();

        client
            .post(
                &server.url("/"),
                FetchOpts {
                    body: Some(Body::Form(vec![
                        ("a".to_owned(), FormValue::Text("b".to_owned())),
                        (
                            "c".to_owned(),
                            FormValue::File(
                                File::from_bytes(&b"1234567890"[..])
                                    .filename("abc.example")
                                    .content_type("x-application/example"),
                            ),
                        ),
                    ])),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap();

        let request = server.request_text().await;

        let content_type_line = request
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with("content-type:"))
            .expect("multipart request without content-type");
        let boundary = content_type_line
            .split_once("boundary=")
            .expect("content-type without boundary")
            .1
            .trim();
        assert!(boundary.starts_with("--------HiyoriFormBoundary"));

        let body = request.split_once("\r\n\r\n").unwrap().1;
        let expected = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"a\"\r\n\
             \r\n\
             b\r\n\
             --{boundary}\r\n\
             Content-Type: x-application/example\r\n\
             Content-Disposition: form-data; name=\"c\"; filename=\"abc.example\"\r\n\
             \r\n\
             1234567890--{boundary}--\r\n"
        );
        assert_eq!(body, expected);

        client.close().await;
    }

    #[tokio::test]
    async fn json_body() {
        let mut server = spawn_server(vec![response_200()]).await;
        let client = test_client();

        client
            .post(
                &server.url("/"),
                FetchOpts {
                    json: Some(serde_json::json!({"a": 1})),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap();

        let request = server.request_text().await;
        assert!(request.contains("content-type: application/json\r\n"));

        let body = request.split_once("\r\n\r\n").unwrap().1;
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed, serde_json::json!({"a": 1}));

        client.close().await;
    }

    #[tokio::test]
    async fn body_and_json_are_mutually_exclusive() {
        let client = test_client();

        let err = client
            .post(
                "http://127.0.0.1:1/",
                FetchOpts {
                    body: Some(Body::Bytes(Vec::new())),
                    json: Some(serde_json::json!({})),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn head_with_a_body_is_rejected() {
        let client = test_client();

        let err = client
            .fetch(
                Method::Head,
                "http://127.0.0.1:1/",
                FetchOpts {
                    body: Some(Body::Bytes(b"x".to_vec())),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn head_response_carries_headers_but_no_body() {
        let server = spawn_server(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\n".to_vec(),
        ])
        .await;
        let client = test_client();

        let response = client
            .head(&server.url("/"), FetchOpts::default())
            .await
            .unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.headers().get("content-length"), Some("13"));
        assert!(response.body().is_empty());

        client.close().await;
    }

    #[tokio::test]
    async fn oversized_response_fails() {
        let mut payload = b"HTTP/1.1 200 OK\r\nContent-Length: 131072\r\n\r\n".to_vec();
        payload.extend(std::iter::repeat(0xab).take(128 * 1024));

        let server = spawn_server(vec![payload]).await;
        let client = test_client();

        let err = client
            .get(
                &server.url("/"),
                FetchOpts {
                    max_body_size: Some(12),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ResponseEntityTooLarge));

        client.close().await;
    }

    #[tokio::test]
    async fn response_of_exactly_max_body_size_succeeds() {
        let server = spawn_server(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\nexactly12by!".to_vec(),
        ])
        .await;
        let client = test_client();

        let response = client
            .get(
                &server.url("/"),
                FetchOpts {
                    max_body_size: Some(12),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(response.body().len(), 12);

        client.close().await;
    }

    #[tokio::test]
    async fn malformed_version_is_a_bad_response() {
        let server = spawn_server(vec![
            b"HTTP/1.2 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        ])
        .await;
        let client = test_client();

        let err = client
            .get(&server.url("/"), FetchOpts::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BadResponse(_)));

        client.close().await;
    }

    #[tokio::test]
    async fn error_statuses_raise_by_default() {
        let server = spawn_server(vec![
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
        ])
        .await;
        let client = test_client();

        let err = client
            .get(&server.url("/"), FetchOpts::default())
            .await
            .unwrap_err();

        match &err {
            Error::HttpError(response) => {
                assert_eq!(response.status_code(), 404);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.status_code().map(|s| s.as_u16()), Some(404));

        client.close().await;
    }

    #[tokio::test]
    async fn error_statuses_pass_through_when_disabled() {
        let server = spawn_server(vec![
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
        ])
        .await;
        let client = test_client();

        let response = client
            .get(
                &server.url("/"),
                FetchOpts {
                    raise_error: Some(false),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(response.status_code(), 404);

        client.close().await;
    }

    #[tokio::test]
    async fn keep_alive_reuses_the_connection() {
        let server = spawn_server(vec![response_200(), response_200()]).await;
        let client = test_client();

        client.get(&server.url("/"), FetchOpts::default()).await.unwrap();
        client.get(&server.url("/"), FetchOpts::default()).await.unwrap();

        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);

        client.close().await;
    }

    #[tokio::test]
    async fn keep_alive_disabled_dials_per_request() {
        let server = spawn_server(vec![response_200(), response_200()]).await;
        let client = HttpClient::builder()
            .resolver(Arc::new(SystemResolver::new()))
            .limits(ClientLimits {
                allow_keep_alive: false,
                ..ClientLimits::default()
            })
            .build();

        client.get(&server.url("/"), FetchOpts::default()).await.unwrap();
        client.get(&server.url("/"), FetchOpts::default()).await.unwrap();

        assert_eq!(server.accepted.load(Ordering::SeqCst), 2);

        client.close().await;
    }

    #[tokio::test]
    async fn resolver_override_redirects_the_dial() {
        let mut server = spawn_server(vec![response_200()]).await;
        let client = test_client();

        client.resolver().add_override(
            "name.invalid",
            9999,
            Record::V4("127.0.0.1".parse().unwrap(), server.addr.port()),
        );

        let response = client
            .get("http://name.invalid:9999/", FetchOpts::default())
            .await
            .unwrap();

        assert_eq!(response.status_code(), 200);

        let request = server.request_text().await;
        assert!(request.contains("host: name.invalid:9999\r\n"));

        client.close().await;
    }

    #[tokio::test]
    async fn unresolvable_hosts_fail() {
        let client = test_client();

        let err = client
            .get(
                "http://definitely-not-a-real-host.invalid/",
                FetchOpts::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnresolvableHost(_)));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // Accept and go quiet.
            let _socket = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = test_client();

        let err = client
            .get(
                &format!("http://127.0.0.1:{}/", addr.port()),
                FetchOpts {
                    timeout: Some(Duration::from_millis(100)),
                    ..FetchOpts::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RequestTimeout));

        client.close().await;
    }

    #[tokio::test]
    async fn closed_client_rejects_new_requests() {
        let client = test_client();
        client.close().await;

        let err = client
            .get("http://127.0.0.1:1/", FetchOpts::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ClientClosing));
    }

    #[tokio::test]
    async fn one_shot_helper_round_trips() {
        let server = spawn_server(vec![response_200()]).await;

        // The free helpers default to the DNS resolver, which resolves
        // the loopback literal without a query.
        let response = get(&server.url("/"), FetchOpts::default()).await.unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text().unwrap(), "Hello, World!");
    }

    #[test]
    fn url_splitting() {
        let (scheme, authority, path, args) =
            split_url("http://example.com:8080/a/b?x=1&y=2").unwrap();
        assert_eq!(scheme, Scheme::Http);
        assert_eq!(authority, "example.com:8080");
        assert_eq!(path, "/a/b");
        assert_eq!(
            args,
            vec![
                ("x".to_owned(), "1".to_owned()),
                ("y".to_owned(), "2".to_owned())
            ]
        );

        let (scheme, authority, path, _) = split_url("https://example.com").unwrap();
        assert_eq!(scheme, Scheme::Https);
        assert_eq!(authority, "example.com");
        assert_eq!(path, "/");

        let (scheme, authority, _, _) = split_url("example.com/x").unwrap();
        assert_eq!(scheme, Scheme::Http);
        assert_eq!(authority, "example.com");

        assert!(split_url("ftp://example.com/").is_err());
    }
}
