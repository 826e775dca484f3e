//! Request and response message types.

use crate::bodies::{EmptyBody, RequestBody};
use crate::client::conn::ConnectionId;
use crate::errors::{Error, Result};
use crate::http::types::{HeaderMap, Method, Scheme, StatusCode, Version};
use crate::http::wire::{ClientStream, RequestHead, ResponseHead, WireError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;

/// Default `user-agent`: client identifier plus codec identifier.
pub(crate) const SELF_IDENTIFIER: &str = concat!(
    "hiyori/",
    env!("CARGO_PKG_VERSION"),
    " wire/",
    env!("CARGO_PKG_VERSION"),
);

/// A request that has not been put on the wire yet.
///
/// The path never carries a query string; query parameters travel in
/// `path_args` and are URL-encoded when the request URI is assembled.
pub struct PendingRequest {
    method: Method,
    version: Version,
    authority: String,
    scheme: Scheme,
    path: String,
    path_args: Vec<(String, String)>,
    headers: HeaderMap,
    body: Box<dyn RequestBody>,
}

impl PendingRequest {
    pub fn new(method: Method, authority: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.set_default("user-agent", SELF_IDENTIFIER);

        Self {
            method,
            version: Version::Http11,
            authority: authority.into(),
            scheme: Scheme::Http,
            path: "/".to_owned(),
            path_args: Vec::new(),
            headers,
            body: Box::new(EmptyBody),
        }
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Sets the request path. Pass query parameters through
    /// [`path_args`](Self::path_args) instead of embedding them here.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        debug_assert!(
            !path.contains('?'),
            "pass query parameters via path_args"
        );
        self.path = path;
        self
    }

    pub fn path_args(mut self, path_args: Vec<(String, String)>) -> Self {
        self.path_args = path_args;
        self
    }

    /// Replaces the header map wholesale and re-applies the default
    /// `user-agent` when the new map does not carry one.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self.headers.set_default("user-agent", SELF_IDENTIFIER);
        self
    }

    pub fn body(mut self, body: Box<dyn RequestBody>) -> Self {
        self.body = body;
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn scheme_ref(&self) -> Scheme {
        self.scheme
    }

    pub fn path_ref(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub(crate) fn body_mut(&mut self) -> &mut dyn RequestBody {
        &mut *self.body
    }

    /// Hands the body over, leaving an empty one behind. Used when a
    /// 307/308 redirect replays the payload on a new request.
    pub(crate) fn take_body(&mut self) -> Box<dyn RequestBody> {
        std::mem::replace(&mut self.body, Box::new(EmptyBody))
    }

    /// Request target: path plus URL-encoded `path_args`.
    pub fn uri(&self) -> String {
        if self.path_args.is_empty() {
            return self.path.clone();
        }

        let query =
            serde_urlencoded::to_string(&self.path_args).unwrap_or_default();

        format!("{}?{}", self.path, query)
    }

    /// The pool identity this request may reuse a connection under.
    pub fn conn_id(&self) -> ConnectionId {
        ConnectionId {
            authority: self.authority.clone(),
            scheme: self.scheme,
            version: self.version,
        }
    }

    pub(crate) fn wire_head(&self) -> RequestHead {
        RequestHead {
            method: self.method,
            version: self.version,
            uri: self.uri(),
            authority: self.authority.clone(),
            headers: self.headers.clone(),
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("method", &self.method)
            .field("version", &self.version)
            .field("uri", &self.uri())
            .field("authority", &self.authority)
            .field("scheme", &self.scheme)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A request exactly as it was written to the wire, including the
/// defaults the codec filled in.
#[derive(Debug, Clone)]
pub struct Request {
    head: RequestHead,
    scheme: Scheme,
}

impl Request {
    pub(crate) fn new(head: RequestHead, scheme: Scheme) -> Self {
        Self { head, scheme }
    }

    pub fn method(&self) -> Method {
        self.head.method
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn uri(&self) -> &str {
        &self.head.uri
    }

    pub fn authority(&self) -> &str {
        &self.head.authority
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }
}

/// Streams the rest of a response body when the client was asked not to
/// buffer it. The connection backing this reader is never returned to
/// the pool.
pub struct ResponseReader {
    stream: ClientStream,
}

impl ResponseReader {
    pub(crate) fn new(stream: ClientStream) -> Self {
        Self { stream }
    }

    /// Up to `n` body bytes, or `None` once the body is fully read.
    pub async fn read(&mut self, n: usize) -> Result<Option<Bytes>> {
        match self.stream.read_body(n).await {
            Ok(chunk) => Ok(Some(chunk)),
            Err(WireError::ReadFinished) => Ok(None),
            Err(e) => Err(e.into_public()),
        }
    }

    /// Discards the remainder of the body.
    pub fn abort(&mut self) {
        self.stream.abort_read();
    }
}

impl fmt::Debug for ResponseReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseReader").finish_non_exhaustive()
    }
}

/// A parsed response.
///
/// When the request asked for the body to be buffered, `body()` holds
/// the complete payload. Otherwise the body is empty and
/// [`reader`](Response::reader) streams the remainder.
pub struct Response {
    request: Request,
    head: ResponseHead,
    body: Bytes,
    reader: Option<ResponseReader>,
}

impl Response {
    pub(crate) fn new(
        request: Request,
        head: ResponseHead,
        body: Bytes,
        reader: Option<ResponseReader>,
    ) -> Self {
        Self {
            request,
            head,
            body,
            reader,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn status_code(&self) -> StatusCode {
        self.head.status
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// The buffered body; empty when the request opted out of buffering.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The streaming reader, present only when the request opted out of
    /// body buffering.
    pub fn reader(&mut self) -> Option<&mut ResponseReader> {
        self.reader.as_mut()
    }

    /// The buffered body decoded as UTF-8.
    pub fn text(&self) -> Result<&str> {
        simdutf8::basic::from_utf8(&self.body)
            .map_err(|_| Error::BadResponse("response body is not valid utf-8".to_owned()))
    }

    /// The buffered body decoded as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::BadResponse(format!("response body is not valid json: {e}")))
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("request", &self.request)
            .field("status_code", &self.head.status)
            .field("version", &self.head.version)
            .field("headers", &self.head.headers)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}
