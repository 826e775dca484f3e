use crate::http::messages::{Request, Response};
use crate::http::types::StatusCode;
use std::io;

/// Errors surfaced by the client.
///
/// Every failure mode of a request maps to exactly one variant; the
/// connection that produced a protocol-level failure is closed and
/// discarded before the error is returned.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The whole-request deadline expired before the response finished.
    #[error("request timed out")]
    RequestTimeout,

    /// The peer sent something the protocol layer could not accept, or a
    /// redirect response without a `location` header.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The response initial or body exceeded the configured bound.
    #[error("response entity too large")]
    ResponseEntityTooLarge,

    /// The peer or the protocol layer aborted the exchange.
    #[error("connection closed")]
    ConnectionClosed,

    /// A redirect could not be followed.
    #[error("failed redirection: {0}")]
    FailedRedirection(String),

    /// The redirect count exceeded `max_redirects`. Carries the last
    /// request issued before giving up.
    #[error("too many redirects (last request: {} {})", .0.method(), .0.uri())]
    TooManyRedirects(Box<Request>),

    /// A response with status >= 400 while `raise_error` is enabled.
    #[error("HTTP {} {}", .0.status_code().as_u16(), .0.status_code().phrase())]
    HttpError(Box<Response>),

    /// The resolver produced no usable record, or every connect attempt
    /// failed.
    #[error("unresolvable host: {0}")]
    UnresolvableHost(String),

    /// The request arguments are contradictory or unsupported.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A new request was started while `close()` is in progress.
    #[error("client is closing")]
    ClientClosing,

    /// Local I/O failure, e.g. while reading a file-backed body part.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for both [`Error::FailedRedirection`] and its refinement
    /// [`Error::TooManyRedirects`].
    pub fn is_failed_redirection(&self) -> bool {
        matches!(
            self,
            Error::FailedRedirection(_) | Error::TooManyRedirects(_)
        )
    }

    /// The response carried by [`Error::HttpError`], if any.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::HttpError(resp) => Some(resp),
            _ => None,
        }
    }

    /// The status code carried by [`Error::HttpError`], if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        self.response().map(|r| r.status_code())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
