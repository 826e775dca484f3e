//! Client configuration limits and timeouts
//!
//! Defaults are intentionally conservative: bounded response buffering,
//! bounded header sections and a finite redirect budget protect the
//! process from misbehaving or hostile servers.
//!
//! # Examples
//!
//! ```no_run
//! use hiyori::{HttpClient, limits::ClientLimits};
//! use std::time::Duration;
//!
//! let client = HttpClient::builder()
//!     .limits(ClientLimits {
//!         timeout: Duration::from_secs(5),
//!         max_body_size: 16 * 1024 * 1024,
//!         ..ClientLimits::default()
//!     })
//!     .build();
//! ```

use std::time::Duration;

/// Controls per-request bounds, connection reuse and redirect behavior.
///
/// Every request inherits these values unless the per-call options
/// override them.
#[derive(Debug, Clone)]
pub struct ClientLimits {
    /// Seconds a pooled connection may sit idle before it closes itself
    /// (default: `10s`).
    pub idle_timeout: Duration,

    /// Whole-request deadline covering connect, request write and
    /// response read (default: `60s`).
    pub timeout: Duration,

    /// Upper bound on the response status line plus headers in bytes
    /// (default: `64 KiB`).
    pub max_initial_size: usize,

    /// Upper bound on the buffered response body in bytes
    /// (default: `2 MiB`).
    pub max_body_size: usize,

    /// Bytes requested per `read()` call while streaming a request body
    /// (default: `128 KiB`).
    pub chunk_size: usize,

    /// When `false`, every connection is closed after one exchange and
    /// the pool stays empty (default: `true`).
    pub allow_keep_alive: bool,

    /// Maximum number of idle connections retained in the pool
    /// (default: `100`).
    pub max_idle_connections: usize,

    /// Maximum number of redirect hops the redirect driver will follow
    /// (default: `10`).
    pub max_redirects: usize,

    /// When `true`, responses with status >= 400 are returned as
    /// [`Error::HttpError`](crate::Error::HttpError) (default: `true`).
    pub raise_error: bool,
}

impl Default for ClientLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            max_initial_size: 64 * 1024,
            max_body_size: 2 * 1024 * 1024,
            chunk_size: 128 * 1024,
            allow_keep_alive: true,
            max_idle_connections: 100,
            max_redirects: 10,
            raise_error: true,
        }
    }
}
