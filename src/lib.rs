//! hiyori - Asynchronous HTTP/1.1 client with pooled connections
//!
//! A tokio-based HTTP/1.1 client that multiplexes requests across a pool
//! of persistent origin connections, resolves destinations through a
//! pluggable DNS strategy with happy-eyeballs connection racing, follows
//! redirects under a well-defined policy, and streams request bodies of
//! arbitrary shape.
//!
//! # Features
//!
//! - **Connection pooling** - idle connections are kept per
//!   `(authority, scheme, version)` identity and reused while the peer
//!   allows it, with idle-timeout auto-close and a bounded pool.
//! - **Pluggable resolution** - hosts-file, OS, async DNS (parallel
//!   A/AAAA) and DNS-over-HTTPS resolvers behind one trait, with a TTL
//!   cache and sticky manual overrides.
//! - **Happy-eyeballs dialing** - every resolved address is raced; the
//!   fastest is remembered for the next connect.
//! - **Streaming bodies** - raw bytes, URL-encoded forms, JSON and
//!   multipart/form-data with files, sent with content-length when the
//!   size is known and chunked transfer encoding when it is not.
//! - **Redirect driver** - 301/302/303 rewrite to a bare GET, 307/308
//!   replay the method, headers and a rewound body, all within a
//!   configurable budget.
//! - **Bounded buffering** - response head and body sizes are capped so
//!   a hostile peer cannot balloon memory.
//!
//! # Quick Start
//!
//! ```no_run
//! use hiyori::{FetchOpts, HttpClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hiyori::Error> {
//!     let client = HttpClient::new();
//!
//!     let response = client
//!         .get("http://example.com/", FetchOpts::default())
//!         .await?;
//!
//!     println!("{}: {}", response.status_code(), response.text()?);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! One-shot helpers build a throwaway client per call:
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), hiyori::Error> {
//! let response = hiyori::get("http://example.com/", Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod http {
    pub(crate) mod messages;
    pub(crate) mod types;
    pub(crate) mod wire;
}
pub(crate) mod client {
    pub(crate) mod client_impl;
    pub(crate) mod conn;
    pub(crate) mod pool;
}
pub mod resolve {
    pub mod base;
    pub mod dns;
    pub mod doh;
    pub mod hosts;
    pub mod system;
}
pub mod bodies;
pub mod multipart;
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    bodies::{BodyError, BytesBody, EmptyBody, RequestBody},
    client::{
        client_impl::{
            delete, fetch, get, head, options, patch, post, put, Body, FetchOpts,
            HttpClient, HttpClientBuilder,
        },
        conn::ConnectionId,
    },
    errors::{Error, Result},
    http::{
        messages::{PendingRequest, Request, Response, ResponseReader},
        types::{HeaderMap, Method, Scheme, StatusCode, Version},
    },
    limits::ClientLimits,
    multipart::{File, Form, FormValue, MultipartBody},
    resolve::{
        base::{Record, ResolvedResult, Resolver, ResolverCache},
        dns::DnsResolver,
        doh::HttpsResolver,
        hosts::HostsResolver,
        system::SystemResolver,
    },
};
