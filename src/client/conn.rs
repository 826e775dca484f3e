//! A single pooled HTTP connection.

use crate::bodies::BodyError;
use crate::errors::{Error, Result};
use crate::http::messages::{PendingRequest, Request, Response, ResponseReader};
use crate::http::types::{Scheme, Version};
use crate::http::wire::{ClientStream, RequestHead, ResponseHead, WireError};
use crate::limits::ClientLimits;
use crate::resolve::base::Resolver;
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// The identity a connection may be reused under: authority, scheme and
/// protocol version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub authority: String,
    pub scheme: Scheme,
    pub version: Version,
}

impl ConnectionId {
    /// The port from the authority, or the scheme default.
    pub fn port(&self) -> u16 {
        if let Some(rest) = self.authority.strip_prefix('[') {
            // Bracketed IPv6 authority: [addr]:port
            if let Some((_, after)) = rest.split_once(']') {
                if let Some(port) = after.strip_prefix(':') {
                    if let Ok(port) = port.parse() {
                        return port;
                    }
                }
            }

            return self.scheme.default_port();
        }

        match self.authority.rsplit_once(':') {
            Some((_, port)) => port.parse().unwrap_or_else(|_| self.scheme.default_port()),
            None => self.scheme.default_port(),
        }
    }

    /// The authority without its port; bracketed IPv6 addresses are
    /// unbracketed.
    pub fn hostname(&self) -> String {
        if let Some(rest) = self.authority.strip_prefix('[') {
            if let Some((inner, _)) = rest.split_once(']') {
                return inner.to_owned();
            }
        }

        match self.authority.split_once(':') {
            Some((host, _)) => host.to_owned(),
            None => self.authority.clone(),
        }
    }
}

/// One transport plus its codec, reused across exchanges until it
/// closes.
///
/// The transport lives in a shared slot so the idle timer can tear it
/// down while the connection sits in the pool; exclusive ownership of
/// the `Connection` value itself guarantees a single outstanding
/// exchange.
pub(crate) struct Connection {
    id: ConnectionId,
    resolver: Arc<dyn Resolver>,
    tls: Option<TlsConnector>,

    max_initial_size: usize,
    chunk_size: usize,
    idle_timeout: Duration,

    stream: Arc<Mutex<Option<ClientStream>>>,
    closing: CancellationToken,
    idle_timer: Option<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        resolver: Arc<dyn Resolver>,
        tls: Option<TlsConnector>,
        limits: &ClientLimits,
    ) -> Self {
        let mut conn = Self {
            id,
            resolver,
            tls,
            max_initial_size: limits.max_initial_size,
            chunk_size: limits.chunk_size,
            idle_timeout: limits.idle_timeout,
            stream: Arc::new(Mutex::new(None)),
            closing: CancellationToken::new(),
            idle_timer: None,
        };

        conn.arm_idle_timer();

        conn
    }

    pub(crate) fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub(crate) fn closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Idempotent teardown: flags the connection, drops the transport
    /// and wakes `wait_closed` callers.
    pub(crate) fn close(&mut self) {
        self.cancel_idle_timer();
        self.closing.cancel();

        if let Ok(mut slot) = self.stream.try_lock() {
            slot.take();
        }
    }

    pub(crate) async fn wait_closed(&self) {
        self.closing.cancelled().await;
    }

    /// Ensures a live transport: cancels the idle timer first, then
    /// resolves and dials if the slot is empty.
    async fn get_ready(&mut self) -> Result<()> {
        self.cancel_idle_timer();

        if self.closing() {
            return Err(Error::ConnectionClosed);
        }

        if self.stream.lock().await.is_some() {
            return Ok(());
        }

        let host = self.id.hostname();
        let port = self.id.port();

        let resolved = self.resolver.lookup(&host, port).await?;
        let transport = resolved.connect_fastest(self.tls.as_ref()).await?;
        debug!("connected to {host}:{port}");

        *self.stream.lock().await = Some(ClientStream::new(transport, self.max_initial_size));

        Ok(())
    }

    /// Performs one exchange.
    ///
    /// On success with `read_response_body` the connection re-arms its
    /// idle timer (or closes itself when the codec reports the exchange
    /// non-reusable). Without body buffering the transport moves into
    /// the returned response's reader and the connection closes. On any
    /// failure the transport is dropped and the error mapped onto the
    /// public taxonomy.
    pub(crate) async fn send_request(
        &mut self,
        request: &mut PendingRequest,
        read_response_body: bool,
        max_body_size: usize,
    ) -> Result<Response> {
        self.get_ready().await?;

        if !request.headers().contains("content-length") {
            let body_len = request.body_mut().len().await;

            match body_len {
                Ok(0) => {}
                Ok(len) => {
                    request
                        .headers_mut()
                        .set_default("content-length", len.to_string());
                }
                Err(BodyError::Unsupported) => {
                    request
                        .headers_mut()
                        .set_default("transfer-encoding", "chunked");
                }
                Err(BodyError::EndOfStream) => {}
                Err(BodyError::Io(e)) => return Err(Error::Io(e)),
            }
        }

        let slot = Arc::clone(&self.stream);
        let mut guard = slot.lock().await;

        let Some(stream) = guard.as_mut() else {
            // The idle timer won the race; report a clean close.
            self.closing.cancel();
            return Err(Error::ConnectionClosed);
        };

        let outcome = exchange(
            stream,
            request,
            read_response_body,
            max_body_size,
            self.chunk_size,
        )
        .await;

        match outcome {
            Ok((sent_head, head, body)) => {
                let sent = Request::new(sent_head, self.id.scheme);

                if read_response_body {
                    let reusable = stream.reusable();
                    drop(guard);

                    if reusable {
                        self.arm_idle_timer();
                    } else {
                        trace!("exchange with {} not reusable", self.id.authority);
                        self.close();
                    }

                    Ok(Response::new(sent, head, body, None))
                } else {
                    let reader = guard.take().map(ResponseReader::new);
                    drop(guard);
                    self.close();

                    Ok(Response::new(sent, head, Bytes::new(), reader))
                }
            }
            Err(err) => {
                guard.take();
                drop(guard);
                self.close();

                Err(err)
            }
        }
    }

    fn arm_idle_timer(&mut self) {
        self.cancel_idle_timer();

        let stream = Arc::clone(&self.stream);
        let closing = self.closing.clone();
        let idle_timeout = self.idle_timeout;
        let authority = self.id.authority.clone();

        self.idle_timer = Some(tokio::spawn(async move {
            tokio::select! {
                _ = closing.cancelled() => {}
                _ = tokio::time::sleep(idle_timeout) => {
                    debug!("idle connection to {authority} closed");
                    closing.cancel();
                    stream.lock().await.take();
                }
            }
        }));
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel_idle_timer();
    }
}

async fn exchange(
    stream: &mut ClientStream,
    request: &mut PendingRequest,
    read_response_body: bool,
    max_body_size: usize,
    chunk_size: usize,
) -> Result<(RequestHead, ResponseHead, Bytes)> {
    let sent_head = stream
        .write_head(request.wire_head())
        .await
        .map_err(WireError::into_public)?;

    loop {
        match request.body_mut().read(chunk_size).await {
            Ok(chunk) => {
                stream
                    .write_body(&chunk)
                    .await
                    .map_err(WireError::into_public)?;
                stream.flush().await.map_err(WireError::into_public)?;
            }
            Err(BodyError::EndOfStream) => break,
            Err(BodyError::Io(e)) => return Err(Error::Io(e)),
            Err(e) => return Err(e.into()),
        }
    }

    stream.finish().await.map_err(WireError::into_public)?;

    let head = stream
        .read_head()
        .await
        .map_err(WireError::into_public)?;

    let body = if read_response_body {
        let mut buf = BytesMut::new();

        loop {
            match stream.read_body(max_body_size + 1 - buf.len()).await {
                Ok(chunk) => {
                    buf.extend_from_slice(&chunk);

                    if buf.len() > max_body_size {
                        stream.abort_read();
                        return Err(Error::ResponseEntityTooLarge);
                    }
                }
                Err(WireError::ReadFinished) => break,
                Err(e) => return Err(e.into_public()),
            }
        }

        buf.freeze()
    } else {
        Bytes::new()
    };

    Ok((sent_head, head, body))
}
