//! Byte-level HTTP/1.1 codec.
//!
//! [`ClientStream`] owns one transport and serialises one exchange at a
//! time: request head, streamed request body (content-length or chunked
//! framing), response head, streamed response body (content-length,
//! chunked, or EOF-delimited). The state machines reject out-of-order use
//! (`WriteAfterFinished`) and surface peer misbehavior as
//! [`WireError::ReceivedDataMalformed`].

use crate::http::types::{
    hex_slice_to_usize, slice_to_usize, HeaderMap, Method, StatusCode, Version,
};
use bytes::{Bytes, BytesMut};
use memchr::{memchr, memmem};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Byte stream a connection runs over: plain TCP, TLS, or a local socket.
pub(crate) trait Transport: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug> Transport for T {}

pub(crate) type BoxedTransport = Box<dyn Transport>;

/// Upper bound on a single chunk-size line or trailer section.
const FRAMING_LINE_BOUND: usize = 8 * 1024;

/// Codec faults. `ReadFinished` is the normal end-of-body signal; the
/// rest poison the exchange and force the connection closed.
#[derive(Debug, thiserror::Error)]
pub(crate) enum WireError {
    #[error("read finished")]
    ReadFinished,

    #[error("read aborted")]
    ReadAborted,

    #[error("write aborted")]
    WriteAborted,

    #[error("write after finished")]
    WriteAfterFinished,

    #[error("received data malformed: {0}")]
    ReceivedDataMalformed(&'static str),

    #[error("entity too large")]
    EntityTooLarge,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Maps a codec fault onto the public error taxonomy. `ReadFinished`
    /// is a control signal and must be handled before converting.
    pub(crate) fn into_public(self) -> crate::errors::Error {
        use crate::errors::Error;

        match self {
            WireError::ReceivedDataMalformed(reason) => Error::BadResponse(reason.to_owned()),
            WireError::EntityTooLarge => Error::ResponseEntityTooLarge,
            WireError::ReadFinished
            | WireError::ReadAborted
            | WireError::WriteAborted
            | WireError::WriteAfterFinished
            | WireError::Io(_) => Error::ConnectionClosed,
        }
    }
}

/// The request line and headers exactly as they are put on the wire.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) uri: String,
    pub(crate) authority: String,
    pub(crate) headers: HeaderMap,
}

/// Parsed response status line and headers.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WriteState {
    Ready,
    Streaming(BodyFraming),
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BodyFraming {
    Length(u64),
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadState {
    AwaitingHead,
    Body(ReadFraming),
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadFraming {
    Length(u64),
    Chunked(ChunkPhase),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkPhase {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

/// One HTTP/1.1 exchange over an owned transport.
pub(crate) struct ClientStream {
    io: BoxedTransport,
    buf: BytesMut,
    max_initial_size: usize,

    write_state: WriteState,
    read_state: ReadState,

    /// The request was HEAD, so the response carries no body regardless
    /// of its headers.
    head_request: bool,

    /// Whether the peer allows reusing the connection after this
    /// exchange.
    peer_keep_alive: bool,
}

impl ClientStream {
    pub(crate) fn new(io: BoxedTransport, max_initial_size: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4 * 1024),
            max_initial_size,
            write_state: WriteState::Ready,
            read_state: ReadState::AwaitingHead,
            head_request: false,
            peer_keep_alive: false,
        }
    }

    /// Emits the request line and headers, filling in the `host` and
    /// `accept` defaults, and arms the body writer according to the
    /// framing headers already present.
    pub(crate) async fn write_head(
        &mut self,
        mut head: RequestHead,
    ) -> Result<RequestHead, WireError> {
        if self.write_state != WriteState::Ready {
            return Err(WireError::WriteAfterFinished);
        }

        head.headers.set_default("host", head.authority.clone());
        head.headers.set_default("accept", "*/*");

        let framing = request_framing(&head.headers)?;

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(head.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(head.uri.as_bytes());
        out.push(b' ');
        out.extend_from_slice(head.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in head.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");

        self.io.write_all(&out).await?;
        self.io.flush().await?;

        self.head_request = head.method == Method::Head;
        self.write_state = match framing {
            Some(framing) => WriteState::Streaming(framing),
            None => WriteState::Finished,
        };

        Ok(head)
    }

    /// Writes one body chunk under the framing chosen at `write_head`.
    pub(crate) async fn write_body(&mut self, chunk: &[u8]) -> Result<(), WireError> {
        match self.write_state {
            WriteState::Streaming(BodyFraming::Length(remaining)) => {
                if (chunk.len() as u64) > remaining {
                    self.write_state = WriteState::Aborted;
                    return Err(WireError::WriteAborted);
                }

                self.io.write_all(chunk).await?;
                self.write_state =
                    WriteState::Streaming(BodyFraming::Length(remaining - chunk.len() as u64));

                Ok(())
            }
            WriteState::Streaming(BodyFraming::Chunked) => {
                // A zero-length chunk would terminate the framing.
                if chunk.is_empty() {
                    return Ok(());
                }

                let mut frame = Vec::with_capacity(chunk.len() + 16);
                frame.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                frame.extend_from_slice(chunk);
                frame.extend_from_slice(b"\r\n");

                self.io.write_all(&frame).await?;

                Ok(())
            }
            WriteState::Ready | WriteState::Finished => Err(WireError::WriteAfterFinished),
            WriteState::Aborted => Err(WireError::WriteAborted),
        }
    }

    pub(crate) async fn flush(&mut self) -> Result<(), WireError> {
        self.io.flush().await?;
        Ok(())
    }

    /// Terminates the request body: emits the final chunk frame, or
    /// verifies the declared content-length was fully written. A no-op
    /// for requests without a body.
    pub(crate) async fn finish(&mut self) -> Result<(), WireError> {
        match self.write_state {
            WriteState::Streaming(BodyFraming::Length(0)) | WriteState::Finished => {
                self.write_state = WriteState::Finished;
                self.io.flush().await?;
                Ok(())
            }
            WriteState::Streaming(BodyFraming::Length(_)) => {
                self.write_state = WriteState::Aborted;
                Err(WireError::WriteAborted)
            }
            WriteState::Streaming(BodyFraming::Chunked) => {
                self.io.write_all(b"0\r\n\r\n").await?;
                self.io.flush().await?;
                self.write_state = WriteState::Finished;
                Ok(())
            }
            WriteState::Ready => Err(WireError::WriteAfterFinished),
            WriteState::Aborted => Err(WireError::WriteAborted),
        }
    }

    /// Awaits and parses the response status line and headers, bounded
    /// by `max_initial_size`.
    pub(crate) async fn read_head(&mut self) -> Result<ResponseHead, WireError> {
        if self.read_state != ReadState::AwaitingHead {
            return Err(WireError::ReadAborted);
        }

        let head_end = loop {
            if let Some(pos) = memmem::find(&self.buf, b"\r\n\r\n") {
                break pos + 4;
            }

            if self.buf.len() > self.max_initial_size {
                self.read_state = ReadState::Aborted;
                return Err(WireError::EntityTooLarge);
            }

            if self.fill().await? == 0 {
                self.read_state = ReadState::Aborted;
                return Err(WireError::ReadAborted);
            }
        };

        if head_end > self.max_initial_size {
            self.read_state = ReadState::Aborted;
            return Err(WireError::EntityTooLarge);
        }

        let head_bytes = self.buf.split_to(head_end);
        let head = parse_head(&head_bytes[..head_end - 4])?;

        let keep_alive_default = head.version == Version::Http11;

        self.peer_keep_alive = match head.headers.get("connection") {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
            _ => keep_alive_default,
        };

        let framing = response_framing(&head, self.head_request)?;

        self.read_state = match framing {
            Some(ReadFraming::Length(0)) | None => ReadState::Finished,
            Some(framing) => {
                // An EOF-delimited body consumes the connection.
                if framing == ReadFraming::Eof {
                    self.peer_keep_alive = false;
                }

                ReadState::Body(framing)
            }
        };

        Ok(head)
    }

    /// Returns up to `n` body bytes, or `Err(ReadFinished)` once the
    /// body is fully delivered.
    pub(crate) async fn read_body(&mut self, n: usize) -> Result<Bytes, WireError> {
        match self.read_state {
            ReadState::Body(ReadFraming::Length(remaining)) => {
                let chunk = self.read_raw(n.min(remaining as usize)).await?;
                let remaining = remaining - chunk.len() as u64;

                self.read_state = if remaining == 0 {
                    ReadState::Finished
                } else {
                    ReadState::Body(ReadFraming::Length(remaining))
                };

                Ok(chunk)
            }
            ReadState::Body(ReadFraming::Eof) => {
                if self.buf.is_empty() && self.fill().await? == 0 {
                    self.read_state = ReadState::Finished;
                    return Err(WireError::ReadFinished);
                }

                let take = n.min(self.buf.len());
                Ok(self.buf.split_to(take).freeze())
            }
            ReadState::Body(ReadFraming::Chunked(phase)) => self.read_chunked(phase, n).await,
            ReadState::Finished => Err(WireError::ReadFinished),
            ReadState::Aborted => Err(WireError::ReadAborted),
            ReadState::AwaitingHead => Err(WireError::ReadAborted),
        }
    }

    async fn read_chunked(&mut self, mut phase: ChunkPhase, n: usize) -> Result<Bytes, WireError> {
        loop {
            match phase {
                ChunkPhase::Size => {
                    let line = self.read_framing_line().await?;
                    let size_part = match memchr(b';', &line) {
                        Some(pos) => &line[..pos],
                        None => &line[..],
                    };

                    let size = hex_slice_to_usize(trim_ascii(size_part))
                        .ok_or(WireError::ReceivedDataMalformed("invalid chunk size"))?;

                    phase = if size == 0 {
                        ChunkPhase::Trailers
                    } else {
                        ChunkPhase::Data(size as u64)
                    };
                }
                ChunkPhase::Data(remaining) => {
                    let chunk = self.read_raw(n.min(remaining as usize)).await?;
                    let remaining = remaining - chunk.len() as u64;

                    phase = if remaining == 0 {
                        ChunkPhase::DataEnd
                    } else {
                        ChunkPhase::Data(remaining)
                    };

                    self.read_state = ReadState::Body(ReadFraming::Chunked(phase));
                    return Ok(chunk);
                }
                ChunkPhase::DataEnd => {
                    let line = self.read_framing_line().await?;

                    if !line.is_empty() {
                        self.read_state = ReadState::Aborted;
                        return Err(WireError::ReceivedDataMalformed(
                            "chunk data not terminated by CRLF",
                        ));
                    }

                    phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailers => {
                    let line = self.read_framing_line().await?;

                    if line.is_empty() {
                        self.read_state = ReadState::Finished;
                        return Err(WireError::ReadFinished);
                    }
                }
            }

            self.read_state = ReadState::Body(ReadFraming::Chunked(phase));
        }
    }

    /// Discards the rest of the exchange. The connection must not be
    /// reused afterwards.
    pub(crate) fn abort_read(&mut self) {
        if self.read_state != ReadState::Finished {
            self.read_state = ReadState::Aborted;
        }

        self.peer_keep_alive = false;
    }

    /// Whether the finished exchange left the connection in a state the
    /// pool may reuse.
    pub(crate) fn reusable(&self) -> bool {
        self.peer_keep_alive
            && self.write_state == WriteState::Finished
            && self.read_state == ReadState::Finished
    }

    /// Up to `n` raw bytes from the buffer, refilling once if empty.
    /// EOF inside a framed body is a peer abort.
    async fn read_raw(&mut self, n: usize) -> Result<Bytes, WireError> {
        if n == 0 {
            return Ok(Bytes::new());
        }

        if self.buf.is_empty() && self.fill().await? == 0 {
            self.read_state = ReadState::Aborted;
            return Err(WireError::ReadAborted);
        }

        let take = n.min(self.buf.len());
        Ok(self.buf.split_to(take).freeze())
    }

    /// One CRLF-terminated framing line (chunk size or trailer), without
    /// its terminator.
    async fn read_framing_line(&mut self) -> Result<Bytes, WireError> {
        let line_end = loop {
            if let Some(pos) = memchr(b'\n', &self.buf) {
                break pos;
            }

            if self.buf.len() > FRAMING_LINE_BOUND {
                self.read_state = ReadState::Aborted;
                return Err(WireError::ReceivedDataMalformed("framing line too long"));
            }

            if self.fill().await? == 0 {
                self.read_state = ReadState::Aborted;
                return Err(WireError::ReadAborted);
            }
        };

        if line_end == 0 || self.buf[line_end - 1] != b'\r' {
            self.read_state = ReadState::Aborted;
            return Err(WireError::ReceivedDataMalformed("framing line without CRLF"));
        }

        let mut line = self.buf.split_to(line_end + 1);
        line.truncate(line_end - 1);

        Ok(line.freeze())
    }

    async fn fill(&mut self) -> Result<usize, WireError> {
        Ok(self.io.read_buf(&mut self.buf).await?)
    }
}

/// Framing the request body writer must apply, from the headers the
/// connection prepared.
fn request_framing(headers: &HeaderMap) -> Result<Option<BodyFraming>, WireError> {
    if let Some(te) = headers.get("transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(Some(BodyFraming::Chunked));
        }
    }

    match headers.get("content-length") {
        Some(value) => {
            let len = slice_to_usize(value.as_bytes()).ok_or(WireError::WriteAborted)?;

            if len == 0 {
                Ok(None)
            } else {
                Ok(Some(BodyFraming::Length(len as u64)))
            }
        }
        None => Ok(None),
    }
}

fn response_framing(
    head: &ResponseHead,
    head_request: bool,
) -> Result<Option<ReadFraming>, WireError> {
    let status = head.status.as_u16();

    if head_request || status < 200 || status == 204 || status == 304 {
        return Ok(None);
    }

    if let Some(te) = head.headers.get("transfer-encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(Some(ReadFraming::Chunked(ChunkPhase::Size)));
        }
    }

    if let Some(value) = head.headers.get("content-length") {
        let len = slice_to_usize(value.as_bytes())
            .ok_or(WireError::ReceivedDataMalformed("invalid content-length"))?;

        return Ok(Some(ReadFraming::Length(len as u64)));
    }

    Ok(Some(ReadFraming::Eof))
}

fn parse_head(raw: &[u8]) -> Result<ResponseHead, WireError> {
    let mut lines = raw.split(|&b| b == b'\n');

    let status_line = lines
        .next()
        .ok_or(WireError::ReceivedDataMalformed("empty response head"))?;
    let status_line = strip_cr(status_line);

    let mut parts = status_line.splitn(3, |&b| b == b' ');

    let version_part = parts
        .next()
        .ok_or(WireError::ReceivedDataMalformed("missing http version"))?;
    let (version, _) = Version::from_bytes(version_part)
        .ok_or(WireError::ReceivedDataMalformed("unsupported http version"))?;

    let status_part = parts
        .next()
        .ok_or(WireError::ReceivedDataMalformed("missing status code"))?;
    let status = slice_to_usize(status_part)
        .filter(|&code| (100..1000).contains(&code))
        .ok_or(WireError::ReceivedDataMalformed("invalid status code"))?;

    let mut headers = HeaderMap::with_capacity(16);

    for line in lines {
        let line = strip_cr(line);

        if line.is_empty() {
            continue;
        }

        let colon =
            memchr(b':', line).ok_or(WireError::ReceivedDataMalformed("header without colon"))?;

        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|&b| b == b' ' || b == b'\t') {
            return Err(WireError::ReceivedDataMalformed("invalid header name"));
        }

        let value = trim_ascii(&line[colon + 1..]);

        let name = simdutf8::basic::from_utf8(name)
            .map_err(|_| WireError::ReceivedDataMalformed("header name not utf-8"))?;
        let value = simdutf8::basic::from_utf8(value)
            .map_err(|_| WireError::ReceivedDataMalformed("header value not utf-8"))?;

        headers.append(name, value);
    }

    Ok(ResponseHead {
        version,
        status: StatusCode::new(status as u16),
        headers,
    })
}

#[inline]
fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

#[inline]
fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }

    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }

    bytes
}
