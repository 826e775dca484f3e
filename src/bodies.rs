//! Request body producers.
//!
//! A body is a lazy byte source the connection pulls from while writing a
//! request. Length reporting and rewinding are optional capabilities
//! signalled through [`BodyError::Unsupported`]: a body without a length
//! is sent with chunked transfer encoding, and a body without `rewind`
//! cannot be replayed across a 307/308 redirect.

use crate::errors::Error;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::io;

/// Failures local to a body producer.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    /// The producer is exhausted. This is the normal end-of-body signal,
    /// not a fault.
    #[error("end of stream")]
    EndOfStream,

    /// The producer does not implement the optional operation.
    #[error("operation not supported by this body")]
    Unsupported,

    /// Reading the underlying source failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<BodyError> for Error {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::Io(e) => Error::Io(e),
            // EndOfStream/Unsupported are control signals; reaching here
            // means a caller forgot to handle one.
            other => Error::InvalidRequest(other.to_string()),
        }
    }
}

/// A streaming request payload.
///
/// `read` may be called repeatedly until it returns
/// [`BodyError::EndOfStream`]. Exclusive access (`&mut self`) guarantees
/// reads never interleave.
#[async_trait]
pub trait RequestBody: Send + Sync {
    /// Returns up to `n` bytes, or [`BodyError::EndOfStream`] once
    /// exhausted.
    async fn read(&mut self, n: usize) -> Result<Bytes, BodyError>;

    /// Total byte length of this body.
    ///
    /// Bodies that cannot know their size up front return
    /// [`BodyError::Unsupported`], which makes the connection switch to
    /// chunked transfer encoding.
    async fn len(&self) -> Result<u64, BodyError> {
        Err(BodyError::Unsupported)
    }

    /// Repositions the producer to its start so it can be read again.
    ///
    /// Needed to replay the payload over a 307/308 redirect.
    async fn rewind(&mut self) -> Result<(), BodyError> {
        Err(BodyError::Unsupported)
    }
}

/// In-memory body. Supports both `len` and `rewind`.
#[derive(Debug, Clone)]
pub struct BytesBody {
    buf: Bytes,
    pos: usize,
}

impl BytesBody {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self {
            buf: buf.into(),
            pos: 0,
        }
    }

    /// URL-encodes `form` pairs into an
    /// `application/x-www-form-urlencoded` payload.
    pub fn url_encoded<K, V>(form: &[(K, V)]) -> Result<Self, Error>
    where
        K: Serialize,
        V: Serialize,
    {
        let encoded = serde_urlencoded::to_string(form)
            .map_err(|e| Error::InvalidRequest(format!("unencodable form: {e}")))?;

        Ok(Self::new(encoded.into_bytes()))
    }

    /// Serializes `value` into a UTF-8 `application/json` payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, Error> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| Error::InvalidRequest(format!("unserializable json: {e}")))?;

        Ok(Self::new(encoded))
    }
}

#[async_trait]
impl RequestBody for BytesBody {
    async fn read(&mut self, n: usize) -> Result<Bytes, BodyError> {
        if self.pos >= self.buf.len() || n == 0 {
            return Err(BodyError::EndOfStream);
        }

        let end = (self.pos + n).min(self.buf.len());
        let chunk = self.buf.slice(self.pos..end);
        self.pos = end;

        Ok(chunk)
    }

    async fn len(&self) -> Result<u64, BodyError> {
        Ok(self.buf.len() as u64)
    }

    async fn rewind(&mut self) -> Result<(), BodyError> {
        self.pos = 0;
        Ok(())
    }
}

/// Body used when a request carries no payload.
///
/// Reports a length of zero, so neither `content-length` nor
/// `transfer-encoding` is emitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyBody;

#[async_trait]
impl RequestBody for EmptyBody {
    async fn read(&mut self, _n: usize) -> Result<Bytes, BodyError> {
        Err(BodyError::EndOfStream)
    }

    async fn len(&self) -> Result<u64, BodyError> {
        Ok(0)
    }

    async fn rewind(&mut self) -> Result<(), BodyError> {
        Ok(())
    }
}

/// Drains `body` completely with `chunk_size` reads.
#[cfg(test)]
pub(crate) async fn read_all(body: &mut dyn RequestBody, chunk_size: usize) -> Vec<u8> {
    let mut out = Vec::new();

    loop {
        match body.read(chunk_size).await {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(BodyError::EndOfStream) => break,
            Err(e) => panic!("body read failed: {e}"),
        }
    }

    out
}
