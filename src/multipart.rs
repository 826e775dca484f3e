//! `multipart/form-data` request bodies.
//!
//! A multipart body is a sequence of field producers followed by a closing
//! boundary affix. String fields are rendered up front; file fields stream
//! their source lazily. The emitted framing:
//!
//! ```text
//! --<boundary>\r\n
//! Content-Disposition: form-data; name="a"\r\n
//! \r\n
//! value\r\n
//! --<boundary>\r\n
//! Content-Type: <type>\r\n
//! Content-Disposition: form-data; name="f"; filename="name.ext"\r\n
//! \r\n
//! <file bytes>--<boundary>--\r\n
//! ```

use crate::bodies::{BodyError, BytesBody, RequestBody};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const BOUNDARY_PREFIX: &str = "--------HiyoriFormBoundary";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One value of a form map.
#[derive(Debug)]
pub enum FormValue {
    /// A plain text field.
    Text(String),
    /// A file field; see [`File`].
    File(File),
}

impl From<&str> for FormValue {
    fn from(value: &str) -> Self {
        FormValue::Text(value.to_owned())
    }
}

impl From<String> for FormValue {
    fn from(value: String) -> Self {
        FormValue::Text(value)
    }
}

impl From<File> for FormValue {
    fn from(value: File) -> Self {
        FormValue::File(value)
    }
}

/// An order-preserving form map.
pub type Form = Vec<(String, FormValue)>;

/// A file entry of a multipart form.
///
/// The content type falls back to a guess from the filename extension and
/// finally to `application/octet-stream`. A raw byte buffer with no
/// filename therefore ships as `application/octet-stream`.
#[derive(Debug)]
pub struct File {
    source: FileSource,
    filename: Option<String>,
    content_type: Option<String>,
    headers: Vec<(String, String)>,
}

#[derive(Debug)]
enum FileSource {
    Buffer(BytesBody),
    Fs { file: tokio::fs::File, len: u64 },
}

impl File {
    /// Wraps an in-memory buffer.
    pub fn from_bytes(buf: impl Into<Bytes>) -> Self {
        Self {
            source: FileSource::Buffer(BytesBody::new(buf.into())),
            filename: None,
            content_type: None,
            headers: Vec::new(),
        }
    }

    /// Opens `path` for streaming. The filename defaults to the final
    /// path component.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();

        Ok(Self {
            source: FileSource::Fs { file, len },
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            content_type: None,
            headers: Vec::new(),
        })
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Adds an extra header emitted after the synthesised part headers.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn resolved_content_type(&self) -> String {
        if let Some(ct) = &self.content_type {
            return ct.clone();
        }

        self.filename
            .as_deref()
            .and_then(guess_content_type)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_owned()
    }

    fn into_field(self, name: &str, field_prefix: &str) -> FileField {
        let mut head = String::with_capacity(128);
        head.push_str(field_prefix);
        head.push_str("Content-Type: ");
        head.push_str(&self.resolved_content_type());
        head.push_str("\r\nContent-Disposition: form-data; name=\"");
        head.push_str(name);
        head.push('"');

        if let Some(filename) = &self.filename {
            head.push_str("; filename=\"");
            head.push_str(filename);
            head.push('"');
        }

        head.push_str("\r\n");

        for (hname, hvalue) in &self.headers {
            head.push_str(hname);
            head.push_str(": ");
            head.push_str(hvalue);
            head.push_str("\r\n");
        }

        head.push_str("\r\n");

        FileField {
            head: BytesBody::new(head.into_bytes()),
            source: self.source,
            in_head: true,
        }
    }
}

/// Content type from a filename extension; `None` when unrecognized.
fn guess_content_type(filename: &str) -> Option<&'static str> {
    let ext = filename.rsplit_once('.')?.1;

    let mime = match ext.to_ascii_lowercase().as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/vnd.microsoft.icon",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => return None,
    };

    Some(mime)
}

/// A file field: rendered headers followed by the streamed source.
///
/// File fields deliberately carry no trailing CRLF after the source
/// bytes; the next field prefix or the closing affix follows directly.
struct FileField {
    head: BytesBody,
    source: FileSource,
    in_head: bool,
}

#[async_trait]
impl RequestBody for FileField {
    async fn read(&mut self, n: usize) -> Result<Bytes, BodyError> {
        if self.in_head {
            match self.head.read(n).await {
                Ok(chunk) => return Ok(chunk),
                Err(BodyError::EndOfStream) => self.in_head = false,
                Err(e) => return Err(e),
            }
        }

        match &mut self.source {
            FileSource::Buffer(buf) => buf.read(n).await,
            FileSource::Fs { file, .. } => {
                let mut buf = vec![0u8; n];
                let read = file.read(&mut buf).await?;

                if read == 0 {
                    return Err(BodyError::EndOfStream);
                }

                buf.truncate(read);
                Ok(buf.into())
            }
        }
    }

    async fn len(&self) -> Result<u64, BodyError> {
        let source_len = match &self.source {
            FileSource::Buffer(buf) => buf.len().await?,
            FileSource::Fs { len, .. } => *len,
        };

        Ok(self.head.len().await? + source_len)
    }

    async fn rewind(&mut self) -> Result<(), BodyError> {
        self.head.rewind().await?;
        self.in_head = true;

        match &mut self.source {
            FileSource::Buffer(buf) => buf.rewind().await,
            FileSource::Fs { file, .. } => {
                file.seek(SeekFrom::Start(0)).await?;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cursor {
    Field(usize),
    Affix(usize),
    Done,
}

/// A `multipart/form-data` body assembled from a [`Form`].
///
/// `read` walks a cursor over (field 0, field 1, …, closing affix) and
/// returns bytes strictly from the current part. The total length is
/// known when every field's length is known, and is memoised on the
/// first successful `len` call. Exclusive `&mut self` access serialises
/// `read` and `rewind`; only the length memo needs a lock because `len`
/// takes `&self`.
pub struct MultipartBody {
    boundary: String,
    fields: Vec<Box<dyn RequestBody>>,
    affix: Bytes,
    cursor: Cursor,
    cached_len: Mutex<Option<u64>>,
}

impl MultipartBody {
    pub fn new(form: Form) -> Self {
        let suffix: u128 = rand::random();
        Self::with_boundary(form, format!("{BOUNDARY_PREFIX}{suffix:032x}"))
    }

    pub(crate) fn with_boundary(form: Form, boundary: String) -> Self {
        let field_prefix = format!("--{boundary}\r\n");
        let affix = Bytes::from(format!("--{boundary}--\r\n"));

        let fields = form
            .into_iter()
            .map(|(name, value)| match value {
                FormValue::Text(text) => {
                    let mut buf = String::with_capacity(
                        field_prefix.len() + name.len() + text.len() + 64,
                    );
                    buf.push_str(&field_prefix);
                    buf.push_str("Content-Disposition: form-data; name=\"");
                    buf.push_str(&name);
                    buf.push_str("\"\r\n\r\n");
                    buf.push_str(&text);
                    buf.push_str("\r\n");

                    Box::new(BytesBody::new(buf.into_bytes())) as Box<dyn RequestBody>
                }
                FormValue::File(file) => {
                    Box::new(file.into_field(&name, &field_prefix)) as Box<dyn RequestBody>
                }
            })
            .collect();

        Self {
            boundary,
            fields,
            affix,
            cursor: Cursor::Field(0),
            cached_len: Mutex::new(None),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request's `content-type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }
}

#[async_trait]
impl RequestBody for MultipartBody {
    async fn read(&mut self, n: usize) -> Result<Bytes, BodyError> {
        loop {
            match self.cursor {
                Cursor::Field(i) => {
                    let Some(field) = self.fields.get_mut(i) else {
                        self.cursor = Cursor::Affix(0);
                        continue;
                    };

                    match field.read(n).await {
                        Ok(chunk) => return Ok(chunk),
                        Err(BodyError::EndOfStream) => {
                            self.cursor = Cursor::Field(i + 1);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Cursor::Affix(pos) => {
                    if pos >= self.affix.len() {
                        self.cursor = Cursor::Done;
                        continue;
                    }

                    let end = (pos + n).min(self.affix.len());
                    let chunk = self.affix.slice(pos..end);
                    self.cursor = Cursor::Affix(end);

                    return Ok(chunk);
                }
                Cursor::Done => return Err(BodyError::EndOfStream),
            }
        }
    }

    async fn len(&self) -> Result<u64, BodyError> {
        if let Some(total) = *self.cached_len.lock().unwrap() {
            return Ok(total);
        }

        let mut total = self.affix.len() as u64;

        for field in &self.fields {
            total += field.len().await?;
        }

        *self.cached_len.lock().unwrap() = Some(total);

        Ok(total)
    }

    async fn rewind(&mut self) -> Result<(), BodyError> {
        for field in &mut self.fields {
            field.rewind().await?;
        }

        self.cursor = Cursor::Field(0);

        Ok(())
    }
}
