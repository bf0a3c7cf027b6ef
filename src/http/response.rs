//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them onto a connection's output.

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{Headers, StatusCode};

/// The body of a [`Response`].
///
/// A body is consumed exactly once, when the response is written to the
/// connection.
#[derive(Default)]
pub enum Body {
    /// No body; `Content-Length: 0` is written.
    #[default]
    Empty,
    /// A fully buffered body; `Content-Length` is written.
    Bytes(Bytes),
    /// A body read from an async source until EOF. The length is not known up
    /// front, so the response is delimited by closing the connection.
    Stream(Pin<Box<dyn AsyncRead + Send>>),
}

impl Body {
    /// Returns `true` when there is nothing to send.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Stream(_) => false,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Body::Stream(..)"),
        }
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use switchyard::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .content_type("application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.get_content_type(), Some("application/json"));
/// assert_eq!(response.bytes(), Some(&br#"{"status":"ok"}"#[..]));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    content_type: Option<String>,
    content_encoding: Option<String>,
    headers: Headers,
    body: Body,
    omit_body: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            content_encoding: None,
            headers: Headers::new(),
            body: Body::Empty,
            omit_body: false,
        }
    }

    /// A `200 OK` plain-text response.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok).body(text)
    }

    /// A `200 OK` JSON response.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `value` cannot be encoded.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(StatusCode::Ok)
            .content_type("application/json")
            .body_bytes(body))
    }

    /// The empty `404 Not Found` response returned on a route miss.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NotFound)
    }

    /// The generic `500 Internal Server Error` response.
    ///
    /// The body never carries details of the underlying failure.
    pub fn internal_error() -> Self {
        Self::new(StatusCode::InternalServerError).body("Internal Server Error")
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    ///
    /// `Content-Type` and `Content-Encoding` are single-valued: they replace
    /// the value set by [`content_type`](Self::content_type) or
    /// [`content_encoding`](Self::content_encoding) rather than adding a
    /// second line.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if name.eq_ignore_ascii_case("content-type") {
            self.content_type = Some(value.into());
        } else if name.eq_ignore_ascii_case("content-encoding") {
            self.content_encoding = Some(value.into());
        } else {
            self.headers.insert(name, value);
        }
    }

    /// Sets the `Content-Type` written with the response.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets the `Content-Encoding` written with the response.
    #[must_use]
    pub fn content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    /// Sets the response body from a string.
    ///
    /// Defaults the content type to `text/plain; charset=utf-8` unless one was
    /// already set.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.default_content_type("text/plain; charset=utf-8");
        self.body = Body::Bytes(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    ///
    /// Defaults the content type to `application/octet-stream` unless one was
    /// already set.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.default_content_type("application/octet-stream");
        self.body = Body::Bytes(body.into());
        self
    }

    /// Streams the response body from `reader` until EOF.
    #[must_use]
    pub fn body_stream(mut self, reader: impl AsyncRead + Send + 'static) -> Self {
        self.default_content_type("application/octet-stream");
        self.body = Body::Stream(Box::pin(reader));
        self
    }

    /// Keeps the status and headers, including the `Content-Length` of the
    /// body, but writes no body bytes. This is the shape of a reply to `HEAD`.
    #[must_use]
    pub fn omit_body(mut self) -> Self {
        self.omit_body = true;
        self
    }

    /// Returns `true` when [`write_to`](Self::write_to) will skip the body.
    pub fn is_body_omitted(&self) -> bool {
        self.omit_body
    }

    fn default_content_type(&mut self, default: &str) {
        if self.get_content_type().is_none() {
            self.content_type = Some(default.to_owned());
        }
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the content type, if one has been set.
    ///
    /// A `Content-Type` placed directly in [`headers_mut`](Self::headers_mut)
    /// takes precedence, matching what is written on the wire.
    pub fn get_content_type(&self) -> Option<&str> {
        self.headers
            .get("content-type")
            .or(self.content_type.as_deref())
    }

    /// Returns the content encoding, if one has been set.
    pub fn get_content_encoding(&self) -> Option<&str> {
        self.headers
            .get("content-encoding")
            .or(self.content_encoding.as_deref())
    }

    /// Replaces the content encoding in-place.
    pub fn set_content_encoding(&mut self, encoding: Option<String>) {
        self.headers.remove("content-encoding");
        self.content_encoding = encoding;
    }

    /// Returns the additional response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the additional response headers for modification.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body.
    pub fn payload(&self) -> &Body {
        &self.body
    }

    /// Returns the buffered body bytes, or `None` for empty and streamed bodies.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Takes the body out of the response, leaving it empty.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// Replaces the body in-place.
    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Serializes the status line and headers.
    ///
    /// `content_length` is `None` for streamed bodies, which are delimited by
    /// connection close instead.
    fn encode_head(&self, content_length: Option<usize>) -> BytesMut {
        let estimated_size = 128 + self.headers.len() * 64;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Entries in the header map override the typed fields.
        if let Some(content_type) = &self.content_type
            && !self.headers.contains("content-type")
        {
            buf.put(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        if let Some(encoding) = &self.content_encoding
            && !self.headers.contains("content-encoding")
        {
            buf.put(format!("Content-Encoding: {encoding}\r\n").as_bytes());
        }

        for (name, value) in self.headers.iter() {
            // Framing headers are always derived from the body.
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        buf.put(&b"Connection: close\r\n"[..]);
        if let Some(length) = content_length {
            buf.put(format!("Content-Length: {length}\r\n").as_bytes());
        }

        // Header/body separator
        buf.put(&b"\r\n"[..]);
        buf
    }

    /// Writes the response onto `out` using HTTP/1.1 wire format and flushes.
    ///
    /// Always writes `Connection: close`; buffered bodies also get a
    /// `Content-Length`. After [`omit_body`](Self::omit_body) only the head is
    /// written.
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised while writing or while reading a streamed
    /// body.
    pub async fn write_to<W>(self, out: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let content_length = match &self.body {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len()),
            Body::Stream(_) => None,
        };
        let head = self.encode_head(content_length);
        out.write_all(&head).await?;

        match self.body {
            _ if self.omit_body => {}
            Body::Empty => {}
            Body::Bytes(bytes) => out.write_all(&bytes).await?,
            Body::Stream(mut reader) => {
                tokio::io::copy(&mut reader, out).await?;
            }
        }

        out.flush().await
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
