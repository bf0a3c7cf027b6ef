use std::io::{self, Write};
use std::pin::Pin;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder};
use tracing::{debug, warn};

use super::{Middleware, Next};
use crate::{
    Response,
    context::Context,
    http::Body,
    server::Shutdown,
};

/// A content coding this middleware can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coding {
    Gzip,
    Deflate,
}

impl Coding {
    fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }

    fn encode(self, data: &[u8], level: Compression) -> io::Result<Vec<u8>> {
        match self {
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), level);
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), level);
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }
}

/// Picks the first supported token of an `Accept-Encoding` value, in the
/// order the client listed them. A token with `q=0` is refused and skipped;
/// other quality values do not change the order.
fn negotiate(accept_encoding: &str) -> Option<Coding> {
    accept_encoding
        .split(',')
        .filter(|token| !is_refused(token))
        .filter_map(|token| token.split(';').next())
        .map(str::trim)
        .find_map(|name| match name {
            n if n.eq_ignore_ascii_case("gzip") => Some(Coding::Gzip),
            n if n.eq_ignore_ascii_case("deflate") => Some(Coding::Deflate),
            _ => None,
        })
}

/// `true` when a token carries a zero quality, e.g. `gzip;q=0` or `gzip; q=0.000`.
fn is_refused(token: &str) -> bool {
    token.split(';').skip(1).any(|param| {
        let Some((key, value)) = param.split_once('=') else {
            return false;
        };
        key.trim().eq_ignore_ascii_case("q")
            && value.trim().parse::<f32>().is_ok_and(|q| q <= 0.0)
    })
}

/// Compresses successful responses with `gzip` or `deflate`.
///
/// Only `2xx` responses with a buffered, non-empty body and no existing
/// `Content-Encoding` are touched. Streamed bodies pass through unchanged.
/// If the encoder fails the original body is sent uncompressed.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::middleware::{CompressionMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(CompressionMiddleware::new().level(9)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CompressionMiddleware {
    level: Compression,
}

impl Default for CompressionMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionMiddleware {
    /// Creates the middleware with the default compression level (6).
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Sets the compression level, capped at 9.
    #[must_use]
    pub fn level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }

    fn compress(&self, response: &mut Response, coding: Coding) {
        let Body::Bytes(plain) = response.take_body() else {
            return;
        };
        match coding.encode(&plain, self.level) {
            Ok(compressed) => {
                debug!(
                    encoding = coding.as_str(),
                    before = plain.len(),
                    after = compressed.len(),
                    "compressed response body"
                );
                response.set_body(Body::Bytes(Bytes::from(compressed)));
                response.set_content_encoding(Some(coding.as_str().to_owned()));
            }
            Err(e) => {
                warn!(encoding = coding.as_str(), error = %e, "compression failed, sending identity");
                response.set_body(Body::Bytes(plain));
            }
        }
    }
}

impl Middleware for CompressionMiddleware {
    fn handle(
        &self,
        ctx: Context,
        next: Next,
        shutdown: Shutdown,
    ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let this = *self;
        let coding = ctx
            .request()
            .headers()
            .get("accept-encoding")
            .and_then(negotiate);

        Box::pin(async move {
            let mut response = next.run(ctx, shutdown).await;

            let eligible = response.status().is_success()
                && response.get_content_encoding().is_none()
                && matches!(response.payload(), Body::Bytes(b) if !b.is_empty());

            if let (true, Some(coding)) = (eligible, coding) {
                this.compress(&mut response, coding);
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use flate2::read::{DeflateDecoder, GzDecoder};

    use super::*;
    use crate::{
        Request, StatusCode,
        context::{RouteParams, ServerState},
        middleware::{compose_fn, from_middleware},
    };

    const TEXT: &str = "the quick brown fox jumps over the lazy dog, again and again and again";

    async fn run(accept: Option<&str>, status: StatusCode) -> Response {
        let raw = match accept {
            Some(value) => format!("GET / HTTP/1.1\r\nAccept-Encoding: {value}\r\n\r\n"),
            None => "GET / HTTP/1.1\r\n\r\n".to_owned(),
        };
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        let ctx = Context::new(req, RouteParams::new(), ServerState::new());
        let pipeline = compose_fn(
            &[from_middleware(Arc::new(CompressionMiddleware::new()))],
            move |_ctx: Context, _: Shutdown| async move { Response::new(status).body(TEXT) },
        );
        pipeline(ctx, Shutdown::never()).await
    }

    #[test]
    fn negotiation_takes_first_supported_token() {
        assert_eq!(negotiate("br, gzip;q=0.8, deflate"), Some(Coding::Gzip));
        assert_eq!(negotiate("deflate, gzip"), Some(Coding::Deflate));
        assert_eq!(negotiate(" GZIP "), Some(Coding::Gzip));
        assert_eq!(negotiate("br, identity"), None);
        assert_eq!(negotiate(""), None);
    }

    #[test]
    fn zero_quality_refuses_a_coding() {
        assert_eq!(negotiate("gzip;q=0, deflate"), Some(Coding::Deflate));
        assert_eq!(negotiate("gzip; q=0.0"), None);
        assert_eq!(negotiate("gzip;Q=0.000, deflate;q=0"), None);
        assert_eq!(negotiate("gzip;q=0.001"), Some(Coding::Gzip));
        assert_eq!(negotiate("gzip;q=junk"), Some(Coding::Gzip));
    }

    #[tokio::test]
    async fn encoding_set_through_headers_is_respected() {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n").unwrap();
        let ctx = Context::new(req, RouteParams::new(), ServerState::new());
        let pipeline = compose_fn(
            &[from_middleware(Arc::new(CompressionMiddleware::new()))],
            |_ctx: Context, _: Shutdown| async move {
                let mut response = Response::text(TEXT);
                response.headers_mut().set("Content-Encoding", "br");
                response
            },
        );
        let response = pipeline(ctx, Shutdown::never()).await;
        assert_eq!(response.get_content_encoding(), Some("br"));
        assert_eq!(response.bytes(), Some(TEXT.as_bytes()));

        let mut out = Vec::new();
        response.write_to(&mut out).await.unwrap();
        let raw = String::from_utf8(out).unwrap();
        assert_eq!(raw.to_ascii_lowercase().matches("content-encoding").count(), 1, "{raw}");
    }

    #[tokio::test]
    async fn gzip_body_decodes_to_original() {
        let response = run(Some("gzip"), StatusCode::Ok).await;
        assert_eq!(response.get_content_encoding(), Some("gzip"));

        let mut decoded = String::new();
        GzDecoder::new(response.bytes().unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, TEXT);
    }

    #[tokio::test]
    async fn deflate_is_labelled_deflate() {
        let response = run(Some("deflate"), StatusCode::Ok).await;
        assert_eq!(response.get_content_encoding(), Some("deflate"));

        let mut decoded = String::new();
        DeflateDecoder::new(response.bytes().unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, TEXT);
    }

    #[tokio::test]
    async fn non_success_is_untouched() {
        let response = run(Some("gzip"), StatusCode::NotFound).await;
        assert_eq!(response.get_content_encoding(), None);
        assert_eq!(response.bytes(), Some(TEXT.as_bytes()));
    }

    #[tokio::test]
    async fn no_accept_encoding_is_untouched() {
        let response = run(None, StatusCode::Ok).await;
        assert_eq!(response.get_content_encoding(), None);
        assert_eq!(response.bytes(), Some(TEXT.as_bytes()));
    }
}
