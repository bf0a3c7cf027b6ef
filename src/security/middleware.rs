//! Cross-Origin Resource Sharing.

use std::pin::Pin;

use regex::Regex;
use tracing::{debug, warn};

use crate::{
    Headers, Method, Response, StatusCode,
    context::Context,
    middleware::{Middleware, Next},
    server::Shutdown,
};

const ALL_METHODS: [&str; 6] = ["DELETE", "GET", "OPTIONS", "PATCH", "POST", "PUT"];

/// CORS middleware: answers preflight requests and decorates actual
/// responses with `Access-Control-*` headers.
///
/// # Behavior
///
/// - A request without an `Origin` header passes through untouched.
/// - `OPTIONS` carrying `Access-Control-Request-Method` is a preflight. It is
///   answered here, without calling the handler: `200 OK` when the origin,
///   method and every requested header are allowed, otherwise `400` with a
///   body naming what was rejected.
/// - Any other request runs the handler. Its response gets the CORS headers.
///   A specific allowed origin is echoed back with `Vary: Origin`. With the
///   wildcard policy the origin is echoed only when the request carries a
///   `Cookie`, since browsers reject `*` for credentialed requests.
///
/// The default policy allows every origin, every standard method and every
/// header, with a max age of 600 seconds.
///
/// # Examples
///
/// ```rust
/// use switchyard::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://app.example.com")
///     .allow_origin_regex(r"^https://.*\.example\.com$")
///     .unwrap()
///     .allow_methods(["GET", "POST"])
///     .allow_header("Content-Type")
///     .allow_credentials(true)
///     .max_age(3600);
/// ```
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    allow_origins: Option<Vec<String>>,
    allow_origin_regex: Option<Regex>,
    allow_methods: Vec<String>,
    allow_headers: Option<Vec<String>>,
    allow_credentials: bool,
    expose_headers: Vec<String>,
    max_age: u32,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// Creates the permissive default policy.
    ///
    /// | Setting           | Default                                    |
    /// |-------------------|--------------------------------------------|
    /// | Allowed origins   | all (`*`)                                  |
    /// | Allowed methods   | `DELETE, GET, OPTIONS, PATCH, POST, PUT`   |
    /// | Allowed headers   | all (requested headers are mirrored)       |
    /// | Credentials       | not allowed                                |
    /// | Exposed headers   | none                                       |
    /// | Max age           | 600 seconds                                |
    pub fn new() -> Self {
        Self {
            allow_origins: None,
            allow_origin_regex: None,
            allow_methods: ALL_METHODS.iter().map(|m| (*m).to_owned()).collect(),
            allow_headers: None,
            allow_credentials: false,
            expose_headers: Vec::new(),
            max_age: 600,
        }
    }

    /// Restricts origins to an explicit list and adds `origin` to it.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allow_origins
            .get_or_insert_with(Vec::new)
            .push(origin.into());
        self
    }

    /// Also allows any origin matching `pattern`. Switches off the wildcard
    /// policy.
    ///
    /// # Errors
    ///
    /// Returns the regex compile error if `pattern` is invalid.
    pub fn allow_origin_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.allow_origin_regex = Some(Regex::new(pattern)?);
        self.allow_origins.get_or_insert_with(Vec::new);
        Ok(self)
    }

    /// Replaces the allowed methods. Names are uppercased.
    #[must_use]
    pub fn allow_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allow_methods = methods
            .into_iter()
            .map(|m| m.as_ref().to_ascii_uppercase())
            .collect();
        self
    }

    /// Restricts request headers to an explicit list and adds `header` to it.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allow_headers
            .get_or_insert_with(Vec::new)
            .push(header.into());
        self
    }

    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    /// Adds a response header the browser may expose to scripts.
    #[must_use]
    pub fn expose_header(mut self, header: impl Into<String>) -> Self {
        self.expose_headers.push(header.into());
        self
    }

    /// Sets `Access-Control-Max-Age` for preflight responses, in seconds.
    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self
    }

    fn allows_all_origins(&self) -> bool {
        self.allow_origins.is_none()
    }

    fn is_allowed_origin(&self, origin: &str) -> bool {
        match &self.allow_origins {
            None => true,
            Some(list) => {
                list.iter().any(|o| o == origin)
                    || self
                        .allow_origin_regex
                        .as_ref()
                        .is_some_and(|re| re.is_match(origin))
            }
        }
    }

    fn preflight(&self, origin: &str, request: &Headers) -> Response {
        match self.check_preflight(origin, request) {
            Ok(headers) => {
                debug!(origin, "passed preflight checks");
                let mut response = Response::text("OK");
                *response.headers_mut() = headers;
                response
            }
            Err(reason) => {
                warn!(origin, reason = %reason, "failed preflight checks");
                Response::new(StatusCode::BadRequest).body(reason)
            }
        }
    }

    fn check_preflight(&self, origin: &str, request: &Headers) -> Result<Headers, String> {
        let mut headers = Headers::new();

        if !self.is_allowed_origin(origin) {
            return Err(format!("Invalid origin {origin}"));
        }
        if self.allows_all_origins() {
            headers.insert("Access-Control-Allow-Origin", "*");
        } else {
            headers.insert("Access-Control-Allow-Origin", origin);
            headers.insert("Vary", "Origin");
        }

        let method = request.get("access-control-request-method").unwrap_or("");
        if !self.allow_methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return Err(format!("Invalid method {method}"));
        }
        headers.insert("Access-Control-Allow-Methods", self.allow_methods.join(", "));
        headers.insert("Access-Control-Max-Age", self.max_age.to_string());

        let requested = request.get("access-control-request-headers");
        match &self.allow_headers {
            None => {
                if let Some(requested) = requested {
                    headers.insert("Access-Control-Allow-Headers", requested);
                }
            }
            Some(allowed) => {
                for name in requested.into_iter().flat_map(|r| r.split(',')).map(str::trim) {
                    if !name.is_empty() && !allowed.iter().any(|a| a.eq_ignore_ascii_case(name)) {
                        return Err(format!("Invalid header {name}"));
                    }
                }
                headers.insert("Access-Control-Allow-Headers", allowed.join(", "));
            }
        }

        if self.allow_credentials {
            headers.insert("Access-Control-Allow-Credentials", "true");
        }
        Ok(headers)
    }

    // Headers for a non-preflight response, decided before the handler runs.
    fn decoration(&self, origin: &str, has_cookie: bool) -> Decoration {
        let mut set = Vec::new();
        let mut vary = false;

        if self.allows_all_origins() {
            let value = if has_cookie { origin } else { "*" };
            set.push(("Access-Control-Allow-Origin", value.to_owned()));
        } else if self.is_allowed_origin(origin) {
            set.push(("Access-Control-Allow-Origin", origin.to_owned()));
            vary = true;
        }
        if self.allow_credentials {
            set.push(("Access-Control-Allow-Credentials", "true".to_owned()));
        }
        if !self.expose_headers.is_empty() {
            set.push(("Access-Control-Expose-Headers", self.expose_headers.join(", ")));
        }

        Decoration { set, vary }
    }
}

struct Decoration {
    set: Vec<(&'static str, String)>,
    vary: bool,
}

impl Decoration {
    fn apply(self, response: &mut Response) {
        let headers = response.headers_mut();
        for (name, value) in self.set {
            headers.set(name, value);
        }
        if self.vary {
            match headers.get("vary").map(str::to_owned) {
                Some(existing) => headers.set("Vary", format!("{existing}, Origin")),
                None => headers.insert("Vary", "Origin"),
            }
        }
    }
}

impl Middleware for CorsMiddleware {
    fn handle(
        &self,
        ctx: Context,
        next: Next,
        shutdown: Shutdown,
    ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let request = ctx.request();
        let Some(origin) = request.headers().get("origin").map(str::to_owned) else {
            debug!("no Origin header, skipping CORS");
            return next.run(ctx, shutdown);
        };

        if request.method() == &Method::Options
            && request.headers().contains("access-control-request-method")
        {
            let response = self.preflight(&origin, request.headers());
            return Box::pin(async move { response });
        }

        let decoration = self.decoration(&origin, request.headers().contains("cookie"));
        Box::pin(async move {
            let mut response = next.run(ctx, shutdown).await;
            decoration.apply(&mut response);
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        Request,
        context::{RouteParams, ServerState},
        middleware::{compose_fn, from_middleware},
    };

    struct Outcome {
        response: Response,
        handler_calls: usize,
    }

    async fn send(cors: CorsMiddleware, method: &str, headers: &[(&str, &str)]) -> Outcome {
        let mut raw = format!("{method} /api HTTP/1.1\r\n");
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        let ctx = Context::new(req, RouteParams::new(), ServerState::new());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let pipeline = compose_fn(&[from_middleware(Arc::new(cors))], move |_ctx: Context, _: Shutdown| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Response::text("handled").header("Vary", "Accept") }
        });

        let response = pipeline(ctx, Shutdown::never()).await;
        Outcome {
            response,
            handler_calls: calls.load(Ordering::SeqCst),
        }
    }

    #[tokio::test]
    async fn no_origin_passes_through() {
        let out = send(CorsMiddleware::new(), "GET", &[]).await;
        assert_eq!(out.handler_calls, 1);
        assert!(out.response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_actual_request() {
        let out = send(CorsMiddleware::new(), "GET", &[("Origin", "https://a.test")]).await;
        assert_eq!(out.handler_calls, 1);
        assert_eq!(out.response.headers().get("access-control-allow-origin"), Some("*"));
        assert_eq!(out.response.headers().get("vary"), Some("Accept"));
    }

    #[tokio::test]
    async fn wildcard_with_cookie_echoes_origin() {
        let out = send(
            CorsMiddleware::new(),
            "GET",
            &[("Origin", "https://a.test"), ("Cookie", "sid=1")],
        )
        .await;
        assert_eq!(
            out.response.headers().get("access-control-allow-origin"),
            Some("https://a.test")
        );
    }

    #[tokio::test]
    async fn specific_origin_is_echoed_with_vary() {
        let cors = CorsMiddleware::new().allow_origin("https://a.test");
        let out = send(cors, "POST", &[("Origin", "https://a.test")]).await;
        assert_eq!(
            out.response.headers().get("access-control-allow-origin"),
            Some("https://a.test")
        );
        assert_eq!(out.response.headers().get("vary"), Some("Accept, Origin"));
    }

    #[tokio::test]
    async fn disallowed_origin_gets_no_allow_origin() {
        let cors = CorsMiddleware::new().allow_origin("https://a.test");
        let out = send(cors, "GET", &[("Origin", "https://evil.test")]).await;
        assert_eq!(out.handler_calls, 1);
        assert!(out.response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn preflight_is_answered_without_handler() {
        let out = send(
            CorsMiddleware::new(),
            "OPTIONS",
            &[
                ("Origin", "https://a.test"),
                ("Access-Control-Request-Method", "PUT"),
                ("Access-Control-Request-Headers", "X-Trace, Content-Type"),
            ],
        )
        .await;
        let headers = out.response.headers();
        assert_eq!(out.handler_calls, 0);
        assert_eq!(out.response.status(), StatusCode::Ok);
        assert_eq!(headers.get("access-control-allow-origin"), Some("*"));
        assert_eq!(
            headers.get("access-control-allow-methods"),
            Some("DELETE, GET, OPTIONS, PATCH, POST, PUT")
        );
        assert_eq!(headers.get("access-control-allow-headers"), Some("X-Trace, Content-Type"));
        assert_eq!(headers.get("access-control-max-age"), Some("600"));
    }

    #[tokio::test]
    async fn plain_options_reaches_handler() {
        let out = send(CorsMiddleware::new(), "OPTIONS", &[("Origin", "https://a.test")]).await;
        assert_eq!(out.handler_calls, 1);
    }

    #[tokio::test]
    async fn preflight_rejections() {
        let cors = CorsMiddleware::new()
            .allow_origin("https://a.test")
            .allow_methods(["get"])
            .allow_header("Content-Type");

        let bad_origin = send(
            cors.clone(),
            "OPTIONS",
            &[("Origin", "https://b.test"), ("Access-Control-Request-Method", "GET")],
        )
        .await;
        assert_eq!(bad_origin.response.status(), StatusCode::BadRequest);
        assert_eq!(bad_origin.response.bytes(), Some(&b"Invalid origin https://b.test"[..]));

        let bad_method = send(
            cors.clone(),
            "OPTIONS",
            &[("Origin", "https://a.test"), ("Access-Control-Request-Method", "DELETE")],
        )
        .await;
        assert_eq!(bad_method.response.bytes(), Some(&b"Invalid method DELETE"[..]));

        let bad_header = send(
            cors,
            "OPTIONS",
            &[
                ("Origin", "https://a.test"),
                ("Access-Control-Request-Method", "GET"),
                ("Access-Control-Request-Headers", "content-type, X-Secret"),
            ],
        )
        .await;
        assert_eq!(bad_header.response.bytes(), Some(&b"Invalid header X-Secret"[..]));
        assert_eq!(bad_header.handler_calls, 0);
    }

    #[tokio::test]
    async fn regex_origin_and_credentials() {
        let cors = CorsMiddleware::new()
            .allow_origin_regex(r"^https://[a-z]+\.example\.com$")
            .unwrap()
            .allow_credentials(true)
            .expose_header("X-Total");

        let out = send(
            cors.clone(),
            "OPTIONS",
            &[
                ("Origin", "https://shop.example.com"),
                ("Access-Control-Request-Method", "GET"),
            ],
        )
        .await;
        let headers = out.response.headers();
        assert_eq!(out.response.status(), StatusCode::Ok);
        assert_eq!(headers.get("access-control-allow-origin"), Some("https://shop.example.com"));
        assert_eq!(headers.get("access-control-allow-credentials"), Some("true"));

        let out = send(cors, "GET", &[("Origin", "https://shop.example.com")]).await;
        assert_eq!(out.response.headers().get("access-control-expose-headers"), Some("X-Total"));
    }

    #[test]
    fn invalid_regex_is_an_error() {
        assert!(CorsMiddleware::new().allow_origin_regex("(").is_err());
    }
}
