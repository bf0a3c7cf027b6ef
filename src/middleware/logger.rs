use std::pin::Pin;

use tokio::time::Instant;

use super::{Middleware, Next};
use crate::{Response, context::Context, server::Shutdown};

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` event after the downstream pipeline
/// completes. `LoggerMiddleware` never short-circuits.
///
/// Register it first to time the whole pipeline, including other middleware.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(
        &self,
        ctx: Context,
        next: Next,
        shutdown: Shutdown,
    ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().clone();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx, shutdown).await;

            tracing::info!(
                %method,
                path,
                status = response.status().as_u16(),
                elapsed = ?start.elapsed(),
                "request completed"
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        Request, StatusCode,
        context::{RouteParams, ServerState},
        middleware::{compose_fn, from_middleware},
    };

    #[tokio::test]
    async fn logger_passes_response_through() {
        let (req, _) = Request::parse(b"GET /logged HTTP/1.1\r\n\r\n").unwrap();
        let ctx = Context::new(req, RouteParams::new(), ServerState::new());

        let pipeline = compose_fn(&[from_middleware(Arc::new(LoggerMiddleware))], |_ctx: Context, _: Shutdown| async {
            Response::new(StatusCode::Created).body("made")
        });
        let response = pipeline(ctx, Shutdown::never()).await;

        assert_eq!(response.status(), StatusCode::Created);
        assert_eq!(response.bytes(), Some(&b"made"[..]));
    }
}
