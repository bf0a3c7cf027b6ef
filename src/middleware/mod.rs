//! Middleware pipeline: composable before/after request handler logic.
//!
//! Middleware wraps the matched route handler in an onion: the first
//! registered layer is the outermost one, so it runs first on the way in and
//! last on the way out. Each layer may:
//!
//! - **pass through** by calling [`Next::run`],
//! - **short-circuit** by returning its own [`Response`] without calling `next`,
//! - **rewrite the request** before calling `next`, or the response after it.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by struct-style middleware.
//! - [`Next`]: the downstream continuation handed to each layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] / [`from_fn`]: build a [`MiddlewareHandler`].
//! - [`compose`]: fold a middleware list around a terminal [`Handler`].
//!
//! Built-in layers: [`LoggerMiddleware`] and [`CompressionMiddleware`].

mod compression;
mod logger;

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    Response,
    context::Context,
    router::{Handler, IntoHandler, into_handler},
    server::Shutdown,
};

pub use compression::CompressionMiddleware;
pub use logger::LoggerMiddleware;

/// The downstream continuation for a single middleware invocation.
///
/// `Next` wraps everything inside the current layer: the remaining middleware
/// and, at the centre, the route handler. It is cheap to clone, and [`run`](Self::run)
/// may be called zero or more times, e.g. a retry layer can invoke it twice.
///
/// # Examples
///
/// ```rust,no_run
/// use std::pin::Pin;
/// use switchyard::{Response, context::Context, middleware::{Middleware, Next}, server::Shutdown};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(
///         &self,
///         ctx: Context,
///         next: Next,
///         shutdown: Shutdown,
///     ) -> Pin<Box<dyn std::future::Future<Output = Response> + Send>> {
///         next.run(ctx, shutdown)
///     }
/// }
/// ```
#[derive(Clone)]
pub struct Next {
    inner: Handler,
}

impl Next {
    /// Creates a continuation that forwards to `inner`.
    ///
    /// # Arguments
    ///
    /// - `inner`: the composed remainder of the pipeline.
    pub fn new(inner: Handler) -> Self {
        Self { inner }
    }

    /// Invokes the downstream pipeline and returns its response future.
    ///
    /// The returned future does not borrow `self`, so a layer may drop `next`
    /// before awaiting it, or call `run` again for another attempt.
    ///
    /// # Arguments
    ///
    /// - `ctx`: the per-request [`Context`], possibly modified by this layer.
    /// - `shutdown`: the server's cancellation signal, passed along unchanged.
    pub fn run(&self, ctx: Context, shutdown: Shutdown) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        (self.inner)(ctx, shutdown)
    }
}

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the server's middleware list is stored as a
/// `MiddlewareHandler`. Construct one with [`from_middleware`], [`from_fn`],
/// or by wrapping a closure directly:
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::{context::Context, middleware::{MiddlewareHandler, Next}, server::Shutdown};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next, shutdown: Shutdown| {
///     next.run(ctx, shutdown)
/// });
/// ```
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next, Shutdown) -> Pin<Box<dyn Future<Output = Response> + Send>>
        + Send
        + Sync
        + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next, shutdown: Shutdown| middleware.handle(ctx, next, shutdown))
}

/// Converts an async closure into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::{context::Context, middleware::{Next, from_fn}, server::Shutdown};
///
/// let timing = from_fn(|ctx: Context, next: Next, shutdown: Shutdown| async move {
///     let started = std::time::Instant::now();
///     let response = next.run(ctx, shutdown).await;
///     response.header("X-Elapsed-Micros", started.elapsed().as_micros().to_string())
/// });
/// ```
pub fn from_fn<T, F>(f: T) -> MiddlewareHandler
where
    T: Fn(Context, Next, Shutdown) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx: Context, next: Next, shutdown: Shutdown| Box::pin(f(ctx, next, shutdown)))
}

/// Wraps `handler` in `middlewares`, producing one callable pipeline.
///
/// The list is folded in reverse, so `middlewares[0]` becomes the outermost
/// layer. Composition is pure: it allocates the layer closures but runs
/// nothing, and an empty list returns `handler` itself.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::middleware::{LoggerMiddleware, compose, from_middleware};
/// use switchyard::router::not_found_handler;
///
/// let pipeline = compose(&[from_middleware(Arc::new(LoggerMiddleware))], not_found_handler());
/// ```
pub fn compose(middlewares: &[MiddlewareHandler], handler: Handler) -> Handler {
    middlewares.iter().rev().fold(handler, |inner, layer| {
        let layer = Arc::clone(layer);
        let next = Next::new(inner);
        let wrapped: Handler =
            Arc::new(move |ctx: Context, shutdown: Shutdown| layer(ctx, next.clone(), shutdown));
        wrapped
    })
}

/// Convenience for composing around an un-erased handler function.
pub fn compose_fn(middlewares: &[MiddlewareHandler], handler: impl IntoHandler) -> Handler {
    compose(middlewares, into_handler(handler))
}

/// The core trait for struct-style middleware.
///
/// Implementors receive a [`Context`], the [`Next`] continuation and the
/// server's [`Shutdown`] signal.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
/// - Implementations **should not** hold locks on shared state across an
///   `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next layer.
    ///
    /// # Arguments
    ///
    /// - `ctx`: the per-request [`Context`].
    /// - `next`: the rest of the pipeline; call [`Next::run`] to forward the request.
    /// - `shutdown`: the cancellation signal; long-running layers may watch it.
    ///
    /// # Returns
    ///
    /// A [`Response`], either produced by this middleware directly (short-circuit)
    /// or forwarded from a downstream handler.
    fn handle(
        &self,
        ctx: Context,
        next: Next,
        shutdown: Shutdown,
    ) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Request, StatusCode, context::{RouteParams, ServerState}};
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn ctx() -> Context {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
        Context::new(req, RouteParams::new(), ServerState::new())
    }

    fn tracing_layer(name: &'static str, trace: Trace) -> MiddlewareHandler {
        from_fn(move |ctx: Context, next: Next, shutdown: Shutdown| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().unwrap().push(format!("{name}-enter"));
                let response = next.run(ctx, shutdown).await;
                trace.lock().unwrap().push(format!("{name}-exit"));
                response
            }
        })
    }

    fn recording_handler(trace: Trace) -> Handler {
        into_handler(move |_ctx: Context, _: Shutdown| {
            let trace = Arc::clone(&trace);
            async move {
                trace.lock().unwrap().push("H".to_owned());
                Response::new(StatusCode::Ok)
            }
        })
    }

    #[tokio::test]
    async fn first_registered_is_outermost() {
        let trace: Trace = Arc::default();
        let pipeline = compose(
            &[
                tracing_layer("M1", Arc::clone(&trace)),
                tracing_layer("M2", Arc::clone(&trace)),
            ],
            recording_handler(Arc::clone(&trace)),
        );

        let response = pipeline(ctx(), Shutdown::never()).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(
            *trace.lock().unwrap(),
            ["M1-enter", "M2-enter", "H", "M2-exit", "M1-exit"]
        );
    }

    #[tokio::test]
    async fn empty_chain_is_the_handler() {
        let trace: Trace = Arc::default();
        let pipeline = compose(&[], recording_handler(Arc::clone(&trace)));
        pipeline(ctx(), Shutdown::never()).await;
        assert_eq!(*trace.lock().unwrap(), ["H"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_layers() {
        let trace: Trace = Arc::default();
        let deny = from_fn(|_ctx: Context, _next: Next, _: Shutdown| async {
            Response::new(StatusCode::Forbidden)
        });
        let pipeline = compose(
            &[tracing_layer("M1", Arc::clone(&trace)), deny, tracing_layer("M3", Arc::clone(&trace))],
            recording_handler(Arc::clone(&trace)),
        );

        let response = pipeline(ctx(), Shutdown::never()).await;
        assert_eq!(response.status(), StatusCode::Forbidden);
        assert_eq!(*trace.lock().unwrap(), ["M1-enter", "M1-exit"]);
    }

    #[tokio::test]
    async fn layer_may_rewrite_request_and_response() {
        let tag = from_fn(|mut ctx: Context, next: Next, shutdown: Shutdown| async move {
            ctx.request_mut().headers_mut().insert("X-Tag", "inbound");
            next.run(ctx, shutdown).await.header("X-Layer", "outbound")
        });
        let handler = into_handler(|ctx: Context, _: Shutdown| async move {
            Response::text(ctx.request().headers().get("x-tag").unwrap_or("missing").to_owned())
        });

        let response = compose(&[tag], handler)(ctx(), Shutdown::never()).await;
        assert_eq!(response.bytes(), Some(&b"inbound"[..]));
        assert_eq!(response.headers().get("x-layer"), Some("outbound"));
    }

    #[tokio::test]
    async fn continuation_may_run_twice() {
        let trace: Trace = Arc::default();
        let twice = from_fn(|ctx: Context, next: Next, shutdown: Shutdown| async move {
            let retry_ctx = Context::new(ctx.request().clone(), ctx.params().clone(), ctx.state().clone());
            let _ = next.run(ctx, shutdown.clone()).await;
            next.run(retry_ctx, shutdown).await
        });
        compose(&[twice], recording_handler(Arc::clone(&trace)))(ctx(), Shutdown::never()).await;
        assert_eq!(*trace.lock().unwrap(), ["H", "H"]);
    }

    #[tokio::test]
    async fn struct_middleware_via_trait() {
        struct Unavailable;
        impl Middleware for Unavailable {
            fn handle(
                &self,
                _ctx: Context,
                _next: Next,
                _shutdown: Shutdown,
            ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
                Box::pin(async { Response::new(StatusCode::ServiceUnavailable) })
            }
        }

        let pipeline = compose_fn(&[from_middleware(Arc::new(Unavailable))], |_ctx: Context, _: Shutdown| async {
            Response::new(StatusCode::Ok)
        });
        assert_eq!(pipeline(ctx(), Shutdown::never()).await.status(), StatusCode::ServiceUnavailable);
    }
}
