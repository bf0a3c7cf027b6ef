//! The dispatch loop: startup hooks, accept/dispatch with graceful drain,
//! shutdown hooks.
//!
//! [`Server::run`] walks the [`Lifecycle`]:
//!
//! 1. **Starting**: startup hooks run in registration order; the first
//!    failure aborts with [`ServerError::Startup`] before the listener opens.
//! 2. **Listening**: the listener starts and the loop waits on whichever
//!    comes first: the [`Shutdown`] signal, a finished request task, or the
//!    next accepted connection. Each connection is routed and wrapped in the
//!    current middleware synchronously, then handled on its own task.
//! 3. **Draining**: once the signal is raised the listener stops and nothing
//!    new is accepted, but in-flight requests run to completion.
//! 4. **Stopped**: shutdown hooks run in registration order. Every hook runs;
//!    failures are collected into [`ServerError::ShutdownHooks`].
//!
//! A failing `accept` is fatal: in-flight requests are aborted, no shutdown
//! hooks run, and the server ends in [`Lifecycle::Faulted`].
//!
//! A panicking handler or middleware only affects its own request, which is
//! answered with a generic `500`.

mod lifecycle;
mod shutdown;

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    Method, Response,
    config::ServerConfig,
    context::{Context, ServerState},
    listener::{Connection, Listener, ListenerError, ResponseSink, TcpListener},
    middleware::{MiddlewareHandler, compose},
    router::{Handler, IntoHandler, PatternError, Router},
};

pub use lifecycle::Lifecycle;
pub use shutdown::{Shutdown, ShutdownTrigger, shutdown_on_ctrl_c};

/// Error type for hooks and other user-supplied fallible code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A startup hook, run before the listener opens.
pub type StartupHook = Arc<dyn Fn(ServerState, Shutdown) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// A shutdown hook, run after the last in-flight request finished.
pub type ShutdownHook = Arc<dyn Fn(ServerState) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Errors returned by [`Server::run`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("startup hook #{index} failed: {source}")]
    Startup {
        index: usize,
        #[source]
        source: BoxError,
    },

    #[error("listener failed to start: {0}")]
    Listener(#[source] ListenerError),

    #[error("accepting connections failed: {0}")]
    Accept(#[source] ListenerError),

    #[error("{} shutdown hook(s) failed", .0.len())]
    ShutdownHooks(Vec<BoxError>),
}

/// A failure in one request's handling, after its response was produced.
///
/// Reported by the dispatch loop and never propagated.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to write response for {method} {path}: {source}")]
    Write {
        method: Method,
        path: String,
        #[source]
        source: io::Error,
    },
}

// State shared between the dispatch loop and every `ServerHandle`.
struct Shared {
    router: Router,
    middleware: Mutex<Vec<MiddlewareHandler>>,
    addresses: Mutex<Vec<String>>,
}

impl Shared {
    fn middleware(&self) -> MutexGuard<'_, Vec<MiddlewareHandler>> {
        self.middleware.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn addresses(&self) -> MutexGuard<'_, Vec<String>> {
        self.addresses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Route lookup plus composition against the middleware registered right now.
    fn pipeline(&self, method: &Method, path: &str) -> (Handler, crate::context::RouteParams) {
        let (handler, params) = self.router.find_handler(path, method);
        let layers = self.middleware().clone();
        (compose(&layers, handler), params)
    }
}

/// A cloneable handle for reconfiguring a server, including while it runs.
///
/// Routes and middleware added through a handle apply to requests accepted
/// afterwards; requests already dispatched keep the pipeline they were built
/// with.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// See [`Router::add_route`].
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `pattern` does not compile.
    pub fn add_route(
        &self,
        pattern: &str,
        handler: impl IntoHandler,
        methods: &[&str],
    ) -> Result<(), PatternError> {
        self.shared.router.add_route(pattern, handler, methods)
    }

    /// Appends `middleware`; it becomes the innermost layer.
    pub fn add_middleware(&self, middleware: MiddlewareHandler) {
        self.shared.middleware().push(middleware);
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    /// The listener's bound addresses, empty until the server is listening.
    pub fn addresses(&self) -> Vec<String> {
        self.shared.addresses().clone()
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("routes", &self.shared.router.len())
            .field("middleware", &self.shared.middleware().len())
            .finish()
    }
}

/// An HTTP server: a [`Router`], a middleware list, lifecycle hooks and a
/// [`Listener`], driven by [`run`](Self::run).
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use switchyard::{Context, Response, Server};
/// use switchyard::middleware::{LoggerMiddleware, from_middleware};
/// use switchyard::server::{Shutdown, shutdown_on_ctrl_c};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080");
///     server.add_middleware(from_middleware(Arc::new(LoggerMiddleware)));
///     server.add_route("/hello/{name}", |ctx: Context, _: Shutdown| async move {
///         let name = ctx.params().get_str("name").unwrap_or("world").to_owned();
///         Response::text(format!("Hello, {name}!"))
///     }, &[])?;
///
///     server.run(shutdown_on_ctrl_c()).await?;
///     Ok(())
/// }
/// ```
pub struct Server<L> {
    listener: L,
    shared: Arc<Shared>,
    state: ServerState,
    startup_hooks: Vec<StartupHook>,
    shutdown_hooks: Vec<ShutdownHook>,
    lifecycle: watch::Sender<Lifecycle>,
}

impl Server<TcpListener> {
    /// A TCP server for a single address, with a case-sensitive router.
    pub fn bind(address: impl Into<String>) -> Self {
        Self::new(TcpListener::bind(address))
    }

    /// A TCP server built from `config`.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut listener = TcpListener::new()
            .max_request_size(config.max_request_size)
            .read_timeout(config.read_timeout());
        for address in &config.bind {
            listener.add_address(address);
        }
        Self::with_router(listener, Router::new().ignore_case(config.ignore_case))
    }
}

impl<L: Listener> Server<L> {
    /// A server over `listener` with an empty, case-sensitive router.
    pub fn new(listener: L) -> Self {
        Self::with_router(listener, Router::new())
    }

    /// A server over `listener` using a preconfigured `router`.
    pub fn with_router(listener: L, router: Router) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Created);
        Self {
            listener,
            shared: Arc::new(Shared {
                router,
                middleware: Mutex::new(Vec::new()),
                addresses: Mutex::new(Vec::new()),
            }),
            state: ServerState::new(),
            startup_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
            lifecycle,
        }
    }

    /// Registers a route. See [`Router::add_route`].
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `pattern` does not compile.
    pub fn add_route(
        &self,
        pattern: &str,
        handler: impl IntoHandler,
        methods: &[&str],
    ) -> Result<(), PatternError> {
        self.shared.router.add_route(pattern, handler, methods)
    }

    /// Appends `middleware`. The first one added is the outermost layer.
    pub fn add_middleware(&self, middleware: MiddlewareHandler) {
        self.shared.middleware().push(middleware);
    }

    /// Registers a hook to run, in order, before the listener opens.
    pub fn add_startup_hook<F, Fut>(&mut self, hook: F)
    where
        F: Fn(ServerState, Shutdown) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.startup_hooks
            .push(Arc::new(move |state, shutdown| hook(state, shutdown).boxed()));
    }

    /// Registers a hook to run, in order, after the server drained.
    pub fn add_shutdown_hook<F, Fut>(&mut self, hook: F)
    where
        F: Fn(ServerState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.shutdown_hooks
            .push(Arc::new(move |state| hook(state).boxed()));
    }

    /// Adds a bind address to the listener. Only effective before `run`.
    pub fn add_address(&mut self, address: &str) {
        self.listener.add_address(address);
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    /// The server-wide state handed to every request and hook.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    /// Subscribes to lifecycle transitions.
    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// A handle for adding routes and middleware while the server runs.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn transition(&self, next: Lifecycle) {
        let previous = self.lifecycle.send_replace(next);
        debug!(from = %previous, to = %next, "lifecycle transition");
    }

    /// Runs the server until `shutdown` is raised and every in-flight request
    /// has completed.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Startup`]: a startup hook failed; the listener never opened.
    /// - [`ServerError::Listener`]: the listener failed to start.
    /// - [`ServerError::Accept`]: `accept` failed; in-flight requests were aborted.
    /// - [`ServerError::ShutdownHooks`]: the server drained, but at least one
    ///   shutdown hook failed.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<(), ServerError> {
        self.transition(Lifecycle::Starting);

        for (index, hook) in self.startup_hooks.iter().enumerate() {
            if let Err(source) = hook(self.state.clone(), shutdown.clone()).await {
                error!(index, error = %source, "startup hook failed");
                self.transition(Lifecycle::Faulted);
                return Err(ServerError::Startup { index, source });
            }
        }

        if let Err(e) = self.listener.start().await {
            error!(error = %e, "listener failed to start");
            self.transition(Lifecycle::Faulted);
            return Err(ServerError::Listener(e));
        }

        let addresses = self.listener.addresses();
        info!(addresses = ?addresses, "server listening");
        *self.shared.addresses() = addresses;
        self.transition(Lifecycle::Listening);

        if let Err(e) = self.dispatch(&shutdown).await {
            error!(error = %e, "listener fault, aborting in-flight requests");
            self.listener.stop().await;
            self.transition(Lifecycle::Faulted);
            return Err(ServerError::Accept(e));
        }

        let mut failures = Vec::new();
        for (index, hook) in self.shutdown_hooks.iter().enumerate() {
            if let Err(e) = hook(self.state.clone()).await {
                error!(index, error = %e, "shutdown hook failed");
                failures.push(e);
            }
        }

        self.transition(Lifecycle::Stopped);
        info!("server stopped");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServerError::ShutdownHooks(failures))
        }
    }

    // Returns once shutdown was observed and every request task finished.
    async fn dispatch(&mut self, shutdown: &Shutdown) -> Result<(), ListenerError> {
        let mut in_flight: JoinSet<Result<(), DispatchError>> = JoinSet::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled(), if !cancelled => {
                    cancelled = true;
                    info!(in_flight = in_flight.len(), "shutdown requested, draining");
                    self.listener.stop().await;
                    self.transition(Lifecycle::Draining);
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    observe(joined);
                }

                accepted = self.listener.accept(), if !cancelled => {
                    let connection = match accepted {
                        Ok(connection) => connection,
                        Err(e) => {
                            in_flight.abort_all();
                            return Err(e);
                        }
                    };
                    self.spawn_request(&mut in_flight, connection, shutdown);
                }

                else => break,
            }
        }

        Ok(())
    }

    fn spawn_request(
        &self,
        in_flight: &mut JoinSet<Result<(), DispatchError>>,
        connection: Connection<L::Sink>,
        shutdown: &Shutdown,
    ) {
        let Connection { request, peer, sink } = connection;
        debug!(
            peer = ?peer,
            method = %request.method(),
            path = request.path(),
            "dispatching request"
        );

        let (pipeline, params) = self.shared.pipeline(request.method(), request.path());
        let ctx = Context::new(request, params, self.state.clone());
        in_flight.spawn(handle_request(pipeline, ctx, sink, shutdown.clone()));
    }
}

/// Runs one request through its pipeline and writes the response.
///
/// A panic anywhere in the pipeline becomes a generic `500`. Replies to
/// `HEAD` carry the headers of the handler's response but no body.
async fn handle_request<S: ResponseSink>(
    pipeline: Handler,
    ctx: Context,
    sink: S,
    shutdown: Shutdown,
) -> Result<(), DispatchError> {
    let method = ctx.request().method().clone();
    let path = ctx.request().path().to_owned();

    let response = match AssertUnwindSafe(async move { pipeline(ctx, shutdown).await })
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(panic) => {
            error!(%method, path, panic = panic_message(panic.as_ref()), "handler panicked");
            Response::internal_error()
        }
    };
    let response = if method == Method::Head {
        response.omit_body()
    } else {
        response
    };

    sink.send(response)
        .await
        .map_err(|source| DispatchError::Write { method, path, source })
}

fn observe(joined: Result<Result<(), DispatchError>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "request failed"),
        Err(e) if e.is_panic() => error!(error = %e, "request task panicked"),
        Err(e) => debug!(error = %e, "request task cancelled"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
