//! Request routing: map path templates and HTTP methods to handler functions.
//!
//! [`Router`] is the route table. Patterns are compiled into [`PathTemplate`]s
//! with typed variable segments:
//!
//! | Pattern                          | Example match              | Captured params                  |
//! |----------------------------------|----------------------------|----------------------------------|
//! | `/users`                         | `/users`                   | *(none)*                         |
//! | `/users/{name}`                  | `/users/ada`               | `name → String("ada")`           |
//! | `/users/{id:int}`                | `/users/42`                | `id → Int(42)`                   |
//! | `/prices/{x:double}`             | `/prices/9.5`              | `x → Double(9.5)`                |
//! | `/logs/{day:datetime:yyyyMMdd}`  | `/logs/20240131`           | `day → DateTime(2024-01-31T00:00)` |
//! | `/files/{rest:path}`             | `/files/docs/readme.txt`   | `rest → Path("docs/readme.txt")` |
//!
//! Trailing slashes are significant: `/x/` and `/x` are different routes.
//!
//! Routes are kept per method, in registration order; the first route whose
//! template matches wins. There is no specificity ranking.

mod segment;
mod template;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use crate::context::{Context, RouteParams, ServerState};
use crate::server::Shutdown;
use crate::{Method, Request, Response};

pub use template::{PathTemplate, PatternError};

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and shared across
/// threads without copying the underlying closure. A composed middleware pipeline has
/// the same type, so the dispatch loop treats both alike.
pub type Handler = Arc<
    dyn Fn(Context, Shutdown) -> Pin<Box<dyn Future<Output = Response> + Send>>
        + Send
        + Sync
        + 'static,
>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context, Shutdown) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below. The [`Shutdown`] argument lets long-running handlers notice that the server
/// is draining; ignoring it is allowed, but delays shutdown until the handler returns.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler, boxing the returned future.
    fn call(&self, ctx: Context, shutdown: Shutdown) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context, Shutdown) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context, shutdown: Shutdown) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx, shutdown))
    }
}

/// Erases the concrete handler type.
pub fn into_handler(handler: impl IntoHandler) -> Handler {
    Arc::new(move |ctx, shutdown| handler.call(ctx, shutdown))
}

/// The handler returned on a route miss; always answers `404 Not Found`.
pub fn not_found_handler() -> Handler {
    Arc::new(|_ctx, _shutdown| Box::pin(async { Response::not_found() }))
}

// A compiled template bound to its handler. Shared between the per-method lists
// when a route is registered for several methods.
struct Route {
    template: PathTemplate,
    handler: Handler,
}

/// HTTP route table.
///
/// Registration and lookup may happen concurrently (e.g. adding routes while
/// the server is running): both take the same lock, so a lookup never observes
/// a half-registered route.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::{Context, Response, Router, Shutdown, StatusCode};
///
/// let router = Router::new();
///
/// router.get("/ping", |_: Context, _: Shutdown| async { Response::new(StatusCode::Ok) }).unwrap();
///
/// router
///     .add_route("/users/{id:int}", |ctx: Context, _: Shutdown| async move {
///         let id = ctx.params().get_int("id").unwrap_or_default();
///         Response::text(format!("user {id}"))
///     }, &["GET"])
///     .unwrap();
/// ```
pub struct Router {
    routes: Mutex<HashMap<Method, Vec<Arc<Route>>>>,
    ignore_case: bool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new, empty, case-sensitive `Router`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use switchyard::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            ignore_case: false,
        }
    }

    /// Sets whether literal segments compare case-insensitively.
    #[must_use]
    pub fn ignore_case(mut self, ignore_case: bool) -> Self {
        self.ignore_case = ignore_case;
        self
    }

    /// Returns `true` if literal segments compare case-insensitively.
    pub fn is_case_insensitive(&self) -> bool {
        self.ignore_case
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Method, Vec<Arc<Route>>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `pattern` under each of `methods`.
    ///
    /// Method names are normalized to uppercase. An empty `methods` slice
    /// registers the route for `GET` only.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `pattern` does not compile; already
    /// registered routes are unaffected.
    pub fn add_route(
        &self,
        pattern: &str,
        handler: impl IntoHandler,
        methods: &[&str],
    ) -> Result<(), PatternError> {
        let methods: Vec<Method> = if methods.is_empty() {
            vec![Method::Get]
        } else {
            methods.iter().map(|m| Method::normalize(m)).collect()
        };
        self.insert(pattern, into_handler(handler), &methods)
    }

    // Compile first, then append under the lock.
    fn insert(&self, pattern: &str, handler: Handler, methods: &[Method]) -> Result<(), PatternError> {
        let template = PathTemplate::parse(pattern)?;
        let route = Arc::new(Route { template, handler });

        let mut table = self.table();
        for method in methods {
            table
                .entry(method.clone())
                .or_default()
                .push(Arc::clone(&route));
        }
        drop(table);

        debug!(pattern, methods = ?methods, "route registered");
        Ok(())
    }

    /// Register a handler for `GET` requests matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `pattern` does not compile.
    pub fn get(&self, pattern: &str, handler: impl IntoHandler) -> Result<(), PatternError> {
        self.insert(pattern, into_handler(handler), &[Method::Get])
    }

    /// Register a handler for `POST` requests matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `pattern` does not compile.
    pub fn post(&self, pattern: &str, handler: impl IntoHandler) -> Result<(), PatternError> {
        self.insert(pattern, into_handler(handler), &[Method::Post])
    }

    /// Register a handler for `PUT` requests matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `pattern` does not compile.
    pub fn put(&self, pattern: &str, handler: impl IntoHandler) -> Result<(), PatternError> {
        self.insert(pattern, into_handler(handler), &[Method::Put])
    }

    /// Register a handler for `DELETE` requests matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `pattern` does not compile.
    pub fn delete(&self, pattern: &str, handler: impl IntoHandler) -> Result<(), PatternError> {
        self.insert(pattern, into_handler(handler), &[Method::Delete])
    }

    /// Register a handler for `PATCH` requests matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `pattern` does not compile.
    pub fn patch(&self, pattern: &str, handler: impl IntoHandler) -> Result<(), PatternError> {
        self.insert(pattern, into_handler(handler), &[Method::Patch])
    }

    /// Register a handler for `OPTIONS` requests matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] if `pattern` does not compile.
    pub fn options(&self, pattern: &str, handler: impl IntoHandler) -> Result<(), PatternError> {
        self.insert(pattern, into_handler(handler), &[Method::Options])
    }

    /// Return the number of (method, route) bindings.
    ///
    /// A pattern registered for two methods counts twice.
    pub fn len(&self) -> usize {
        self.table().values().map(Vec::len).sum()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the handler for `method` and `path`.
    ///
    /// Scans the routes registered for `method` in registration order and
    /// returns the first match with its extracted parameters. On a miss, or
    /// for a path that is not absolute, returns [`not_found_handler`] with
    /// empty parameters. Never fails.
    pub fn find_handler(&self, path: &str, method: &Method) -> (Handler, RouteParams) {
        trace!(%method, path, "finding handler");

        let table = self.table();
        for route in table.get(method).into_iter().flatten() {
            match route.template.matches(path, self.ignore_case) {
                Ok(Some(params)) => return (Arc::clone(&route.handler), params),
                Ok(None) => {}
                Err(e) => {
                    warn!(%method, path, error = %e, "rejecting request path");
                    break;
                }
            }
        }
        drop(table);

        warn!(%method, path, "no route matched");
        (not_found_handler(), RouteParams::new())
    }

    /// Look up and run the handler for `request` directly, without middleware.
    pub async fn route(&self, request: Request, state: ServerState, shutdown: Shutdown) -> Response {
        let (handler, params) = self.find_handler(request.path(), request.method());
        handler(Context::new(request, params, state), shutdown).await
    }
}
