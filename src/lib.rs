//! # switchyard
//!
//! Typed path-template routing, onion-model middleware and a draining async
//! dispatch loop, on top of a pluggable connection [`Listener`](listener::Listener).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchyard::{Context, Response, Server};
//! use switchyard::server::{Shutdown, shutdown_on_ctrl_c};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("127.0.0.1:8080");
//!     server.add_route("/users/{id:int}", |ctx: Context, _: Shutdown| async move {
//!         let id = ctx.params().get_int("id").unwrap_or_default();
//!         Response::text(format!("user #{id}"))
//!     }, &["GET"])?;
//!
//!     server.run(shutdown_on_ctrl_c()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Path templates
//!
//! | Segment                   | Matches                                  |
//! |---------------------------|------------------------------------------|
//! | `users`                   | the literal text                         |
//! | `{name}`                  | any single segment, as a string          |
//! | `{id:int}`                | a 64-bit signed integer                  |
//! | `{x:double}`              | a floating-point number                  |
//! | `{day:datetime}`          | an ISO-8601 date/time                    |
//! | `{day:datetime:yyyyMMdd}` | a date/time in the given format          |
//! | `{rest:path}`             | the remaining path, slashes included     |
//!
//! Routes are tried in registration order; the first match wins. A miss is an
//! empty `404`.

pub mod config;
pub mod context;
pub mod http;
pub mod listener;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use context::{Context, ParamValue, RouteParams, ServerState};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use middleware::{Middleware, MiddlewareHandler, Next};
pub use router::{Handler, PathTemplate, PatternError, Router};
pub use server::{Lifecycle, Server, ServerError, ServerHandle, Shutdown};
