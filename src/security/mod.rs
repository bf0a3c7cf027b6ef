//! Security middleware.
//!
//! - [`CorsMiddleware`]: Cross-Origin Resource Sharing: origin checks,
//!   preflight (`OPTIONS`) answers and `Access-Control-*` response headers.

mod middleware;

pub use middleware::CorsMiddleware;
