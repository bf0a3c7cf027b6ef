//! A small service showing routes, middleware, hooks and graceful shutdown.
//!
//! ```text
//! cargo run --example hello_world              # 127.0.0.1:8080
//! cargo run --example hello_world -- app.toml  # settings from a TOML file
//!
//! curl localhost:8080/hello/ada
//! curl localhost:8080/orders/42
//! curl localhost:8080/reports/20240131
//! curl -X POST localhost:8080/echo -d '{"message":"hi"}'
//! curl localhost:8080/wait        # returns early on Ctrl+C
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchyard::middleware::{CompressionMiddleware, LoggerMiddleware, from_fn, from_middleware};
use switchyard::security::CorsMiddleware;
use switchyard::server::{BoxError, shutdown_on_ctrl_c};
use switchyard::{Context, Next, Response, Server, ServerConfig, ServerState, Shutdown, StatusCode};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Serialize)]
struct Order {
    id: i64,
    status: &'static str,
}

#[derive(Deserialize, Serialize)]
struct Echo {
    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchyard=debug,hello_world=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let mut server = Server::from_config(&config);

    server.add_startup_hook(|state: ServerState, _| async move {
        state.insert("hits", AtomicU64::new(0));
        tracing::info!("counters ready");
        Ok::<(), BoxError>(())
    });
    server.add_shutdown_hook(|state: ServerState| async move {
        let hits = state.get::<AtomicU64>("hits").map_or(0, |h| h.load(Ordering::Relaxed));
        tracing::info!(hits, "goodbye");
        Ok::<(), BoxError>(())
    });

    server.add_middleware(from_middleware(Arc::new(LoggerMiddleware)));
    server.add_middleware(from_middleware(Arc::new(CorsMiddleware::new().max_age(3600))));
    server.add_middleware(from_middleware(Arc::new(CompressionMiddleware::new())));
    server.add_middleware(from_fn(|ctx: Context, next: Next, shutdown: Shutdown| async move {
        if let Some(hits) = ctx.state().get::<AtomicU64>("hits") {
            hits.fetch_add(1, Ordering::Relaxed);
        }
        next.run(ctx, shutdown).await
    }));

    server.add_route("/hello/{name}", |ctx: Context, _: Shutdown| async move {
        let name = ctx.params().get_str("name").unwrap_or("world").to_owned();
        Response::text(format!("Hello, {name}!"))
    }, &[])?;

    server.add_route("/orders/{id:int}", |ctx: Context, _: Shutdown| async move {
        let order = Order {
            id: ctx.params().get_int("id").unwrap_or_default(),
            status: "shipped",
        };
        Response::json(&order).unwrap_or_else(|_| Response::internal_error())
    }, &["GET"])?;

    server.add_route("/reports/{day:datetime:yyyyMMdd}", |ctx: Context, _: Shutdown| async move {
        match ctx.params().get_datetime("day") {
            Some(day) => Response::text(format!("report for {}", day.format("%A, %d %B %Y"))),
            None => Response::new(StatusCode::BadRequest),
        }
    }, &[])?;

    server.add_route("/echo", |ctx: Context, _: Shutdown| async move {
        match ctx.json::<Echo>() {
            Ok(echo) => Response::json(&echo).unwrap_or_else(|_| Response::internal_error()),
            Err(e) => Response::new(StatusCode::BadRequest).body(e.to_string()),
        }
    }, &["POST"])?;

    server.add_route("/files/{rest:path}", |ctx: Context, _: Shutdown| async move {
        Response::text(format!("would serve {}", ctx.params().get_str("rest").unwrap_or("")))
    }, &[])?;

    server.add_route("/wait", |_ctx: Context, shutdown: Shutdown| async move {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(30)) => Response::text("waited"),
            () = shutdown.cancelled() => Response::new(StatusCode::ServiceUnavailable).body("shutting down"),
        }
    }, &[])?;

    tracing::info!(routes = server.router().len(), "routes registered");
    server.run(shutdown_on_ctrl_c()).await?;
    Ok(())
}
