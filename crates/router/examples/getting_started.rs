//! Getting Started Example
//!
//! Demonstrates the basic usage of the router, including:
//! - Route registration with wildcard parameters
//! - Global pre/post middlewares and the early-abort convention
//! - JSON responses and the pooled request context
//!
//! To run this example:
//! ```bash
//! cargo run --example getting_started
//! ```
//!
//! Then:
//! ```bash
//! curl http://127.0.0.1:8080/api/products/42
//! curl -X POST -d 'hello' http://127.0.0.1:8080/api/echo
//! curl http://127.0.0.1:8080/missing
//! ```

use std::sync::Arc;

use arbor_router::{handler_fn, matchers, Context, Middleware, Router};
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Serialize)]
struct Product {
    id: i64,
    name: String,
}

/// Writes the wildcard parameter back as JSON.
///
/// ```bash
/// curl http://127.0.0.1:8080/api/products/42
/// ```
async fn get_product(ctx: &mut Context) {
    match ctx.param_i64("id") {
        Ok(id) => {
            let product = Product { id, name: format!("product-{id}") };
            let _ = ctx.send_json(&product);
        }
        Err(_) => ctx.send_not_found(),
    }
}

/// Echoes the request body read ahead by the body-reader middleware.
///
/// ```bash
/// curl -X POST -d 'hello' http://127.0.0.1:8080/api/echo
/// ```
async fn echo(ctx: &mut Context) {
    let body = ctx.body().cloned().unwrap_or_default();
    ctx.write(&body);
}

fn auth_middleware() -> Middleware {
    Middleware::pre(Arc::new(|ctx: &mut Context| -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // A missing token aborts the chain; the post phase still
            // flushes the 401.
            if ctx.header("x-api-token").is_none() {
                ctx.send_unauthorized();
                return;
            }
            ctx.next();
        })
    }))
    .matcher(matchers::path_prefix("/api/private"))
}

async fn private_area(ctx: &mut Context) {
    ctx.write(b"members only\r\n");
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut builder = Router::builder().address("127.0.0.1:8080").server_name("getting-started");

    builder.get("/api/products/{id}", handler_fn(get_product)).expect("route registration failed");
    builder.post("/api/echo", handler_fn(echo)).expect("route registration failed");
    builder.get("/api/private/area", handler_fn(private_area)).expect("route registration failed");

    builder.register_middleware(auth_middleware());

    if let Err(e) = builder.build().listen().await {
        eprintln!("server error: {e}");
    }
}
