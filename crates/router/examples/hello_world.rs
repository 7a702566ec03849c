//! The smallest possible server.
//!
//! ```bash
//! cargo run --example hello_world
//! curl http://127.0.0.1:8080/
//! ```

use arbor_router::{handler_fn, Context, Router};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

async fn hello_world(ctx: &mut Context) {
    ctx.write(b"hello world\r\n");
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut builder = Router::builder().address("127.0.0.1:8080");
    builder.get("/", handler_fn(hello_world)).expect("route registration failed");

    if let Err(e) = builder.build().listen().await {
        eprintln!("server error: {e}");
    }
}
