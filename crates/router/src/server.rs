//! The router: registration-time builder, frozen dispatch state, the
//! per-request pipeline and the listen loop.
//!
//! The lifecycle has two phases. A [`RouterBuilder`] is mutable: routes and
//! global middlewares are registered on it and configuration is applied.
//! [`RouterBuilder::build`] freezes everything into an immutable [`Router`]
//! that can be shared across connections; concurrent registration and
//! dispatch is not a supported state.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arbor_http::connection::HttpConnection;
use arbor_http::handler::{BoxWriter, Handler};
use arbor_http::protocol::body::ReqBody;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{Method, Request, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::bind::BindKey;
use crate::context::{Context, ContextConfig};
use crate::date::DateService;
use crate::error::{RouteError, ServeError};
use crate::handler::{handler_fn, run_chain, HandlerFunc};
use crate::middleware::{Middleware, MiddlewarePhase, MiddlewareRegistry};
use crate::middlewares;
use crate::route::Route;
use crate::tree::Tree;

const DEFAULT_SERVER_NAME: &str = "arbor";
const DEFAULT_ADDRESS: &str = "127.0.0.1:8000";
const DEFAULT_MAX_BODY_SIZE: u64 = 10 << 20;

/// Reads the request body ahead of the handler; `None` leaves nothing
/// bound.
pub type BodyReaderFn = Arc<dyn Fn(ReqBody) -> BoxFuture<'static, Option<Bytes>> + Send + Sync>;

/// Receives the context and the panic value recovered from a request
/// handler; expected to set a response status.
pub type PanicHandlerFunc = Arc<dyn for<'a> Fn(&'a mut Context, Box<dyn Any + Send>) -> BoxFuture<'a, ()> + Send + Sync>;

struct RouterInfo {
    server_name: String,
    address: String,
    default_status: StatusCode,
    max_body_size: u64,
    middlewares_enabled: bool,
}

/// Mutable registration-time state of a router.
pub struct RouterBuilder {
    info: RouterInfo,
    cancellation: CancellationToken,
    tree: Tree,
    middlewares: MiddlewareRegistry,
    not_found: HandlerFunc,
    options_handler: Option<HandlerFunc>,
    empty_tree_handler: Option<HandlerFunc>,
    panic_handler: Option<PanicHandlerFunc>,
    body_reader: Option<BodyReaderFn>,
}

async fn default_not_found(ctx: &mut Context) {
    ctx.send_not_found();
}

async fn noop(_: &mut Context) {}

fn default_body_reader() -> BodyReaderFn {
    Arc::new(|mut body: ReqBody| -> BoxFuture<'static, Option<Bytes>> {
        Box::pin(async move { body.collect().await.ok() })
    })
}

impl RouterBuilder {
    fn new() -> Self {
        Self {
            info: RouterInfo {
                server_name: DEFAULT_SERVER_NAME.to_string(),
                address: DEFAULT_ADDRESS.to_string(),
                default_status: StatusCode::OK,
                max_body_size: DEFAULT_MAX_BODY_SIZE,
                middlewares_enabled: true,
            },
            cancellation: CancellationToken::new(),
            tree: Tree::new(),
            middlewares: MiddlewareRegistry::default(),
            not_found: handler_fn(default_not_found),
            options_handler: None,
            empty_tree_handler: None,
            panic_handler: None,
            body_reader: Some(default_body_reader()),
        }
    }

    // ---- configuration

    /// The address the router will listen on.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.info.address = address.into();
        self
    }

    /// The name of this router instance, used in log events.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.info.server_name = name.into();
        self
    }

    /// The status flushed when no handler set one.
    pub fn default_status(mut self, status: StatusCode) -> Self {
        self.info.default_status = status;
        self
    }

    /// Maximum accepted multipart body size in bytes.
    pub fn max_body_size(mut self, size: u64) -> Self {
        self.info.max_body_size = size;
        self
    }

    /// The base cancellation token; cancelling it drains and stops
    /// [`Router::listen`].
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Turns globally registered middlewares on or off. Always-allowed
    /// middlewares run regardless.
    pub fn middlewares_enabled(mut self, enabled: bool) -> Self {
        self.info.middlewares_enabled = enabled;
        self
    }

    /// The handler that runs when no route matches.
    pub fn not_found(mut self, handler: HandlerFunc) -> Self {
        self.not_found = handler;
        self
    }

    /// The dedicated handler for OPTIONS requests.
    pub fn options_handler(mut self, handler: HandlerFunc) -> Self {
        self.options_handler = Some(handler);
        self
    }

    /// The handler serving every request while no route is registered.
    pub fn empty_tree_handler(mut self, handler: HandlerFunc) -> Self {
        self.empty_tree_handler = Some(handler);
        self
    }

    /// The handler receiving panics recovered from the pipeline.
    pub fn panic_handler(mut self, handler: PanicHandlerFunc) -> Self {
        self.panic_handler = Some(handler);
        self
    }

    /// Replaces the built-in body reader middleware's read function.
    pub fn body_reader(mut self, reader: BodyReaderFn) -> Self {
        self.body_reader = Some(reader);
        self
    }

    /// Disables the built-in body reader middleware.
    pub fn no_body_reader(mut self) -> Self {
        self.body_reader = None;
        self
    }

    // ---- registration

    /// Binds a route under `(method, url)`.
    pub fn route(&mut self, method: Method, url: &str, route: impl Into<Route>) -> Result<(), RouteError> {
        let mut route = route.into();
        route.set_url(url);
        self.tree.insert(method, url, Arc::new(route))
    }

    /// Binds a route with HTTP GET.
    pub fn get(&mut self, url: &str, route: impl Into<Route>) -> Result<(), RouteError> {
        self.route(Method::GET, url, route)
    }

    /// Binds a route with HTTP POST.
    pub fn post(&mut self, url: &str, route: impl Into<Route>) -> Result<(), RouteError> {
        self.route(Method::POST, url, route)
    }

    /// Binds a route with HTTP PUT.
    pub fn put(&mut self, url: &str, route: impl Into<Route>) -> Result<(), RouteError> {
        self.route(Method::PUT, url, route)
    }

    /// Binds a route with HTTP DELETE.
    pub fn delete(&mut self, url: &str, route: impl Into<Route>) -> Result<(), RouteError> {
        self.route(Method::DELETE, url, route)
    }

    /// Binds a route with HTTP HEAD.
    pub fn head(&mut self, url: &str, route: impl Into<Route>) -> Result<(), RouteError> {
        self.route(Method::HEAD, url, route)
    }

    /// Registers a global middleware in its phase's lane.
    pub fn register_middleware(&mut self, middleware: Middleware) {
        self.middlewares.register(middleware);
    }

    /// Registers several global middlewares, one by one.
    pub fn register_middlewares(&mut self, middlewares: impl IntoIterator<Item = Middleware>) {
        for middleware in middlewares {
            self.register_middleware(middleware);
        }
    }

    /// Freezes the builder into an immutable router.
    ///
    /// The built-in post middlewares are appended here, after every user
    /// registration: flush first, then the request logger, so the log line
    /// carries the real written byte count.
    pub fn build(self) -> Router {
        let mut middlewares = self.middlewares;

        if let Some(reader) = self.body_reader {
            middlewares.register(middlewares::body_reader(reader));
        }
        middlewares.append_post(middlewares::flush_response(Arc::new(DateService::new())));
        middlewares.append_post(middlewares::request_logger(self.info.server_name.clone()));

        let pool_config = ContextConfig { default_status: self.info.default_status, max_body_size: self.info.max_body_size };

        Router {
            info: self.info,
            cancellation: self.cancellation,
            tree: self.tree,
            middlewares,
            not_found: self.not_found,
            options_handler: self.options_handler,
            empty_tree_handler: self.empty_tree_handler,
            panic_handler: self.panic_handler,
            pool: ContextPool::new(pool_config),
            ids: AtomicU64::new(1),
        }
    }
}

/// The frozen router: read-only routing state shared by every connection.
pub struct Router {
    info: RouterInfo,
    cancellation: CancellationToken,
    tree: Tree,
    middlewares: MiddlewareRegistry,
    not_found: HandlerFunc,
    options_handler: Option<HandlerFunc>,
    empty_tree_handler: Option<HandlerFunc>,
    panic_handler: Option<PanicHandlerFunc>,
    pool: ContextPool,
    ids: AtomicU64,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Runs the two-phase pipeline for one armed context.
    pub(crate) async fn serve(&self, ctx: &mut Context) {
        let tail = self.resolve_handler(ctx);

        let mut pre_chain = self.middlewares.filter(ctx, MiddlewarePhase::Pre, self.info.middlewares_enabled);
        pre_chain.push(tail);

        if let Err(panic) = AssertUnwindSafe(run_chain(&pre_chain, ctx)).catch_unwind().await {
            self.recover(ctx, panic).await;
        }

        // The post chain runs no matter how the pre chain ended; flushing
        // and logging live here.
        let post_chain = self.middlewares.filter(ctx, MiddlewarePhase::Post, self.info.middlewares_enabled);

        if let Err(panic) = AssertUnwindSafe(run_chain(&post_chain, ctx)).catch_unwind().await {
            error!(id = ctx.id(), panic = %panic_message(&panic), "captured panic in the post phase");
            if let Err(e) = ctx.flush().await {
                error!(error = %e, "failed to flush response after post-phase panic");
            }
        }
    }

    async fn recover(&self, ctx: &mut Context, panic: Box<dyn Any + Send>) {
        match &self.panic_handler {
            Some(handler) => handler(ctx, panic).await,
            None => {
                // Absorbed silently so the server keeps running.
                error!(id = ctx.id(), panic = %panic_message(&panic), "captured panic while serving request");
            }
        }
    }

    /// Resolves the handler that sits at the tail of the pre chain.
    fn resolve_handler(&self, ctx: &mut Context) -> HandlerFunc {
        // HTTP OPTIONS is answered by the preregistered handler, never by
        // the tree.
        if *ctx.method() == Method::OPTIONS {
            return match &self.options_handler {
                Some(handler) => Arc::clone(handler),
                None => handler_fn(noop),
            };
        }

        if self.tree.is_empty() {
            return match &self.empty_tree_handler {
                Some(handler) => Arc::clone(handler),
                None => Arc::clone(&self.not_found),
            };
        }

        let method = ctx.method().clone();
        let url = ctx.cleaned_url().to_string();

        match self.tree.find(&method, &url) {
            None => Arc::clone(&self.not_found),
            Some((route, params)) => {
                if !params.is_empty() {
                    ctx.bind(BindKey::RouteParams, params);
                }
                ctx.bind(BindKey::RegisteredUrl, route.url().to_string());
                route_tail(route)
            }
        }
    }

    /// The base cancellation token handed to request contexts.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Binds the configured address and serves it; see [`Router::listen_on`].
    pub async fn listen(self) -> Result<(), ServeError> {
        let address = self.info.address.clone();
        let listener = TcpListener::bind(address.as_str())
            .await
            .map_err(|source| ServeError::Bind { address, source })?;

        self.listen_on(listener).await
    }

    /// Accepts connections on an already-bound listener until the base
    /// token is cancelled or an OS interrupt/termination signal arrives,
    /// then drains in-flight connections and returns.
    pub async fn listen_on(self, listener: TcpListener) -> Result<(), ServeError> {
        let address = listener.local_addr().map(|addr| addr.to_string()).unwrap_or_else(|_| self.info.address.clone());
        info!(server = %self.info.server_name, address = %address, "started listening");

        let cancellation = self.cancellation.clone();
        let tracker = TaskTracker::new();
        let router = Arc::new(self);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        #[cfg(unix)]
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|source| ServeError::Signal { source })?;

        loop {
            #[cfg(unix)]
            let terminated = terminate.recv();
            #[cfg(not(unix))]
            let terminated = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("cancellation requested, the router is shutting down");
                    break;
                }
                _ = &mut ctrl_c => {
                    info!("interrupt received, the router is shutting down");
                    break;
                }
                _ = terminated => {
                    info!("termination signal received, the router is shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "failed to accept");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    tracker.spawn(async move {
                        let (reader, writer) = stream.into_split();
                        let connection = HttpConnection::new(reader, writer);
                        if let Err(e) = connection.process(router).await {
                            error!(remote = %remote_addr, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }

        // Stop accepting, then wait out the in-flight connections.
        drop(listener);
        tracker.close();
        tracker.wait().await;

        info!("the router is shut down");
        Ok(())
    }
}

/// Wraps a matched route into the uniform chain-step signature.
fn route_tail(route: Arc<Route>) -> HandlerFunc {
    Arc::new(move |ctx: &mut Context| -> BoxFuture<'_, ()> {
        let route = Arc::clone(&route);
        Box::pin(async move { route.execute(ctx).await })
    })
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Pooled contexts: acquired per request, emptied and returned afterwards
/// so allocations are reused across requests.
struct ContextPool {
    free: Mutex<Vec<Context>>,
    config: ContextConfig,
}

impl ContextPool {
    fn new(config: ContextConfig) -> Self {
        Self { free: Mutex::new(Vec::new()), config }
    }

    fn acquire(&self) -> Context {
        let mut free = self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        free.pop().unwrap_or_else(|| Context::new(self.config))
    }

    fn release(&self, ctx: Context) {
        let mut free = self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        free.push(ctx);
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, request: Request<ReqBody>, writer: BoxWriter) -> Option<BoxWriter> {
        let mut ctx = self.pool.acquire();
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        ctx.reset(writer, request, id, self.cancellation.child_token());

        self.serve(&mut ctx).await;

        // Every reference the request pinned has to go before the context
        // returns to the pool.
        let writer = ctx.empty().await;
        self.pool.release(ctx);

        writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::error::RouteError;

    async fn write_id(ctx: &mut Context) {
        let id = ctx.param("id").unwrap_or("?").to_string();
        ctx.write(id.as_bytes());
    }

    async fn boom(_: &mut Context) {
        panic!("boom");
    }

    #[tokio::test]
    async fn serves_a_matched_route() {
        let mut builder = Router::builder();
        builder.get("/api/products/{id}", handler_fn(write_id)).unwrap();
        let router = builder.build();

        let mut ctx = test_context(Method::GET, "/api/products/42");
        router.serve(&mut ctx).await;

        assert_eq!(ctx.status(), Some(StatusCode::OK));
        assert!(ctx.is_flushed());
        assert_eq!(ctx.registered_url(), Some("/api/products/{id}"));
        assert_eq!(ctx.param("id"), Some("42"));
    }

    #[tokio::test]
    async fn unmatched_url_hits_the_not_found_handler() {
        let mut builder = Router::builder();
        builder.get("/foo", handler_fn(noop)).unwrap();
        let router = builder.build();

        let mut ctx = test_context(Method::DELETE, "/foo");
        router.serve(&mut ctx).await;

        assert_eq!(ctx.status(), Some(StatusCode::NOT_FOUND));
        assert!(ctx.is_flushed());
    }

    #[tokio::test]
    async fn options_without_handler_yields_default_status() {
        let mut builder = Router::builder();
        builder.get("/foo", handler_fn(noop)).unwrap();
        let router = builder.build();

        let mut ctx = test_context(Method::OPTIONS, "/foo");
        router.serve(&mut ctx).await;

        assert_eq!(ctx.status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn empty_tree_handler_serves_everything() {
        async fn teapot(ctx: &mut Context) {
            ctx.set_status(StatusCode::IM_A_TEAPOT);
        }

        let router = Router::builder().empty_tree_handler(handler_fn(teapot)).build();

        let mut ctx = test_context(Method::GET, "/anything");
        router.serve(&mut ctx).await;

        assert_eq!(ctx.status(), Some(StatusCode::IM_A_TEAPOT));
    }

    #[tokio::test]
    async fn recovered_panic_reaches_the_panic_handler() {
        let panic_handler: PanicHandlerFunc =
            Arc::new(|ctx: &mut Context, panic: Box<dyn Any + Send>| -> BoxFuture<'_, ()> {
                Box::pin(async move {
                    assert_eq!(panic.downcast_ref::<&str>(), Some(&"boom"));
                    ctx.send_internal_server_error();
                })
            });

        let mut builder = Router::builder().panic_handler(panic_handler);
        builder.get("/explode", handler_fn(boom)).unwrap();
        let router = builder.build();

        let mut ctx = test_context(Method::GET, "/explode");
        router.serve(&mut ctx).await;

        assert_eq!(ctx.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(ctx.is_flushed());
    }

    #[tokio::test]
    async fn panic_without_handler_is_absorbed() {
        let mut builder = Router::builder();
        builder.get("/explode", handler_fn(boom)).unwrap();
        let router = builder.build();

        let mut ctx = test_context(Method::GET, "/explode");
        router.serve(&mut ctx).await;

        // Nothing set a status, so the default one goes out.
        assert_eq!(ctx.status(), Some(StatusCode::OK));
        assert!(ctx.is_flushed());
    }

    #[tokio::test]
    async fn duplicate_registration_surfaces_the_tree_error() {
        let mut builder = Router::builder();
        builder.get("/foo", handler_fn(noop)).unwrap();
        assert_eq!(builder.get("/foo", handler_fn(noop)).unwrap_err(), RouteError::UrlAlreadyStored);
    }

    #[tokio::test]
    async fn listen_serves_and_drains_on_cancellation() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        async fn pong(ctx: &mut Context) {
            ctx.write(b"pong");
        }

        let token = CancellationToken::new();
        let mut builder = Router::builder().cancellation(token.clone());
        builder.get("/ping", handler_fn(pong)).unwrap();
        let router = builder.build();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(router.listen_on(listener));

        let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
        stream.write_all(b"GET /ping HTTP/1.1\r\nhost: localhost\r\n\r\n").await.unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the body arrived");
            collected.extend_from_slice(&buf[..n]);
            if collected.ends_with(b"pong") {
                break;
            }
        }
        assert!(collected.starts_with(b"HTTP/1.1 200 OK\r\n"));

        drop(stream);
        token.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ids_are_distinct_under_concurrent_resets() {
        let router = Arc::new(Router::builder().build());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let router = Arc::clone(&router);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..100 {
                    ids.push(router.ids.fetch_add(1, Ordering::Relaxed));
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }
}
