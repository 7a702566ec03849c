//! A registered route: the terminal handler plus its route-local
//! middleware lists.

use crate::context::Context;
use crate::handler::HandlerFunc;
use crate::middleware::{Middleware, MiddlewarePhase};

/// A binding of a URL pattern to a terminal handler.
///
/// Route-local middlewares are attached before the route is registered;
/// once it sits in the tree the route is immutable (registration and
/// dispatch are two distinct phases of the router's life).
pub struct Route {
    url: String,
    handler: HandlerFunc,
    pre: Vec<Middleware>,
    post: Vec<Middleware>,
}

impl Route {
    pub fn new(handler: HandlerFunc) -> Self {
        Self { url: String::new(), handler, pre: Vec::new(), post: Vec::new() }
    }

    pub(crate) fn with_url(url: &str, handler: HandlerFunc) -> Self {
        Self { url: url.to_string(), handler, pre: Vec::new(), post: Vec::new() }
    }

    pub(crate) fn set_url(&mut self, url: &str) {
        self.url = url.to_string();
    }

    /// Appends a middleware to the route-local list of its phase.
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        match middleware.phase() {
            MiddlewarePhase::Pre => self.pre.push(middleware),
            MiddlewarePhase::Post => self.post.push(middleware),
        }
        self
    }

    /// The pattern URL this route was registered under.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Runs the route-local pre list, the terminal handler and the
    /// route-local post list.
    ///
    /// The pre list follows the early-abort convention: a middleware that
    /// does not call [`Context::next`] skips the rest of the pre list and
    /// the terminal handler. The post list runs either way, mirroring the
    /// global post phase.
    pub(crate) async fn execute(&self, ctx: &mut Context) {
        let mut aborted = false;

        for middleware in self.pre.iter() {
            if !middleware.matches(ctx) {
                continue;
            }
            let checkpoint = ctx.chain_position();
            middleware.handler()(ctx).await;
            if ctx.chain_position() == checkpoint {
                aborted = true;
                break;
            }
        }

        if !aborted {
            (self.handler)(ctx).await;
        }

        for middleware in self.post.iter() {
            if !middleware.matches(ctx) {
                continue;
            }
            let checkpoint = ctx.chain_position();
            middleware.handler()(ctx).await;
            if ctx.chain_position() == checkpoint {
                break;
            }
        }
    }
}

impl From<HandlerFunc> for Route {
    fn from(handler: HandlerFunc) -> Self {
        Route::new(handler)
    }
}
