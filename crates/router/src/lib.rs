//! A radix-tree HTTP router on tokio.
//!
//! Routes are `(method, pattern)` bindings stored in a compressed prefix
//! tree; patterns mix literal segments with `{name}` wildcards and exact
//! matches always win over wildcard matches. Every request flows through a
//! two-phase middleware pipeline (pre-handler and post-handler lanes)
//! around the matched route, carried by a pooled [`Context`] that buffers
//! the whole response until the built-in flush middleware commits it.

mod bind;
mod context;
mod date;
mod error;
mod form;
mod handler;
pub mod matchers;
mod middleware;
mod middlewares;
mod response;
mod route;
mod server;
mod tree;

pub use bind::BindKey;
pub use context::{Context, RequestInfo};
pub use error::{ContextError, RouteError, ServeError};
pub use form::{FormData, FormFile};
pub use handler::{handler_fn, HandlerFn, HandlerFunc};
pub use middleware::{MatcherFunc, Middleware, MiddlewarePhase};
pub use response::{Html, Json, Respond, ResponseBuffer, Text};
pub use route::Route;
pub use server::{BodyReaderFn, PanicHandlerFunc, Router, RouterBuilder};
pub use tree::PathParams;

pub use arbor_http::connection::HttpConnection;
pub use arbor_http::protocol::body::ReqBody;
