//! Middlewares and the two-phase registry.
//!
//! A middleware is a matcher plus a handler with two flags: the phase it
//! runs in (before or after the terminal handler) and whether it is exempt
//! from the global middleware-enable switch. Matchers are evaluated per
//! request while the effective chain is assembled; handlers share the
//! uniform [`HandlerFunc`] signature and signal "continue downstream" by
//! calling [`Context::next`](crate::Context::next).

use std::sync::Arc;

use crate::context::Context;
use crate::handler::HandlerFunc;

/// Predicate deciding whether a middleware participates in a request.
pub type MatcherFunc = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// The two lanes of the global pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewarePhase {
    /// Runs before the terminal handler
    Pre,
    /// Runs after the terminal handler
    Post,
}

/// A single matcher + handler unit.
pub struct Middleware {
    matchers: Vec<MatcherFunc>,
    handler: HandlerFunc,
    always_allowed: bool,
    phase: MiddlewarePhase,
}

impl Middleware {
    /// Creates a pre-phase middleware with the default always-true matcher.
    pub fn pre(handler: HandlerFunc) -> Self {
        Self { matchers: Vec::new(), handler, always_allowed: false, phase: MiddlewarePhase::Pre }
    }

    /// Creates a post-phase middleware with the default always-true matcher.
    pub fn post(handler: HandlerFunc) -> Self {
        Self { matchers: Vec::new(), handler, always_allowed: false, phase: MiddlewarePhase::Post }
    }

    /// Adds a matcher. All registered matchers have to accept a request for
    /// the middleware to run on it.
    pub fn matcher(mut self, matcher: MatcherFunc) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Keeps this middleware running even when global middlewares are
    /// disabled.
    pub fn always_allowed(mut self) -> Self {
        self.always_allowed = true;
        self
    }

    pub fn phase(&self) -> MiddlewarePhase {
        self.phase
    }

    pub fn is_always_allowed(&self) -> bool {
        self.always_allowed
    }

    /// Whether this middleware wants to run for the given request.
    pub fn matches(&self, ctx: &Context) -> bool {
        self.matchers.iter().all(|matcher| matcher(ctx))
    }

    pub(crate) fn handler(&self) -> HandlerFunc {
        Arc::clone(&self.handler)
    }
}

/// The global middleware registry.
///
/// Pre-phase registrations append (newer registrations run last); post-phase
/// registrations prepend (newer registrations run first), which keeps the
/// wrapping order stable: a later post middleware sees what earlier ones
/// produced only from the inner side of the onion. The built-in flush and
/// logger middlewares are appended at the very end of the post lane when
/// the router is frozen, after every user registration.
#[derive(Default)]
pub(crate) struct MiddlewareRegistry {
    pre: Vec<Arc<Middleware>>,
    post: Vec<Arc<Middleware>>,
}

impl MiddlewareRegistry {
    pub(crate) fn register(&mut self, middleware: Middleware) {
        let middleware = Arc::new(middleware);
        match middleware.phase() {
            MiddlewarePhase::Pre => self.pre.push(middleware),
            MiddlewarePhase::Post => self.post.insert(0, middleware),
        }
    }

    /// Appends to the tail of the post lane, bypassing the prepend rule.
    pub(crate) fn append_post(&mut self, middleware: Middleware) {
        self.post.push(Arc::new(middleware));
    }

    /// The handlers of every middleware of `phase` that participates in
    /// this request, in execution order.
    pub(crate) fn filter(&self, ctx: &Context, phase: MiddlewarePhase, globally_enabled: bool) -> Vec<HandlerFunc> {
        let lane = match phase {
            MiddlewarePhase::Pre => &self.pre,
            MiddlewarePhase::Post => &self.post,
        };

        lane.iter()
            .filter(|middleware| globally_enabled || middleware.is_always_allowed())
            .filter(|middleware| middleware.matches(ctx))
            .map(|middleware| middleware.handler())
            .collect()
    }
}
