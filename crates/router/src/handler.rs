//! The uniform handler signature shared by terminal handlers, middlewares
//! and the configured fallback handlers.
//!
//! A handler borrows the context mutably for the duration of one chain
//! step. [`handler_fn`] adapts a plain `async fn(&mut Context)` into the
//! type-erased [`HandlerFunc`]; closures that capture state can be built
//! directly with `Arc::new(move |ctx: &mut Context| -> BoxFuture<'_, ()> { ... })`.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::Context;

/// A type-erased handler step.
pub type HandlerFunc = Arc<dyn for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync>;

/// Helper trait that lets [`handler_fn`] accept `async fn(&mut Context)`
/// items, whose future type depends on the borrow's lifetime.
pub trait HandlerFn<'a>: Send + Sync {
    type Future: Future<Output = ()> + Send + 'a;

    fn invoke(&self, ctx: &'a mut Context) -> Self::Future;
}

impl<'a, F, Fut> HandlerFn<'a> for F
where
    F: Fn(&'a mut Context) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'a,
{
    type Future = Fut;

    fn invoke(&self, ctx: &'a mut Context) -> Fut {
        self(ctx)
    }
}

/// Adapts an `async fn(&mut Context)` into a [`HandlerFunc`].
pub fn handler_fn<F>(f: F) -> HandlerFunc
where
    F: for<'a> HandlerFn<'a> + 'static,
{
    Arc::new(move |ctx: &mut Context| -> BoxFuture<'_, ()> { Box::pin(f.invoke(ctx)) })
}

/// Runs an ordered list of chain steps with the index-form early-abort
/// convention: after each step the context's chain position is compared
/// against the position captured before the step; a step that did not call
/// [`Context::next`] stops everything downstream.
pub(crate) async fn run_chain(steps: &[HandlerFunc], ctx: &mut Context) {
    for step in steps {
        let checkpoint = ctx.chain_position();
        step(ctx).await;
        if ctx.chain_position() == checkpoint {
            break;
        }
    }
}
