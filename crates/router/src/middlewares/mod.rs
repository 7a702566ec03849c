//! The middlewares the router itself ships: the pre-phase body reader and
//! the always-allowed post-phase flush and request-log pair.

use std::sync::Arc;

use futures::future::BoxFuture;
use http::header::DATE;
use http::Method;
use tracing::{error, info};

use crate::context::{Context, MULTIPART_CONTENT_TYPE};
use crate::date::DateService;
use crate::middleware::{MatcherFunc, Middleware};
use crate::server::BodyReaderFn;

/// Elapsed times above this many microseconds are reported in milliseconds.
const MICROS_THRESHOLD: u128 = 10_000;

/// Pre-reads the request body and binds it on the context.
///
/// Only runs for methods that carry a body, and never for multipart
/// payloads, which the form parser wants to consume itself.
pub(crate) fn body_reader(reader: BodyReaderFn) -> Middleware {
    let matcher: MatcherFunc = Arc::new(|ctx: &Context| {
        if ctx.content_type().contains(MULTIPART_CONTENT_TYPE) {
            return false;
        }
        matches!(ctx.method(), &Method::POST | &Method::PUT)
    });

    let handler: crate::handler::HandlerFunc = Arc::new(move |ctx: &mut Context| -> BoxFuture<'_, ()> {
        let reader = Arc::clone(&reader);
        Box::pin(async move {
            let body = ctx.take_body();
            if let Some(bytes) = reader(body).await {
                ctx.bind(crate::bind::BindKey::IncomingBody, bytes);
            }
            ctx.next();
        })
    });

    Middleware::pre(handler).matcher(matcher)
}

/// Commits the buffered response to the transport. Runs after every
/// user-registered post middleware, even when global middlewares are
/// disabled.
pub(crate) fn flush_response(dates: Arc<DateService>) -> Middleware {
    let handler: crate::handler::HandlerFunc = Arc::new(move |ctx: &mut Context| -> BoxFuture<'_, ()> {
        let dates = Arc::clone(&dates);
        Box::pin(async move {
            if !ctx.response_headers().contains_key(DATE) {
                ctx.append_header(DATE, dates.http_date());
            }
            if let Err(e) = ctx.flush().await {
                error!(error = %e, "failed to flush response");
            }
            ctx.next();
        })
    });

    Middleware::post(handler).always_allowed()
}

/// Emits the structured request log line once the response is out.
pub(crate) fn request_logger(server_name: String) -> Middleware {
    let handler: crate::handler::HandlerFunc = Arc::new(move |ctx: &mut Context| -> BoxFuture<'_, ()> {
        let server = server_name.clone();
        Box::pin(async move {
            let request = ctx.request_info();

            // Microseconds by default, promoted to milliseconds once the
            // value stops being readable.
            let (elapsed_value, elapsed_unit) = if request.elapsed.as_micros() > MICROS_THRESHOLD {
                (request.elapsed.as_millis(), "ms")
            } else {
                (request.elapsed.as_micros(), "us")
            };

            info!(
                server = %server,
                id = request.id,
                method = %request.method,
                url = %request.url,
                status = request.status.map(|status| status.as_u16()).unwrap_or(0),
                response_bytes = request.written_bytes,
                elapsed = elapsed_value as u64,
                unit = elapsed_unit,
                "served request"
            );
            ctx.next();
        })
    });

    Middleware::post(handler).always_allowed()
}
