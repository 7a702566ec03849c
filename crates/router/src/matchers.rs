//! Ready-made matcher predicates for middlewares.
//!
//! A [`Middleware`](crate::Middleware) already ANDs the matchers attached
//! to it; the combinators here cover the remaining composition needs and
//! the common request properties.

use std::sync::Arc;

use http::Method;

use crate::context::Context;
use crate::middleware::MatcherFunc;

/// Matches every request. What an absent matcher defaults to.
pub fn always() -> MatcherFunc {
    Arc::new(|_: &Context| true)
}

/// Matches no request.
pub fn never() -> MatcherFunc {
    Arc::new(|_: &Context| false)
}

/// Matches requests with the given HTTP method.
pub fn method(method: Method) -> MatcherFunc {
    Arc::new(move |ctx: &Context| *ctx.method() == method)
}

macro_rules! method_matcher {
    ($name:ident, $upper_case_method:ident) => {
        #[doc = concat!("Matches ", stringify!($upper_case_method), " requests.")]
        #[inline]
        pub fn $name() -> MatcherFunc {
            method(Method::$upper_case_method)
        }
    };
}

method_matcher!(get_method, GET);
method_matcher!(post_method, POST);
method_matcher!(put_method, PUT);
method_matcher!(delete_method, DELETE);
method_matcher!(head_method, HEAD);
method_matcher!(options_method, OPTIONS);
method_matcher!(patch_method, PATCH);

/// Matches requests carrying the header with exactly the given value.
pub fn header(name: impl Into<String>, value: impl Into<String>) -> MatcherFunc {
    let name = name.into();
    let value = value.into();
    Arc::new(move |ctx: &Context| ctx.header(&name).map(|found| found == value).unwrap_or(false))
}

/// Matches requests whose path starts with `prefix`.
pub fn path_prefix(prefix: impl Into<String>) -> MatcherFunc {
    let prefix = prefix.into();
    Arc::new(move |ctx: &Context| ctx.cleaned_url().starts_with(prefix.as_str()))
}

/// Composes matchers with OR logic. An empty list matches everything.
pub fn any(matchers: Vec<MatcherFunc>) -> MatcherFunc {
    Arc::new(move |ctx: &Context| {
        if matchers.is_empty() {
            return true;
        }
        matchers.iter().any(|matcher| matcher(ctx))
    })
}

/// Composes matchers with AND logic.
pub fn all(matchers: Vec<MatcherFunc>) -> MatcherFunc {
    Arc::new(move |ctx: &Context| matchers.iter().all(|matcher| matcher(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    #[test]
    fn method_matchers() {
        let get = test_context(Method::GET, "/");
        let post = test_context(Method::POST, "/");

        assert!(get_method()(&get));
        assert!(!get_method()(&post));
        assert!(post_method()(&post));
        assert!(method(Method::PATCH)(&test_context(Method::PATCH, "/")));
    }

    #[test]
    fn header_matcher_wants_an_exact_value() {
        let matcher = header("x-requested-with", "XMLHttpRequest");

        let plain = test_context(Method::GET, "/");
        assert!(!matcher(&plain));
    }

    #[test]
    fn path_prefix_matcher() {
        let matcher = path_prefix("/api");

        assert!(matcher(&test_context(Method::GET, "/api/items")));
        assert!(!matcher(&test_context(Method::GET, "/web/items")));
    }

    #[test]
    fn any_is_or_logic() {
        let ctx = test_context(Method::GET, "/");

        assert!(any(vec![])(&ctx));
        assert!(any(vec![never(), always()])(&ctx));
        assert!(!any(vec![never(), never()])(&ctx));
    }

    #[test]
    fn all_is_and_logic() {
        let ctx = test_context(Method::GET, "/");

        assert!(all(vec![])(&ctx));
        assert!(all(vec![always(), always()])(&ctx));
        assert!(!all(vec![always(), never()])(&ctx));
    }
}
