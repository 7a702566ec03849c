//! Cached HTTP date header values.
//!
//! Formatting an RFC 7231 date costs more than serving a small request, so
//! the current date string is cached and only re-rendered once it is a
//! second old. Readers clone a cheap `HeaderValue`; writers swap the cached
//! pair atomically.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use http::HeaderValue;
use httpdate::fmt_http_date;

const MAX_DATE_AGE: Duration = Duration::from_secs(1);

/// Provider of the `Date` response header value.
pub(crate) struct DateService {
    current: ArcSwap<(SystemTime, HeaderValue)>,
}

impl DateService {
    pub(crate) fn new() -> Self {
        Self { current: ArcSwap::from_pointee(render_now()) }
    }

    /// The current date header value, re-rendered at most once per second.
    pub(crate) fn http_date(&self) -> HeaderValue {
        let cached = self.current.load();

        let age = SystemTime::now().duration_since(cached.0).unwrap_or(Duration::ZERO);
        if age <= MAX_DATE_AGE {
            return cached.1.clone();
        }

        let fresh = render_now();
        let value = fresh.1.clone();
        self.current.store(Arc::new(fresh));
        value
    }
}

fn render_now() -> (SystemTime, HeaderValue) {
    let now = SystemTime::now();
    let rendered = fmt_http_date(now);
    let value = HeaderValue::try_from(rendered).expect("an http date is a valid header value");
    (now, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_valid_http_date() {
        let service = DateService::new();
        let value = service.http_date();
        let parsed = httpdate::parse_http_date(value.to_str().unwrap());
        assert!(parsed.is_ok());
    }

    #[test]
    fn reuses_the_cached_value_within_the_window() {
        let service = DateService::new();
        let first = service.http_date();
        let second = service.http_date();
        assert_eq!(first, second);
    }
}
