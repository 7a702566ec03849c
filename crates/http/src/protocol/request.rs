//! HTTP request header handling.
//!
//! Wraps the standard `http::Request` type instead of inventing a parallel
//! header vocabulary; the body is attached later, once the payload strategy
//! is known.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

/// A parsed request header, without its body.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body to this header, converting it into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|_| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether a request with this method usually carries a body.
    ///
    /// The payload strategy is decided by the Transfer-Encoding and
    /// Content-Length headers, not by this; it only informs callers that
    /// want to drain conservatively.
    pub fn may_carry_body(&self) -> bool {
        matches!(self.method(), &Method::POST | &Method::PUT | &Method::PATCH)
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
