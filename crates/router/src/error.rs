//! Error types surfaced at the router's boundaries.
//!
//! [`RouteError`] is returned to the caller at registration time and never
//! affects a running server. [`ContextError`] comes out of per-request
//! context operations. [`ServeError`] covers the listen path.

use std::io;

use arbor_http::protocol::ParseError;
use thiserror::Error;

/// Errors raised while registering a route.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// An empty URL was provided
    #[error("empty url was provided")]
    EmptyUrl,

    /// URLs must start with `/`
    #[error("malformed url: urls must start with /")]
    MalformedUrl,

    /// A `{` segment that is not closed by `}`
    #[error("malformed param: usage {{param-key}}")]
    MalformedParam,

    /// The (method, url) pair is already bound
    #[error("the given URL is already stored with the same method")]
    UrlAlreadyStored,
}

/// Errors raised by context operations during a request.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Form parsing requires a multipart/form-data content type
    #[error("the content-type is not multipart/form-data")]
    NotMultipart,

    /// The form body exceeds the configured limit
    #[error("form body size {size} exceeds the limit {limit}")]
    BodyTooLarge { size: u64, limit: u64 },

    /// The request body has already been taken
    #[error("the request body has already been consumed")]
    BodyConsumed,

    /// Reading the request body from the transport failed
    #[error("failed to read request body: {source}")]
    Body {
        #[from]
        source: ParseError,
    },

    /// The multipart payload could not be parsed
    #[error("failed to parse multipart form: {source}")]
    Form {
        #[from]
        source: multer::Error,
    },

    /// A path parameter the handler asked for is not bound
    #[error("missing path parameter: {0}")]
    MissingParam(String),

    /// A typed path parameter accessor could not parse the raw segment
    #[error("failed to parse path parameter {name} from {value:?}")]
    ParamParse { name: String, value: String },

    /// JSON encoding failed
    #[error("failed to encode json: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// I/O towards the transport failed
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Errors raised by [`Router::listen`](crate::Router::listen).
#[derive(Debug, Error)]
pub enum ServeError {
    /// The listen address could not be bound
    #[error("failed to bind {address}: {source}")]
    Bind { address: String, source: io::Error },

    /// An OS signal handler could not be installed
    #[error("failed to install signal handler: {source}")]
    Signal { source: io::Error },
}
