//! Failure modes of the transport.
//!
//! [`ParseError`] covers everything that can go wrong while reading a
//! request off the wire: the head section (size limits, malformed lines,
//! versions this decoder does not frame), the payload framing headers, and
//! the payload stream itself. [`SendError`] is the write side, which can
//! only fail at the transport. [`HttpError`] joins the two at the
//! connection boundary.

use std::io;
use thiserror::Error;

/// Anything that can end a connection early.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The incoming request could not be read
    #[error("failed to read request: {0}")]
    Receive(#[from] ParseError),

    /// The outgoing response could not be written
    #[error("failed to write response: {0}")]
    Send(#[from] SendError),
}

/// Failures while reading a request off the wire.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The head section outgrew the decoder's limit before terminating.
    #[error("request head exceeds the {limit} byte limit")]
    HeadTooLarge { limit: usize },

    /// The request declares more header fields than the decoder tracks.
    #[error("request carries more than {limit} header fields")]
    TooManyHeaderFields { limit: usize },

    /// The request line or a header field is not parseable HTTP/1.x.
    #[error("malformed request head: {detail}")]
    MalformedHead { detail: String },

    /// Only HTTP/1.0 and HTTP/1.1 are framed by this decoder.
    #[error("unsupported http version: {version:?}")]
    UnsupportedVersion { version: Option<u8> },

    /// The framing headers contradict each other or cannot be read, so the
    /// payload boundary is unknowable.
    #[error("cannot determine the payload framing: {detail}")]
    AmbiguousFraming { detail: String },

    /// The payload violates its own framing.
    #[error("malformed request payload: {detail}")]
    MalformedPayload { detail: String },

    /// The peer went away in the middle of a request.
    #[error("connection ended in the middle of a request")]
    UnexpectedEof,

    /// The underlying transport refused the read.
    #[error("transport read failed: {0}")]
    Io(#[from] io::Error),
}

impl ParseError {
    pub fn head_too_large(limit: usize) -> Self {
        Self::HeadTooLarge { limit }
    }

    pub fn too_many_header_fields(limit: usize) -> Self {
        Self::TooManyHeaderFields { limit }
    }

    pub fn malformed_head(detail: impl ToString) -> Self {
        Self::MalformedHead { detail: detail.to_string() }
    }

    pub fn ambiguous_framing(detail: impl ToString) -> Self {
        Self::AmbiguousFraming { detail: detail.to_string() }
    }

    pub fn malformed_payload(detail: impl ToString) -> Self {
        Self::MalformedPayload { detail: detail.to_string() }
    }
}

/// Failures while writing a response to the wire.
#[derive(Error, Debug)]
pub enum SendError {
    /// The underlying transport refused the write.
    #[error("transport write failed: {0}")]
    Io(#[from] io::Error),
}
