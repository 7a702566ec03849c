//! Shared protocol types for the transport layer.
//!
//! The request side is modeled as a stream of [`Message`]s: one header
//! message followed by zero or more payload items, ending with an EOF
//! marker. The response side is written by the caller through the writer
//! handed out per request, so no response types live here.

pub mod body;
mod error;
mod message;
mod request;

pub use error::{HttpError, ParseError, SendError};
pub use message::{Message, PayloadItem, PayloadSize};
pub use request::RequestHeader;
