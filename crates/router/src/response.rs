//! The buffered response.
//!
//! Every write targets the in-memory buffer; nothing reaches the transport
//! until [`ResponseBuffer::flush`] runs, exactly once per request, from the
//! built-in flush middleware. Buffering the whole response keeps the
//! pipeline composable: a post-phase middleware can still rewrite status,
//! headers or body after the handler returned.

use std::time::SystemTime;

use arbor_http::handler::BoxWriter;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, DATE, SET_COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::ContextError;

const INIT_HEAD_SIZE: usize = 1024;

pub(crate) const JSON_CONTENT_TYPE_UTF8: &str = "application/json; charset=UTF-8";

/// A value that knows how to materialize itself into a response body.
pub trait Respond {
    /// The Content-Type the encoded body should be served under.
    fn content_type(&self) -> HeaderValue;

    /// Encodes the body into `buf` and returns the number of bytes written.
    fn encode(&self, buf: &mut BytesMut) -> Result<usize, ContextError>;
}

/// JSON responder over any serializable value.
pub struct Json<T>(pub T);

impl<T: Serialize> Respond for Json<T> {
    fn content_type(&self) -> HeaderValue {
        HeaderValue::from_static(JSON_CONTENT_TYPE_UTF8)
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<usize, ContextError> {
        let encoded = serde_json::to_vec(&self.0)?;
        buf.extend_from_slice(&encoded);
        Ok(encoded.len())
    }
}

/// Plain-text responder.
pub struct Text<T>(pub T);

impl<T: AsRef<str>> Respond for Text<T> {
    fn content_type(&self) -> HeaderValue {
        mime::TEXT_PLAIN_UTF_8.as_ref().parse().expect("static mime is a valid header value")
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<usize, ContextError> {
        let text = self.0.as_ref();
        buf.extend_from_slice(text.as_bytes());
        Ok(text.len())
    }
}

/// HTML responder.
pub struct Html<T>(pub T);

impl<T: AsRef<str>> Respond for Html<T> {
    fn content_type(&self) -> HeaderValue {
        mime::TEXT_HTML_UTF_8.as_ref().parse().expect("static mime is a valid header value")
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<usize, ContextError> {
        let html = self.0.as_ref();
        buf.extend_from_slice(html.as_bytes());
        Ok(html.len())
    }
}

/// Accumulates status, headers and body for one request and commits them
/// to the transport in a single flush.
pub struct ResponseBuffer {
    default_status: StatusCode,
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    written: u64,
    flushed: bool,
    sink: Option<BoxWriter>,
}

impl ResponseBuffer {
    pub(crate) fn new(default_status: StatusCode) -> Self {
        Self {
            default_status,
            status: None,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            written: 0,
            flushed: false,
            sink: None,
        }
    }

    pub(crate) fn attach(&mut self, sink: BoxWriter) {
        self.sink = Some(sink);
    }

    /// Clears all per-request state and hands the transport back.
    pub(crate) fn empty(&mut self) -> Option<BoxWriter> {
        self.status = None;
        self.headers = HeaderMap::new();
        self.body.clear();
        self.written = 0;
        self.flushed = false;
        self.sink.take()
    }

    pub(crate) fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// The explicit status if one was set; after a flush, the status that
    /// was actually written.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub(crate) fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    pub(crate) fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub(crate) fn append_headers(&mut self, headers: &HeaderMap) {
        for (name, value) in headers {
            self.headers.append(name.clone(), value.clone());
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) {
        if self.flushed {
            warn!("response already flushed, dropping write");
            return;
        }
        self.body.extend_from_slice(bytes);
    }

    /// Bytes of body committed to the transport; 0 before the flush.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub(crate) fn is_flushed(&self) -> bool {
        self.flushed
    }

    fn effective_status(&self) -> StatusCode {
        self.status.unwrap_or(self.default_status)
    }

    /// Commits the buffered response to the transport. The second and any
    /// later call is a no-op.
    pub(crate) async fn flush(&mut self) -> Result<(), ContextError> {
        if self.flushed {
            warn!("response already flushed");
            return Ok(());
        }

        let status = self.effective_status();

        // An empty error body is substituted with the canonical status
        // text, so plain `send_not_found`-style responses stay readable.
        let body: Bytes = if self.body.is_empty() && status >= StatusCode::MULTIPLE_CHOICES {
            Bytes::from_static(status.canonical_reason().unwrap_or("").as_bytes())
        } else {
            self.body.split().freeze()
        };

        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
        if !self.headers.contains_key(DATE) {
            let date = httpdate::fmt_http_date(SystemTime::now());
            if let Ok(value) = HeaderValue::from_str(&date) {
                self.headers.insert(DATE, value);
            }
        }

        let head = encode_head(status, &self.headers);

        let Some(sink) = self.sink.as_mut() else {
            // No transport attached; remember the outcome anyway so the
            // request log stays truthful.
            self.status = Some(status);
            self.flushed = true;
            return Ok(());
        };

        sink.write_all(&head).await?;
        sink.write_all(&body).await?;
        sink.flush().await?;

        self.status = Some(status);
        self.written = body.len() as u64;
        self.flushed = true;

        Ok(())
    }
}

/// Serializes the status line and header section.
///
/// Multi-valued headers are joined with `", "`; Set-Cookie is the exception
/// and keeps one line per value, since cookie values must not be merged.
fn encode_head(status: StatusCode, headers: &HeaderMap) -> BytesMut {
    let mut head = BytesMut::with_capacity(INIT_HEAD_SIZE);

    head.put_slice(b"HTTP/1.1 ");
    head.put_slice(status.as_str().as_bytes());
    head.put_slice(b" ");
    head.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    head.put_slice(b"\r\n");

    for name in headers.keys() {
        if name == &SET_COOKIE {
            for value in headers.get_all(name) {
                head.put_slice(name.as_str().as_bytes());
                head.put_slice(b": ");
                head.put_slice(value.as_bytes());
                head.put_slice(b"\r\n");
            }
            continue;
        }

        head.put_slice(name.as_str().as_bytes());
        head.put_slice(b": ");
        for (i, value) in headers.get_all(name).iter().enumerate() {
            if i > 0 {
                head.put_slice(b", ");
            }
            head.put_slice(value.as_bytes());
        }
        head.put_slice(b"\r\n");
    }

    head.put_slice(b"\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    async fn flush_to_string(mut buffer: ResponseBuffer) -> String {
        let (client, server) = duplex(64 * 1024);
        buffer.attach(Box::new(server));
        buffer.flush().await.unwrap();
        drop(buffer.empty());

        let (mut read, write) = tokio::io::split(client);
        drop(write);
        let mut bytes = Vec::new();
        read.read_to_end(&mut bytes).await.unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn flush_uses_default_status_when_unset() {
        let mut buffer = ResponseBuffer::new(StatusCode::OK);
        buffer.write(b"hello");

        let response = flush_to_string(buffer).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-length: 5\r\n"));
        assert!(response.contains("date: "));
        assert!(response.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn flush_prefers_the_explicit_status() {
        let mut buffer = ResponseBuffer::new(StatusCode::OK);
        buffer.set_status(StatusCode::CREATED);
        buffer.write(b"{}");

        let response = flush_to_string(buffer).await;
        assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
    }

    #[tokio::test]
    async fn empty_error_body_becomes_the_status_text() {
        let mut buffer = ResponseBuffer::new(StatusCode::OK);
        buffer.set_status(StatusCode::NOT_FOUND);

        let response = flush_to_string(buffer).await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with("\r\n\r\nNot Found"));
    }

    #[tokio::test]
    async fn multi_valued_headers_are_joined_with_comma() {
        let mut buffer = ResponseBuffer::new(StatusCode::OK);
        buffer.append_header(HeaderName::from_static("x-tag"), HeaderValue::from_static("a"));
        buffer.append_header(HeaderName::from_static("x-tag"), HeaderValue::from_static("b"));

        let response = flush_to_string(buffer).await;
        assert!(response.contains("x-tag: a, b\r\n"));
    }

    #[tokio::test]
    async fn set_cookie_stays_one_line_per_value() {
        let mut buffer = ResponseBuffer::new(StatusCode::OK);
        buffer.append_header(SET_COOKIE, HeaderValue::from_static("a=1"));
        buffer.append_header(SET_COOKIE, HeaderValue::from_static("b=2"));

        let response = flush_to_string(buffer).await;
        assert!(response.contains("set-cookie: a=1\r\n"));
        assert!(response.contains("set-cookie: b=2\r\n"));
        assert!(!response.contains("a=1, b=2"));
    }

    #[tokio::test]
    async fn writes_after_flush_are_dropped() {
        let (client, server) = duplex(64 * 1024);

        let mut buffer = ResponseBuffer::new(StatusCode::OK);
        buffer.attach(Box::new(server));
        buffer.write(b"first");
        buffer.flush().await.unwrap();

        buffer.write(b"second");
        buffer.flush().await.unwrap();
        assert_eq!(buffer.bytes_written(), 5);
        drop(buffer.empty());

        let (mut read, write) = tokio::io::split(client);
        drop(write);
        let mut bytes = Vec::new();
        read.read_to_end(&mut bytes).await.unwrap();
        let response = String::from_utf8(bytes).unwrap();

        assert!(response.ends_with("first"));
        assert!(!response.contains("second"));
    }

    #[test]
    fn responders_report_content_type_and_length() {
        let mut buf = BytesMut::new();

        assert_eq!(Text("hi").encode(&mut buf).unwrap(), 2);
        assert_eq!(Text("x").content_type(), "text/plain; charset=utf-8");

        assert_eq!(Html("<p>hi</p>").encode(&mut buf).unwrap(), 9);
        assert_eq!(Html("x").content_type(), "text/html; charset=utf-8");

        let written = Json(serde_json::json!({ "a": 1 })).encode(&mut buf).unwrap();
        assert_eq!(written, r#"{"a":1}"#.len());
        assert_eq!(Json(0u8).content_type(), JSON_CONTENT_TYPE_UTF8);
    }

    #[tokio::test]
    async fn empty_returns_the_sink_and_resets_state() {
        let (_client, server) = duplex(1024);

        let mut buffer = ResponseBuffer::new(StatusCode::OK);
        buffer.attach(Box::new(server));
        buffer.set_status(StatusCode::IM_A_TEAPOT);
        buffer.write(b"tea");

        let sink = buffer.empty();
        assert!(sink.is_some());
        assert!(buffer.status().is_none());
        assert_eq!(buffer.bytes_written(), 0);
        assert!(buffer.empty().is_none());
    }
}
