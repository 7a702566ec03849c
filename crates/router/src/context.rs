//! The per-request context.
//!
//! A context is owned by exactly one request at a time and recycled through
//! the router's pool: `reset` arms it with the transport writer, the parsed
//! request and a fresh id; `empty` drains the body, clears every reference
//! and hands the writer back so the connection can serve the next request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use arbor_http::handler::BoxWriter;
use arbor_http::protocol::body::ReqBody;
use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::bind::{BindKey, BoundValues};
use crate::error::ContextError;
use crate::form::{FormData, FormFile};
use crate::response::{Json, Respond, ResponseBuffer};
use crate::tree::PathParams;

pub(crate) const MULTIPART_CONTENT_TYPE: &str = "multipart/form-data";

/// Configuration snapshot a context keeps between recycles.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContextConfig {
    pub(crate) default_status: StatusCode,
    pub(crate) max_body_size: u64,
}

/// The per-request scratchpad: request, buffered response, bound values,
/// path parameters, id and timings.
pub struct Context {
    id: u64,
    started_at: Instant,
    request: Option<Request<ReqBody>>,
    writer: ResponseBuffer,
    bound: BoundValues,
    form: Option<FormData>,
    chain_position: u64,
    max_body_size: u64,
    cancellation: CancellationToken,
}

impl Context {
    pub(crate) fn new(config: ContextConfig) -> Self {
        Self {
            id: 0,
            started_at: Instant::now(),
            request: None,
            writer: ResponseBuffer::new(config.default_status),
            bound: BoundValues::default(),
            form: None,
            chain_position: 0,
            max_body_size: config.max_body_size,
            cancellation: CancellationToken::new(),
        }
    }

    /// Arms the context for one request.
    pub(crate) fn reset(&mut self, writer: BoxWriter, request: Request<ReqBody>, id: u64, cancellation: CancellationToken) {
        self.writer.attach(writer);
        self.request = Some(request);
        self.id = id;
        self.started_at = Instant::now();
        self.cancellation = cancellation;
    }

    /// Releases everything the request pointed at and returns the writer.
    ///
    /// For methods that carry a body the remaining body is drained first,
    /// so the transport can be reused for the next request.
    pub(crate) async fn empty(&mut self) -> Option<BoxWriter> {
        self.discard_body().await;

        self.request = None;
        self.bound.clear();
        self.form = None;
        self.chain_position = 0;
        self.id = 0;
        self.cancellation = CancellationToken::new();

        self.writer.empty()
    }

    async fn discard_body(&mut self) {
        let carries_body = matches!(self.method(), &Method::POST | &Method::PUT);
        if !carries_body {
            return;
        }
        if let Some(request) = self.request.as_mut() {
            request.body_mut().drain().await;
        }
    }

    // ---- identity and timings

    /// The process-unique id of this request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When this context was armed for the current request.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time spent on the current request so far.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The request-scoped cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    // ---- chain position

    /// Signals that the chain should continue past the current handler.
    pub fn next(&mut self) {
        self.chain_position += 1;
    }

    pub(crate) fn chain_position(&self) -> u64 {
        self.chain_position
    }

    // ---- request side

    /// The HTTP method of the request.
    pub fn method(&self) -> &Method {
        static FALLBACK: Method = Method::GET;
        self.request.as_ref().map(|request| request.method()).unwrap_or(&FALLBACK)
    }

    /// The full request URL, query string included.
    pub fn url(&self) -> &str {
        self.request
            .as_ref()
            .and_then(|request| request.uri().path_and_query())
            .map(|path_and_query| path_and_query.as_str())
            .unwrap_or("")
    }

    /// The request URL with the query string stripped.
    pub fn cleaned_url(&self) -> &str {
        self.request.as_ref().map(|request| request.uri().path()).unwrap_or("")
    }

    /// All request headers.
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.request.as_ref().map(|request| request.headers())
    }

    /// One request header, by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()?.get(name)?.to_str().ok()
    }

    /// The Content-Type of the request, or the empty string.
    pub fn content_type(&self) -> &str {
        self.header(CONTENT_TYPE.as_str()).unwrap_or("")
    }

    /// The query parameters, parsed on first access and cached.
    pub fn query_params(&mut self) -> &HashMap<String, Vec<String>> {
        if !self.bound.contains(&BindKey::QueryParams) {
            let query = self.request.as_ref().and_then(|request| request.uri().query()).unwrap_or("");
            let parsed = parse_query(query);
            self.bound.insert(BindKey::QueryParams, Box::new(parsed));
        }

        self.bound.get_as::<HashMap<String, Vec<String>>>(&BindKey::QueryParams).expect("query params were just bound")
    }

    /// The first query parameter value under `key`.
    pub fn query_param(&mut self, key: &str) -> Option<&str> {
        self.query_params().get(key).and_then(|values| values.first()).map(String::as_str)
    }

    /// Takes the body handle out of the request, leaving an empty one.
    pub fn take_body(&mut self) -> ReqBody {
        match self.request.as_mut() {
            Some(request) => std::mem::replace(request.body_mut(), ReqBody::empty()),
            None => ReqBody::empty(),
        }
    }

    /// Reads the whole request body from the transport.
    pub async fn collect_body(&mut self) -> Result<Bytes, ContextError> {
        let request = self.request.as_mut().ok_or(ContextError::BodyConsumed)?;
        if request.body().is_consumed() {
            return Err(ContextError::BodyConsumed);
        }
        Ok(request.body_mut().collect().await?)
    }

    /// The body bytes bound by the body-reader middleware, if it ran.
    pub fn body(&self) -> Option<&Bytes> {
        self.bound.get_as::<Bytes>(&BindKey::IncomingBody)
    }

    // ---- value binding

    /// Binds `value` under `key` for the rest of the request.
    pub fn bind<K, V>(&mut self, key: K, value: V)
    where
        K: Into<BindKey>,
        V: Send + Sync + 'static,
    {
        self.bound.insert(key.into(), Box::new(value));
    }

    /// The bound value under `key`, if any.
    pub fn bound(&self, key: &BindKey) -> Option<&(dyn std::any::Any + Send + Sync)> {
        self.bound.get(key)
    }

    /// The bound value under `key`, downcast to `T`.
    pub fn bound_as<T: 'static>(&self, key: &BindKey) -> Option<&T> {
        self.bound.get_as(key)
    }

    /// Mutable access to the bound value under `key`, downcast to `T`.
    pub fn bound_as_mut<T: 'static>(&mut self, key: &BindKey) -> Option<&mut T> {
        self.bound.get_as_mut(key)
    }

    pub fn has_bound(&self, key: &BindKey) -> bool {
        self.bound.contains(key)
    }

    // ---- path parameters

    /// All path parameters extracted by the route lookup.
    pub fn params(&self) -> Option<&PathParams> {
        self.bound_as::<PathParams>(&BindKey::RouteParams)
    }

    /// One path parameter, by its wildcard key.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params()?.get(name).map(String::as_str)
    }

    /// A path parameter parsed as a signed integer.
    pub fn param_i64(&self, name: &str) -> Result<i64, ContextError> {
        let value = self.param(name).ok_or_else(|| ContextError::MissingParam(name.to_string()))?;
        value.parse().map_err(|_| ContextError::ParamParse { name: name.to_string(), value: value.to_string() })
    }

    /// A path parameter parsed as a floating-point number.
    pub fn param_f64(&self, name: &str) -> Result<f64, ContextError> {
        let value = self.param(name).ok_or_else(|| ContextError::MissingParam(name.to_string()))?;
        value.parse().map_err(|_| ContextError::ParamParse { name: name.to_string(), value: value.to_string() })
    }

    /// The pattern URL of the matched route.
    pub fn registered_url(&self) -> Option<&str> {
        self.bound_as::<String>(&BindKey::RegisteredUrl).map(String::as_str)
    }

    // ---- form parsing

    /// Parses the request as multipart form data. Parsing happens at most
    /// once; later calls are no-ops.
    pub async fn parse_form(&mut self) -> Result<(), ContextError> {
        if self.form.is_some() {
            return Ok(());
        }

        let content_type = self.content_type();
        if !content_type.contains(MULTIPART_CONTENT_TYPE) {
            return Err(ContextError::NotMultipart);
        }
        let content_type = content_type.to_string();

        // Prefer the bytes the body-reader middleware may have bound; fall
        // back to reading the transport.
        let body = match self.body().cloned() {
            Some(bytes) => bytes,
            None => self.collect_body().await?,
        };

        if body.len() as u64 > self.max_body_size {
            return Err(ContextError::BodyTooLarge { size: body.len() as u64, limit: self.max_body_size });
        }

        self.form = Some(FormData::parse(&content_type, body).await?);
        Ok(())
    }

    /// A form value, parsing the form first if needed.
    pub async fn form_value(&mut self, key: &str) -> Result<Option<&str>, ContextError> {
        self.parse_form().await?;
        Ok(self.form.as_ref().and_then(|form| form.value(key)))
    }

    /// A form file, parsing the form first if needed.
    pub async fn form_file(&mut self, key: &str) -> Result<Option<&FormFile>, ContextError> {
        self.parse_form().await?;
        Ok(self.form.as_ref().and_then(|form| form.file(key)))
    }

    // ---- response side

    /// Sets the response status.
    pub fn set_status(&mut self, status: StatusCode) {
        self.writer.set_status(status);
    }

    /// The response status as currently buffered (after the flush, the one
    /// that went out).
    pub fn status(&self) -> Option<StatusCode> {
        self.writer.status()
    }

    /// Appends one response header.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.writer.append_header(name, value);
    }

    /// Appends every header of `headers` to the response.
    pub fn append_headers(&mut self, headers: &HeaderMap) {
        self.writer.append_headers(headers);
    }

    /// The headers buffered for the response so far.
    pub fn response_headers(&self) -> &HeaderMap {
        self.writer.headers()
    }

    /// Appends raw bytes to the response body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.writer.write(bytes);
    }

    /// Renders a [`Respond`] capability into the response and sets its
    /// content type. Returns the number of body bytes produced.
    pub fn render<R: Respond>(&mut self, responder: R) -> Result<usize, ContextError> {
        let mut encoded = BytesMut::new();
        let written = responder.encode(&mut encoded)?;

        self.writer.set_header(CONTENT_TYPE, responder.content_type());
        self.writer.write(&encoded);

        Ok(written)
    }

    /// Serializes `value` as JSON, sets the JSON content type and an OK
    /// status.
    pub fn send_json<T: Serialize>(&mut self, value: &T) -> Result<usize, ContextError> {
        self.set_status(StatusCode::OK);
        self.render(Json(value))
    }

    /// Copies status, headers and body of an upstream response into this
    /// one.
    pub fn pipe(&mut self, response: Response<Bytes>) {
        let (parts, body) = response.into_parts();
        self.writer.write(&body);
        self.writer.append_headers(&parts.headers);
        self.writer.set_status(parts.status);
    }

    /// Writes raw bytes together with a status and extra headers.
    pub fn send_raw(&mut self, bytes: &[u8], status: StatusCode, headers: HeaderMap) {
        self.writer.write(bytes);
        self.writer.set_status(status);
        self.writer.append_headers(&headers);
    }

    /// Sends a bare HTTP 200.
    pub fn send_ok(&mut self) {
        self.set_status(StatusCode::OK);
    }

    /// Sends an HTTP 404; the flush substitutes the status text as body.
    pub fn send_not_found(&mut self) {
        self.set_status(StatusCode::NOT_FOUND);
    }

    /// Sends an HTTP 405.
    pub fn send_method_not_allowed(&mut self) {
        self.set_status(StatusCode::METHOD_NOT_ALLOWED);
    }

    /// Sends an HTTP 401.
    pub fn send_unauthorized(&mut self) {
        self.set_status(StatusCode::UNAUTHORIZED);
    }

    /// Sends an HTTP 500.
    pub fn send_internal_server_error(&mut self) {
        self.set_status(StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// Sends an HTTP 503.
    pub fn send_unavailable(&mut self) {
        self.set_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    /// Bytes of response body committed to the transport so far.
    pub fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    /// Whether the response has been committed.
    pub fn is_flushed(&self) -> bool {
        self.writer.is_flushed()
    }

    /// Commits the buffered response to the transport.
    ///
    /// Usually called by the built-in flush middleware in the post phase;
    /// calling it twice is a no-op.
    pub async fn flush(&mut self) -> Result<(), ContextError> {
        self.writer.flush().await
    }

    /// A snapshot of the request's identity and outcome, the shape the
    /// request logger consumes.
    pub fn request_info(&self) -> RequestInfo {
        RequestInfo {
            id: self.id,
            method: self.method().clone(),
            url: self.url().to_string(),
            status: self.status(),
            written_bytes: self.bytes_written(),
            elapsed: self.elapsed(),
        }
    }
}

/// Identity and outcome of one request, frozen at snapshot time.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: u64,
    pub method: Method,
    pub url: String,
    pub status: Option<StatusCode>,
    pub written_bytes: u64,
    pub elapsed: Duration,
}

fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();

    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, value),
            None => (pair, ""),
        };
        params.entry(key.to_string()).or_default().push(value.to_string());
    }

    params
}

impl Context {
    /// Logs an info event tagged with this request's id.
    pub fn info(&self, message: &str) {
        tracing::info!(id = self.id, "{message}");
    }

    /// Logs a warning event tagged with this request's id.
    pub fn warning(&self, message: &str) {
        tracing::warn!(id = self.id, "{message}");
    }

    /// Logs an error event tagged with this request's id.
    pub fn error(&self, message: &str) {
        error!(id = self.id, "{message}");
    }
}

/// A context armed with a throwaway writer, for in-crate tests.
#[cfg(test)]
pub(crate) fn test_context(method: Method, uri: &str) -> Context {
    let mut ctx = Context::new(ContextConfig { default_status: StatusCode::OK, max_body_size: 10 << 20 });
    let request = Request::builder().method(method).uri(uri).body(ReqBody::empty()).unwrap();
    ctx.reset(Box::new(tokio::io::sink()), request, 1, CancellationToken::new());
    ctx
}
