use crate::protocol::body::ReqBody;
use async_trait::async_trait;
use http::Request;
use tokio::io::AsyncWrite;

/// The buffered write half of a connection, handed to the handler for the
/// duration of one request.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-request entry point the connection dispatches into.
///
/// The handler owns the writer while it runs and gives it back when the
/// request is finished; returning `None` tells the connection the writer
/// was kept (or closed) and no further requests will be served on it.
/// Implementations are expected to translate every failure into a written
/// response rather than erroring out of this call.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request<ReqBody>, writer: BoxWriter) -> Option<BoxWriter>;
}
