//! The per-connection request loop.
//!
//! [`HttpConnection`] reads framed request messages off the socket, builds
//! the lazy body handle for each request and calls the [`Handler`] with it
//! plus the connection's write half. The handler future and the body sender
//! run concurrently in a biased `select!` loop: the handler may await body
//! bytes that only the connection can produce, so neither side may block
//! the other.

use std::sync::Arc;

use futures::StreamExt;
use http::header::EXPECT;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, warn};

use crate::codec::RequestDecoder;
use crate::handler::{BoxWriter, Handler};
use crate::protocol::body::ReqBody;
use crate::protocol::{HttpError, Message, ParseError, PayloadSize, RequestHeader, SendError};

const READ_BUFFER_SIZE: usize = 8 * 1024;

const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// An HTTP/1.1 connection serving requests in sequence until the peer
/// closes it (or the handler keeps the writer).
pub struct HttpConnection<R> {
    framed_read: FramedRead<R, RequestDecoder>,
    writer: Option<BoxWriter>,
}

impl<R> HttpConnection<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new<W>(reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            framed_read: FramedRead::with_capacity(reader, RequestDecoder::new(), READ_BUFFER_SIZE),
            writer: Some(Box::new(BufWriter::new(writer))),
        }
    }

    /// Serves requests until the peer disconnects. Returns `Err` only for
    /// protocol-level failures; per-request failures are the handler's
    /// business.
    pub async fn process<H>(mut self, handler: Arc<H>) -> Result<(), HttpError>
    where
        H: Handler,
    {
        loop {
            if self.writer.is_none() {
                debug!("handler kept the writer, ending connection loop");
                return Ok(());
            }

            match self.framed_read.next().await {
                Some(Ok(Message::Header((header, payload_size)))) => {
                    self.serve_request(header, payload_size, &handler).await?;
                }

                Some(Ok(Message::Payload(_))) => {
                    error!("received payload while expecting a request header");
                    self.send_bad_request().await?;
                    return Err(ParseError::malformed_payload("stray payload data between requests").into());
                }

                Some(Err(e)) => {
                    error!(error = %e, "can't decode next request");
                    self.send_bad_request().await?;
                    return Err(e.into());
                }

                None => {
                    debug!("peer closed the connection");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_request<H>(
        &mut self,
        header: RequestHeader,
        payload_size: PayloadSize,
        handler: &Arc<H>,
    ) -> Result<(), HttpError>
    where
        H: Handler,
    {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        // Expect: 100-continue wants an interim response before the client
        // sends the body.
        if wants_continue(&header) {
            writer.write_all(CONTINUE_RESPONSE).await.map_err(SendError::Io)?;
            writer.flush().await.map_err(SendError::Io)?;
            debug!("received expect request header, sent continue response");
        }

        let (req_body, sender) = ReqBody::channel(&mut self.framed_read, payload_size);
        let request = header.body(req_body);

        let mut handle_fut = handler.handle(request, writer);

        let returned_writer = match sender {
            Some(mut sender) => {
                let mut body_done = false;
                let writer = loop {
                    tokio::select! {
                        // the response takes priority over body streaming
                        biased;
                        writer = &mut handle_fut => break writer,
                        result = sender.run(), if !body_done => {
                            body_done = true;
                            if let Err(e) = result {
                                warn!(error = %e, "request body streaming failed");
                            }
                        }
                    }
                };

                // Whatever the handler left unread has to go before the
                // next request can be framed.
                sender.skip_body().await?;
                writer
            }
            None => handle_fut.await,
        };

        self.writer = returned_writer;
        Ok(())
    }

    async fn send_bad_request(&mut self) -> Result<(), SendError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(BAD_REQUEST_RESPONSE).await.map_err(SendError::Io)?;
            writer.flush().await.map_err(SendError::Io)?;
        }
        Ok(())
    }
}

fn wants_continue(header: &RequestHeader) -> bool {
    header
        .headers()
        .get(EXPECT)
        .map(|value| value.as_bytes().len() >= 4 && &value.as_bytes()[0..4] == b"100-")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::Request;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    /// Replies with the collected body length; exercises the body channel
    /// through the real select loop.
    struct BodyLength;

    #[async_trait]
    impl Handler for BodyLength {
        async fn handle(&self, request: Request<ReqBody>, mut writer: BoxWriter) -> Option<BoxWriter> {
            let body = request.into_body().collect().await.unwrap_or_default();
            let payload = body.len().to_string();
            let response =
                format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}", payload.len(), payload);
            writer.write_all(response.as_bytes()).await.ok()?;
            writer.flush().await.ok()?;
            Some(writer)
        }
    }

    /// Ignores the body entirely; the connection has to skip it.
    struct NoBodyRead;

    #[async_trait]
    impl Handler for NoBodyRead {
        async fn handle(&self, _request: Request<ReqBody>, mut writer: BoxWriter) -> Option<BoxWriter> {
            writer.write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n").await.ok()?;
            writer.flush().await.ok()?;
            Some(writer)
        }
    }

    async fn roundtrip<H: Handler + 'static>(handler: H, raw: &str) -> String {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let connection = HttpConnection::new(server_read, server_write);

        let task = tokio::spawn(connection.process(Arc::new(handler)));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(raw.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_read.read_to_end(&mut response).await.unwrap();

        task.await.unwrap().unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn collects_request_body() {
        let raw = "POST /api HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello";
        let response = roundtrip(BodyLength, raw).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\n5"));
    }

    #[tokio::test]
    async fn keeps_connection_alive_across_requests() {
        let raw = concat!(
            "POST /a HTTP/1.1\r\ncontent-length: 2\r\n\r\nab",
            "POST /b HTTP/1.1\r\ncontent-length: 3\r\n\r\nabc",
        );
        let response = roundtrip(BodyLength, raw).await;
        assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[tokio::test]
    async fn skips_unread_body() {
        let raw = concat!(
            "POST /a HTTP/1.1\r\ncontent-length: 4\r\n\r\nwhat",
            "GET /b HTTP/1.1\r\n\r\n",
        );
        let response = roundtrip(NoBodyRead, raw).await;
        assert_eq!(response.matches("HTTP/1.1 204 No Content").count(), 2);
    }
}
