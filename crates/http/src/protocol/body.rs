//! Lazy request body plumbing.
//!
//! The connection owns the framed read half, but the request handler may
//! want to read the body at its own pace (or not at all). [`ReqBody`] is the
//! pull handle given to the handler; [`BodySender`] stays on the connection
//! side and answers pull signals by reading payload frames off the framed
//! stream. The two halves talk over a bounded signal/data channel pair, so
//! no payload is buffered beyond what the handler actually requested.

use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::error;

const CHANNEL_CAPACITY: usize = 8;

/// The request body handle handed to the request handler.
///
/// All reads are lazy: nothing is pulled from the connection until one of
/// the async accessors is called. Once EOF (or an error) has been observed
/// the handle is spent and every further read returns `None`.
pub struct ReqBody {
    kind: ReqBodyKind,
}

enum ReqBodyKind {
    Channel { signal_tx: mpsc::Sender<()>, data_rx: mpsc::Receiver<Result<PayloadItem, ParseError>>, eof: bool },
    Empty,
}

impl ReqBody {
    /// A body that reads as immediately consumed. Used for bodyless
    /// requests and as the replacement value when a body is taken out of a
    /// request.
    pub fn empty() -> Self {
        Self { kind: ReqBodyKind::Empty }
    }

    /// Creates the handler-side handle and, when there is a payload to
    /// stream, the connection-side sender feeding it.
    pub(crate) fn channel<S>(stream: &mut S, payload_size: PayloadSize) -> (ReqBody, Option<BodySender<'_, S>>)
    where
        S: Stream<Item = Result<Message<(RequestHeader, PayloadSize)>, ParseError>> + Unpin,
    {
        if payload_size.is_empty() {
            return (ReqBody::empty(), None);
        }

        let (signal_tx, signal_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(CHANNEL_CAPACITY);

        (
            ReqBody { kind: ReqBodyKind::Channel { signal_tx, data_rx, eof: false } },
            Some(BodySender { stream, signal_rx, data_tx, eof: false }),
        )
    }

    /// True once the body has been read to EOF (or never had content).
    pub fn is_consumed(&self) -> bool {
        match &self.kind {
            ReqBodyKind::Empty => true,
            ReqBodyKind::Channel { eof, .. } => *eof,
        }
    }

    /// Pulls the next chunk of the body. Returns `None` at EOF.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, ParseError>> {
        let ReqBodyKind::Channel { signal_tx, data_rx, eof } = &mut self.kind else {
            return None;
        };

        if *eof {
            return None;
        }

        if signal_tx.send(()).await.is_err() {
            // The connection side is gone; nothing more will arrive.
            *eof = true;
            return None;
        }

        match data_rx.recv().await {
            Some(Ok(PayloadItem::Chunk(bytes))) => Some(Ok(bytes)),
            Some(Ok(PayloadItem::Eof)) => {
                *eof = true;
                None
            }
            Some(Err(e)) => {
                *eof = true;
                Some(Err(e))
            }
            None => {
                *eof = true;
                None
            }
        }
    }

    /// Reads the whole remaining body into one contiguous buffer.
    pub async fn collect(&mut self) -> Result<Bytes, ParseError> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }

    /// Reads the remaining body to EOF, discarding it. Required before the
    /// connection can be reused for the next request.
    pub async fn drain(&mut self) {
        while let Some(chunk) = self.chunk().await {
            if let Err(e) = chunk {
                error!(error = %e, "failed to drain request body");
                return;
            }
        }
    }
}

/// Connection-side half of the body channel.
///
/// Runs concurrently with the request handler; every pull signal is
/// answered with the next payload frame read from the framed stream.
pub(crate) struct BodySender<'conn, S> {
    stream: &'conn mut S,
    signal_rx: mpsc::Receiver<()>,
    data_tx: mpsc::Sender<Result<PayloadItem, ParseError>>,
    eof: bool,
}

impl<'conn, S> BodySender<'conn, S>
where
    S: Stream<Item = Result<Message<(RequestHeader, PayloadSize)>, ParseError>> + Unpin,
{
    /// Serves pull signals until EOF is reached or the body handle is
    /// dropped.
    pub(crate) async fn run(&mut self) -> Result<(), ParseError> {
        while !self.eof {
            if self.signal_rx.recv().await.is_none() {
                // The body handle was dropped; whatever payload is left is
                // skipped by the connection afterwards.
                break;
            }

            let item = match self.next_item().await {
                Ok(item) => item,
                Err(e) => {
                    error!(error = %e, "failed to read request body from stream");
                    self.eof = true;
                    let _ = self.data_tx.send(Err(e)).await;
                    return Err(ParseError::malformed_payload("request body stream failed"));
                }
            };

            if item.is_eof() {
                self.eof = true;
            }

            if self.data_tx.send(Ok(item)).await.is_err() {
                break;
            }
        }

        Ok(())
    }

    /// Discards any payload the handler left unread.
    pub(crate) async fn skip_body(&mut self) -> Result<(), ParseError> {
        while !self.eof {
            let item = self.next_item().await?;
            if item.is_eof() {
                self.eof = true;
            }
        }
        Ok(())
    }

    async fn next_item(&mut self) -> Result<PayloadItem, ParseError> {
        match self.stream.next().await {
            Some(Ok(Message::Payload(item))) => Ok(item),
            Some(Ok(Message::Header(_))) => {
                Err(ParseError::malformed_payload("a new request head arrived inside the body"))
            }
            Some(Err(e)) => Err(e),
            None => Err(ParseError::UnexpectedEof),
        }
    }
}
