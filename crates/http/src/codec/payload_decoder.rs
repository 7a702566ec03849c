//! Decoders for the request payload, selected by the header's
//! [`PayloadSize`]: fixed Content-Length, chunked transfer encoding
//! (RFC 7230 section 4.1), or no body at all.

use std::cmp;

use crate::protocol::{ParseError, PayloadItem, PayloadSize};
use bytes::{Buf, BytesMut};
use httparse::Status;
use tokio_util::codec::Decoder;

/// Applies the decoding strategy the request headers called for.
///
/// A Content-Length payload needs no machinery beyond a countdown of the
/// bytes still owed, so it lives inline; chunked encoding gets its own
/// state machine.
pub struct PayloadDecoder {
    kind: PayloadKind,
}

enum PayloadKind {
    /// Bytes still owed by a Content-Length payload
    Sized { remaining: u64 },
    Chunked(ChunkedDecoder),
    Empty,
}

impl PayloadDecoder {
    pub fn empty() -> Self {
        Self { kind: PayloadKind::Empty }
    }

    pub fn sized(length: u64) -> Self {
        Self { kind: PayloadKind::Sized { remaining: length } }
    }

    pub fn chunked() -> Self {
        Self { kind: PayloadKind::Chunked(ChunkedDecoder::new()) }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, PayloadKind::Empty)
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(0) | PayloadSize::Empty => Self::empty(),
            PayloadSize::Length(length) => Self::sized(length),
            PayloadSize::Chunked => Self::chunked(),
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            PayloadKind::Empty => Ok(Some(PayloadItem::Eof)),

            PayloadKind::Sized { remaining } => {
                if *remaining == 0 {
                    return Ok(Some(PayloadItem::Eof));
                }
                if src.is_empty() {
                    return Ok(None);
                }

                // Forward whatever has arrived, but never bytes that belong
                // to the next request.
                let take = cmp::min(*remaining, src.len() as u64) as usize;
                *remaining -= take as u64;

                Ok(Some(PayloadItem::Chunk(src.split_to(take).freeze())))
            }

            PayloadKind::Chunked(decoder) => decoder.decode(src),
        }
    }
}

/// Decoder for chunked transfer encoding.
///
/// Chunk-size lines are parsed with `httparse::parse_chunk_size`; trailer
/// fields after the terminal zero-size chunk are read and discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChunkedDecoder {
    state: ChunkedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Expecting a chunk-size line
    Size,
    /// Reading chunk data, `remaining` bytes left
    Data { remaining: u64 },
    /// Expecting the CRLF that terminates a data chunk
    DataCrlf,
    /// Discarding trailer lines until the empty one
    Trailer,
    /// The terminal chunk has been consumed
    End,
}

impl ChunkedDecoder {
    fn new() -> Self {
        Self { state: ChunkedState::Size }
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ChunkedState::End => return Ok(Some(PayloadItem::Eof)),

                ChunkedState::Size => {
                    let parsed = httparse::parse_chunk_size(src)
                        .map_err(|_| ParseError::malformed_payload("unparseable chunk size line"))?;

                    match parsed {
                        Status::Complete((consumed, 0)) => {
                            src.advance(consumed);
                            self.state = ChunkedState::Trailer;
                        }
                        Status::Complete((consumed, size)) => {
                            src.advance(consumed);
                            self.state = ChunkedState::Data { remaining: size };
                        }
                        Status::Partial => return Ok(None),
                    }
                }

                ChunkedState::Data { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }

                    let len = cmp::min(remaining, src.len() as u64);
                    let bytes = src.split_to(len as usize).freeze();

                    let remaining = remaining - bytes.len() as u64;
                    self.state = if remaining == 0 { ChunkedState::DataCrlf } else { ChunkedState::Data { remaining } };

                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                ChunkedState::DataCrlf => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(ParseError::malformed_payload("chunk data is not terminated by CRLF"));
                    }
                    src.advance(2);
                    self.state = ChunkedState::Size;
                }

                ChunkedState::Trailer => {
                    // Each pass discards one line; the empty line ends the
                    // trailer section.
                    let Some(line_end) = find_crlf(src) else {
                        return Ok(None);
                    };
                    let is_last = line_end == 0;
                    src.advance(line_end + 2);
                    if is_last {
                        self.state = ChunkedState::End;
                    }
                }
            }
        }
    }
}

fn find_crlf(src: &BytesMut) -> Option<usize> {
    src.windows(2).position(|window| window == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn sized_payload_is_forwarded_as_it_arrives() {
        let mut decoder = PayloadDecoder::sized(8);

        // First half of the body.
        let mut buffer = BytesMut::from(&b"wxyz"[..]);
        let first = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(first.into_bytes().unwrap(), Bytes::from_static(b"wxyz"));

        // Nothing buffered yet, nothing owed back.
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        // Second half arrives glued to the next request's first bytes.
        buffer.extend_from_slice(b"1234GET /next");
        let second = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.into_bytes().unwrap(), Bytes::from_static(b"1234"));

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(&buffer[..], b"GET /next");
    }

    #[test]
    fn zero_sized_payload_is_immediately_eof() {
        let mut buffer = BytesMut::from(&b"leftover"[..]);
        let mut decoder = PayloadDecoder::from(PayloadSize::Length(0));

        assert!(decoder.is_empty());
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(&buffer[..], b"leftover");
    }

    #[test]
    fn chunked_decoder_single_chunk() {
        let mut buffer = BytesMut::from(&b"5\r\nhello\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.into_bytes().unwrap(), Bytes::from_static(b"hello"));

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
        assert!(buffer.is_empty());
    }

    #[test]
    fn chunked_decoder_multiple_chunks_with_trailer() {
        let mut buffer = BytesMut::from(&b"2\r\nab\r\n3\r\ncde\r\n0\r\nx-trailer: 1\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap(), Bytes::from_static(b"cde"));
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn chunked_decoder_partial_feed() {
        let mut decoder = ChunkedDecoder::new();

        let mut buffer = BytesMut::from(&b"5\r\nhe"[..]);
        let first = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(first.into_bytes().unwrap(), Bytes::from_static(b"he"));

        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"llo\r\n0\r\n\r\n");
        let second = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.into_bytes().unwrap(), Bytes::from_static(b"llo"));
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }
}
