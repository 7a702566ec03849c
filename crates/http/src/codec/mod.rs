//! Streaming request decoding.
//!
//! [`RequestDecoder`] drives a two-phase state machine on top of
//! `tokio_util`'s [`Decoder`]: first the header section (via
//! [`HeaderDecoder`]), then the payload (via [`PayloadDecoder`]) until its
//! EOF marker, after which the next request's header is expected.

mod header_decoder;
mod payload_decoder;

pub use header_decoder::HeaderDecoder;
pub use payload_decoder::PayloadDecoder;

use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// A decoder for HTTP requests that handles both headers and payload.
///
/// The `payload_decoder` field doubles as the state: `None` while parsing
/// headers, `Some` while a payload is in flight.
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self { header_decoder: HeaderDecoder, payload_decoder: None }
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHeader, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    // this request's payload is finished
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };

            return Ok(message);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((header, payload_size)) => {
                // A bodyless request goes straight back to the header
                // phase; emitting an EOF item for it would desync the
                // connection loop.
                if !payload_size.is_empty() {
                    self.payload_decoder = Some(payload_size.into());
                }
                Some(Message::Header((header, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_then_payload_then_next_header() {
        let mut decoder = RequestDecoder::new();
        let mut buf = BytesMut::from(
            &b"POST /api HTTP/1.1\r\ncontent-length: 4\r\n\r\nbodyGET /other HTTP/1.1\r\n\r\n"[..],
        );

        let header = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(header.is_header());

        let chunk = decoder.decode(&mut buf).unwrap().unwrap();
        match chunk {
            Message::Payload(PayloadItem::Chunk(bytes)) => assert_eq!(&bytes[..], b"body"),
            _ => panic!("expected a payload chunk"),
        }

        let eof = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(eof, Message::Payload(PayloadItem::Eof)));

        let next = decoder.decode(&mut buf).unwrap().unwrap();
        match next {
            Message::Header((header, payload_size)) => {
                assert_eq!(header.uri().path(), "/other");
                assert!(payload_size.is_empty());
            }
            _ => panic!("expected the next request header"),
        }
    }
}
