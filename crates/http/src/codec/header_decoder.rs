use bytes::{Buf, BytesMut};
use http::{HeaderName, HeaderValue, Request};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader};

const MAX_HEADER_NUM: usize = 64;
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Decodes the request line and header section of an HTTP/1.x request.
///
/// Yields the parsed [`RequestHeader`] together with the [`PayloadSize`]
/// derived from its Transfer-Encoding / Content-Length headers, per
/// RFC 7230 section 3.3.
pub struct HeaderDecoder;

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut parsed = httparse::Request::new(&mut headers);

        let status = parsed.parse(src).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::too_many_header_fields(MAX_HEADER_NUM),
            e => ParseError::malformed_head(e),
        })?;

        let header_len = match status {
            Status::Complete(header_len) => header_len,
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::head_too_large(MAX_HEADER_BYTES));
                return Ok(None);
            }
        };

        trace!(header_len, "parsed request header");
        ensure!(header_len <= MAX_HEADER_BYTES, ParseError::head_too_large(MAX_HEADER_BYTES));

        let version = match parsed.version {
            Some(0) => http::Version::HTTP_10,
            Some(1) => http::Version::HTTP_11,
            // http2/3 run a different framing entirely
            version => return Err(ParseError::UnsupportedVersion { version }),
        };

        let mut builder = Request::builder()
            .method(parsed.method.ok_or_else(|| ParseError::malformed_head("request line has no method"))?)
            .uri(parsed.path.ok_or_else(|| ParseError::malformed_head("request line has no target"))?)
            .version(version);

        let header_count = parsed.headers.len();
        let header_map = builder.headers_mut().ok_or_else(|| ParseError::malformed_head("request target is not a uri"))?;
        header_map.reserve(header_count);

        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(ParseError::malformed_head)?;
            let value = HeaderValue::from_bytes(header.value).map_err(ParseError::malformed_head)?;
            header_map.append(name, value);
        }

        let request = builder.body(()).map_err(ParseError::malformed_head)?;
        let header = RequestHeader::from(request);
        let payload_size = parse_payload_size(&header)?;

        src.advance(header_len);

        Ok(Some((header, payload_size)))
    }
}

/// Derives the payload strategy from the request headers.
///
/// Refer to <https://www.rfc-editor.org/rfc/rfc7230#section-3.3>: a message
/// carrying both Transfer-Encoding and Content-Length is rejected, a
/// Transfer-Encoding whose final coding is not `chunked` means no readable
/// body, and absent both headers there is no payload at all.
fn parse_payload_size(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    let te_header = header.headers().get(http::header::TRANSFER_ENCODING);
    let cl_header = header.headers().get(http::header::CONTENT_LENGTH);

    match (te_header, cl_header) {
        (None, None) => Ok(PayloadSize::Empty),

        (te_value @ Some(_), None) => {
            if is_chunked(te_value) {
                Ok(PayloadSize::Chunked)
            } else {
                Ok(PayloadSize::Empty)
            }
        }

        (None, Some(cl_value)) => {
            let length = cl_value
                .to_str()
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok())
                .ok_or_else(|| ParseError::ambiguous_framing("content-length is not a number"))?;

            Ok(PayloadSize::Length(length))
        }

        (Some(_), Some(_)) => {
            Err(ParseError::ambiguous_framing("transfer-encoding and content-length are both present"))
        }
    }
}

fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    header_value
        .and_then(|value| value.to_str().ok())
        .and_then(|encodings| encodings.rsplit(',').next())
        .map(|last_encoding| last_encoding.trim() == "chunked")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, Method, Version};
    use indoc::indoc;

    #[test]
    fn check_is_chunked() {
        {
            let headers = HeaderMap::new();
            assert!(!is_chunked(headers.get(http::header::TRANSFER_ENCODING)))
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "gzip, chunked".parse().unwrap());
            assert!(is_chunked(headers.get(http::header::TRANSFER_ENCODING)));
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert("Transfer-Encoding", "chunked, gzip".parse().unwrap());
            assert!(!is_chunked(headers.get(http::header::TRANSFER_ENCODING)));
        }
    }

    #[test]
    fn from_curl() {
        let str = indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        "##};

        let mut buf = BytesMut::from(str);

        let (header, payload_size) = HeaderDecoder.decode(&mut buf).unwrap().unwrap();

        assert!(payload_size.is_empty());
        assert!(buf.is_empty());

        assert_eq!(header.method(), &Method::GET);
        assert_eq!(header.version(), Version::HTTP_11);
        assert_eq!(header.uri().path(), "/index.html");
        assert_eq!(header.uri().query(), None);

        assert_eq!(header.headers().len(), 3);
        assert_eq!(header.headers().get(http::header::ACCEPT), Some(&HeaderValue::from_static("*/*")));
        assert_eq!(header.headers().get(http::header::HOST), Some(&HeaderValue::from_static("127.0.0.1:8080")));
        assert_eq!(header.headers().get(http::header::USER_AGENT), Some(&HeaderValue::from_static("curl/7.79.1")));
    }

    #[test]
    fn content_length_yields_length_payload() {
        let str = indoc! {r##"
        POST /api HTTP/1.1
        Host: 127.0.0.1:8080
        Content-Length: 5

        hello"##};

        let mut buf = BytesMut::from(str);

        let (header, payload_size) = HeaderDecoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(header.method(), &Method::POST);
        assert_eq!(payload_size, PayloadSize::Length(5));
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn partial_header_needs_more_data() {
        let mut buf = BytesMut::from("GET /index.html HTT");
        assert!(HeaderDecoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 19);
    }

    #[test]
    fn both_length_headers_are_rejected() {
        let str = indoc! {r##"
        POST /api HTTP/1.1
        Transfer-Encoding: chunked
        Content-Length: 5

        "##};

        let mut buf = BytesMut::from(str);
        let result = HeaderDecoder.decode(&mut buf);
        assert!(matches!(result, Err(ParseError::AmbiguousFraming { .. })));
    }
}
