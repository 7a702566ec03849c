use bytes::Bytes;

/// A decoded piece of the incoming request stream: either the request
/// header or a chunk of its payload.
pub enum Message<T> {
    /// The header information of type `T`
    Header(T),
    /// A chunk of payload data or the EOF marker
    Payload(PayloadItem),
}

/// An item in the request payload stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem {
    /// A chunk of payload data
    Chunk(Bytes),
    /// Marks the end of the payload stream
    Eof,
}

/// Size information of a request payload, derived from the request headers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Payload with a known length in bytes
    Length(u64),
    /// Payload using chunked transfer encoding
    Chunked,
    /// No payload
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty | PayloadSize::Length(0))
    }
}

impl<T> Message<T> {
    #[inline]
    pub fn is_payload(&self) -> bool {
        matches!(self, Message::Payload(_))
    }

    #[inline]
    pub fn is_header(&self) -> bool {
        matches!(self, Message::Header(_))
    }
}

impl PayloadItem {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }

    /// Returns a reference to the contained bytes if this is a `Chunk`.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }

    /// Consumes the item and returns the contained bytes if this is a `Chunk`.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_counts_as_empty() {
        assert!(PayloadSize::Empty.is_empty());
        assert!(PayloadSize::Length(0).is_empty());
        assert!(!PayloadSize::Length(1).is_empty());
        assert!(!PayloadSize::Chunked.is_empty());
        assert!(PayloadSize::Chunked.is_chunked());
    }

    #[test]
    fn payload_item_accessors() {
        let chunk = PayloadItem::Chunk(Bytes::from_static(b"abc"));
        assert!(chunk.is_chunk());
        assert_eq!(chunk.as_bytes().map(|bytes| bytes.len()), Some(3));
        assert_eq!(chunk.into_bytes().unwrap(), Bytes::from_static(b"abc"));

        assert!(PayloadItem::Eof.is_eof());
        assert!(PayloadItem::Eof.into_bytes().is_none());
    }
}
