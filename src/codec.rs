//! Newline framing for client connections
//!
//! Lines are raw bytes; no UTF-8 requirement is placed on keys or values.

use crate::error::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits a byte stream on `\n` and terminates outgoing payloads with `\n`.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline in the current buffer.
    next_index: usize,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

fn without_carriage_return(mut line: BytesMut) -> Bytes {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line.freeze()
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let line_len = self.next_index + offset;
                self.next_index = 0;
                if line_len > self.max_length {
                    return Err(Error::LineTooLong(self.max_length));
                }
                let line = src.split_to(line_len);
                src.advance(1);
                Ok(Some(without_carriage_return(line)))
            }
            None => {
                if src.len() > self.max_length {
                    return Err(Error::LineTooLong(self.max_length));
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        // Final line without a terminator
        let line = src.split_to(src.len());
        Ok(Some(without_carriage_return(line)))
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        let terminated = item.last() == Some(&b'\n');
        dst.put(item);
        if !terminated {
            dst.put_u8(b'\n');
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_lines() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"Put:a:1\nGet:a\r\nGet:"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"Put:a:1")));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"Get:a")));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"b\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"Get:b")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_eof_yields_unterminated_line() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"Get:tail"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(Bytes::from_static(b"Get:tail")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_binary_and_empty_lines() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"\nPut:\xff:\x00\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::new()));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Bytes::from_static(b"Put:\xff:\x00"))
        );
    }

    #[test]
    fn test_line_too_long() {
        let mut codec = LineCodec::new(8);
        let mut buf = BytesMut::from(&b"Put:abcdef"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::LineTooLong(8))));

        let mut codec = LineCodec::new(8);
        let mut buf = BytesMut::from(&b"Put:abcdefgh\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::LineTooLong(8))));
    }

    #[test]
    fn test_encode_appends_newline_once() {
        let mut codec = LineCodec::default();
        let mut dst = BytesMut::new();

        codec.encode(Bytes::from_static(b"a:1"), &mut dst).unwrap();
        codec.encode(Bytes::from_static(b"a:2\n"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"a:1\na:2\n");
    }
}
