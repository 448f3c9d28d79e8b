//! Decoder for chunked transfer encoding on the response path.
//!
//! Framing per [RFC 9112 §7.1](https://www.rfc-editor.org/rfc/rfc9112.html#name-chunked-transfer-coding):
//! each chunk is a hexadecimal size line (optionally followed by extensions),
//! the chunk data, and a delimiter line; a zero-size chunk terminates the
//! body, optionally followed by trailer fields up to a blank line.
//!
//! Differences from a strict reading, matching the wire contract of this
//! engine: a bare `\n` is accepted wherever CRLF delimits a line, and
//! trailer fields are consumed but not parsed — their presence is recorded
//! and their total size bounded.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, PayloadItem};

/// Ceiling on the total trailer section, delimiters included.
const MAX_TRAILER_BYTES: usize = 8 * 1024;

/// Streaming decoder for a chunked response body.
///
/// Emits each chunk's data as it becomes available (a chunk split across
/// transport buffers is emitted in pieces) and [`PayloadItem::Eof`] once the
/// terminal chunk and any trailers have been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkState,
    remaining: u64,
    trailer_bytes: usize,
    saw_trailer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Reading hex digits of the chunk size
    Size,
    /// Whitespace after the size, before extensions or line end
    SizeWs,
    /// Skipping chunk extensions up to the line end
    Extension,
    /// Saw CR of the size line, expecting LF
    SizeEnd,
    /// Consuming chunk data
    Data,
    /// Expecting the CR (or bare LF) delimiting the chunk data
    DataEnd,
    /// Saw CR after chunk data, expecting LF
    DataLf,
    /// At the start of a line after the terminal chunk
    TrailerStart,
    /// Inside a trailer field line
    TrailerLine,
    /// Saw CR inside the trailer section, expecting LF
    TrailerLf,
    /// Saw the final CR, expecting the final LF
    FinalLf,
    /// Terminal chunk and trailers fully consumed
    Done,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: ChunkState::Size, remaining: 0, trailer_bytes: 0, saw_trailer: false }
    }

    /// Whether trailer fields were actually present after the terminal
    /// chunk.
    pub fn saw_trailer(&self) -> bool {
        self.saw_trailer
    }

    fn push_size_digit(&mut self, digit: u8) -> Result<(), ParseError> {
        self.remaining = self
            .remaining
            .checked_mul(16)
            .and_then(|v| v.checked_add(u64::from(digit)))
            .ok_or_else(|| ParseError::invalid_chunk("chunk size overflows"))?;
        Ok(())
    }

    /// The size line is complete: zero size moves into the trailer section,
    /// anything else into the data.
    fn size_line_done(&self) -> ChunkState {
        if self.remaining == 0 { ChunkState::TrailerStart } else { ChunkState::Data }
    }

    fn count_trailer_byte(&mut self) -> Result<(), ParseError> {
        self.trailer_bytes += 1;
        if self.trailer_bytes > MAX_TRAILER_BYTES {
            return Err(ParseError::too_large_trailer(MAX_TRAILER_BYTES));
        }
        Ok(())
    }

    /// Consumes one framing byte and returns the next state.
    fn advance(&mut self, byte: u8) -> Result<ChunkState, ParseError> {
        use ChunkState::*;

        Ok(match self.state {
            Size => match byte {
                b @ b'0'..=b'9' => {
                    self.push_size_digit(b - b'0')?;
                    Size
                }
                b @ b'a'..=b'f' => {
                    self.push_size_digit(b - b'a' + 10)?;
                    Size
                }
                b @ b'A'..=b'F' => {
                    self.push_size_digit(b - b'A' + 10)?;
                    Size
                }
                b'\t' | b' ' => SizeWs,
                b';' => Extension,
                b'\r' => SizeEnd,
                b'\n' => self.size_line_done(),
                _ => return Err(ParseError::invalid_chunk("invalid size digit")),
            },

            SizeWs => match byte {
                b'\t' | b' ' => SizeWs,
                b';' => Extension,
                b'\r' => SizeEnd,
                b'\n' => self.size_line_done(),
                _ => return Err(ParseError::invalid_chunk("junk after chunk size")),
            },

            // extensions are skipped wholesale, they end at the line end
            Extension => match byte {
                b'\r' => SizeEnd,
                b'\n' => self.size_line_done(),
                _ => Extension,
            },

            SizeEnd => match byte {
                b'\n' => self.size_line_done(),
                _ => return Err(ParseError::invalid_chunk("missing LF after chunk size")),
            },

            // Data never reaches advance, decode() splits it off wholesale
            Data => Data,

            DataEnd => match byte {
                b'\r' => DataLf,
                b'\n' => Size,
                _ => return Err(ParseError::invalid_chunk("missing delimiter after chunk data")),
            },

            DataLf => match byte {
                b'\n' => Size,
                _ => return Err(ParseError::invalid_chunk("missing LF after chunk data")),
            },

            TrailerStart => match byte {
                b'\r' => FinalLf,
                b'\n' => Done,
                _ => {
                    self.saw_trailer = true;
                    self.count_trailer_byte()?;
                    TrailerLine
                }
            },

            TrailerLine => {
                self.count_trailer_byte()?;
                match byte {
                    b'\r' => TrailerLf,
                    b'\n' => TrailerStart,
                    _ => TrailerLine,
                }
            }

            TrailerLf => {
                self.count_trailer_byte()?;
                match byte {
                    b'\n' => TrailerStart,
                    _ => return Err(ParseError::invalid_chunk("missing LF after trailer field")),
                }
            }

            FinalLf => match byte {
                b'\n' => Done,
                _ => return Err(ParseError::invalid_chunk("missing final LF")),
            },

            Done => Done,
        })
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Decodes as much of the chunked stream as `src` holds.
    ///
    /// Returns `Ok(Some(Chunk(..)))` for each piece of chunk data,
    /// `Ok(Some(Eof))` once the body is complete, `Ok(None)` when more
    /// input is needed, and an error on malformed framing.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == ChunkState::Done {
                trace!("finished reading chunked body");
                return Ok(Some(PayloadItem::Eof));
            }

            if src.is_empty() {
                return Ok(None);
            }

            if self.state == ChunkState::Data {
                let take = self.remaining.min(src.len() as u64) as usize;
                let bytes = src.split_to(take).freeze();
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.state = ChunkState::DataEnd;
                }
                trace!(len = bytes.len(), "read chunked bytes");
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }

            let byte = src.get_u8();
            self.state = self.advance(byte)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn collect(decoder: &mut ChunkedDecoder, buf: &mut BytesMut) -> (Vec<u8>, bool) {
        let mut body = Vec::new();
        loop {
            match decoder.decode(buf).expect("well-formed") {
                Some(PayloadItem::Chunk(bytes)) => body.extend_from_slice(&bytes),
                Some(PayloadItem::Eof) => return (body, true),
                None => return (body, false),
            }
        }
    }

    #[test]
    fn single_chunk() {
        let mut buf = BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let (body, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert_eq!(body, b"1234567890abcdef");
        assert!(!decoder.saw_trailer());
    }

    #[test]
    fn multiple_chunks() {
        let mut buf = BytesMut::from(&b"5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let (body, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert_eq!(body, b"hello, world");
    }

    #[test]
    fn extensions_are_skipped() {
        let mut buf = BytesMut::from(&b"5;chunk-ext=value\r\nhello\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let (body, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn trailers_are_consumed_and_flagged() {
        let mut buf =
            BytesMut::from(&b"5\r\nhello\r\n0\r\nExpires: never\r\nX-Sum: 1\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let (body, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert_eq!(body, b"hello");
        assert!(decoder.saw_trailer());
    }

    #[test]
    fn bare_newlines_are_tolerated() {
        let mut buf = BytesMut::from(&b"5\nhello\n0\n\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let (body, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn one_byte_at_a_time_matches_all_at_once() {
        let wire = b"4\r\nwiki\r\n5\r\npedia\r\n9\r\n in bits.\r\n0\r\n\r\n";

        let mut all = BytesMut::from(&wire[..]);
        let mut decoder = ChunkedDecoder::new();
        let (expected, done) = collect(&mut decoder, &mut all);
        assert!(done);

        let mut trickled = Vec::new();
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::new();
        let mut finished = false;
        for byte in wire {
            buf.extend_from_slice(&[*byte]);
            let (piece, done) = collect(&mut decoder, &mut buf);
            trickled.extend_from_slice(&piece);
            finished |= done;
        }
        assert!(finished);
        assert_eq!(trickled, expected);
        assert_eq!(expected, b"wikipedia in bits.");
    }

    #[test]
    fn partial_chunk_is_emitted_early() {
        let mut buf = BytesMut::from(&b"5\r\nhel"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buf).expect("ok").expect("some");
        assert_eq!(chunk.as_bytes(), Some(&Bytes::copy_from_slice(b"hel")));

        buf.extend_from_slice(b"lo\r\n0\r\n\r\n");
        let (body, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert_eq!(body, b"lo");
    }

    #[test]
    fn invalid_size_digit_is_an_error() {
        let mut buf = BytesMut::from(&b"xyz\r\n"[..]);
        assert!(ChunkedDecoder::new().decode(&mut buf).is_err());
    }

    #[test]
    fn missing_delimiter_is_an_error() {
        let mut buf = BytesMut::from(&b"5\r\nhelloBad"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buf).expect("ok").expect("some");
        assert_eq!(chunk.as_bytes(), Some(&Bytes::copy_from_slice(b"hello")));
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn size_overflow_is_an_error() {
        let mut buf = BytesMut::from(&b"fffffffffffffffff\r\n"[..]);
        assert!(ChunkedDecoder::new().decode(&mut buf).is_err());
    }

    #[test]
    fn oversize_trailer_is_an_error() {
        let mut wire = Vec::from(&b"0\r\n"[..]);
        wire.extend_from_slice(format!("X-Big: {}\r\n\r\n", "v".repeat(9000)).as_bytes());
        let mut buf = BytesMut::from(&wire[..]);
        assert!(ChunkedDecoder::new().decode(&mut buf).is_err());
    }

    #[test]
    fn zero_chunk_alone_completes() {
        let mut buf = BytesMut::from(&b"0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();
        let (body, done) = collect(&mut decoder, &mut buf);
        assert!(done);
        assert!(body.is_empty());
    }
}
