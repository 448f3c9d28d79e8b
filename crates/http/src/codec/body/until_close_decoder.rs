//! Decoder for the legacy body class with no declared delimiter.
//!
//! A response carrying neither a content length nor chunked framing on a
//! non-keep-alive socket is delimited by socket closure. Everything that
//! arrives is body; the connection engine declares EOF when the link
//! reports its close. Whether the peer finished or died mid-body is
//! inherently indistinguishable here, so the body is whatever arrived.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::protocol::{ParseError, PayloadItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UntilCloseDecoder;

impl Decoder for UntilCloseDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let bytes = src.split_to(src.len()).freeze();
        Ok(Some(PayloadItem::Chunk(bytes)))
    }
}
