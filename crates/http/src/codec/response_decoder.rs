//! Two-phase response decoder: head first, then the matching payload
//! strategy.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::PayloadDecoder;
use crate::codec::head_decoder::HeadDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, ResponseHead};

/// Decodes one full HTTP response from a byte stream.
///
/// Phase one parses the head and selects the payload strategy; phase two
/// streams payload items until EOF, after which the decoder is ready for
/// the next response on the same stream (pipelining).
#[derive(Debug)]
pub struct ResponseDecoder {
    head_decoder: HeadDecoder,
    payload_decoder: Option<PayloadDecoder>,
    saw_trailer: bool,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether the decoder is mid-payload in the read-until-close body
    /// class, where only a link close can produce EOF.
    pub fn is_until_close(&self) -> bool {
        self.payload_decoder.as_ref().is_some_and(PayloadDecoder::is_until_close)
    }

    /// Whether trailer fields were actually observed after the terminal
    /// chunk of the decoded payload.
    pub fn saw_trailer(&self) -> bool {
        self.saw_trailer || self.payload_decoder.as_ref().is_some_and(PayloadDecoder::saw_trailer)
    }
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self { head_decoder: HeadDecoder, payload_decoder: None, saw_trailer: false }
    }
}

impl Decoder for ResponseDecoder {
    type Item = Message<(ResponseHead, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // drive the payload when one is in flight
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    self.saw_trailer = payload_decoder.saw_trailer();
                    // this response is finished, the next decode starts a
                    // fresh head
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };
            return Ok(message);
        }

        let message = match self.head_decoder.decode(src)? {
            Some((head, payload_size)) => {
                self.saw_trailer = false;
                self.payload_decoder = Some(payload_size.into());
                Some(Message::Head((head, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }
}
