//! Response body decoders: one per framing flavor, plus the dispatching
//! [`PayloadDecoder`].

mod chunked_decoder;
mod length_decoder;
mod payload_decoder;
mod until_close_decoder;

pub use chunked_decoder::ChunkedDecoder;
pub use length_decoder::LengthDecoder;
pub use payload_decoder::PayloadDecoder;
pub use until_close_decoder::UntilCloseDecoder;
