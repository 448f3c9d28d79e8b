//! Streaming response decoding.
//!
//! The codec layer is split the same way the wire is: [`HeadDecoder`]
//! parses the status line and header block, the [`body`] decoders handle
//! the three body framings (content-length, chunked, read-until-close),
//! and [`ResponseDecoder`] sequences the two phases so one decoder value
//! can consume an arbitrarily fragmented stream of pipelined responses.

pub mod body;
mod head_decoder;
mod response_decoder;

pub use head_decoder::HeadDecoder;
pub use response_decoder::ResponseDecoder;
