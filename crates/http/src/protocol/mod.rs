//! Core protocol vocabulary for the client engine.
//!
//! - [`Message`], [`PayloadItem`], [`PayloadSize`]: what the decoders emit
//! - [`ResponseHead`], [`Response`]: the parsed result handed to callers
//! - [`ParseError`]: protocol-level failures, fatal to their connection

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod response;
pub use response::Response;
pub use response::ResponseHead;

mod error;
pub use error::ParseError;
