//! An HTTP/1.1 client protocol engine layered on `tether-net`.
//!
//! This crate drives request/response exchanges over pooled transport
//! links: connection reuse (keep-alive), request pipelining, chunked
//! transfer decoding and reconnect-with-retry semantics. It does not build
//! request lines — callers supply complete request bytes, which are
//! transmitted verbatim — and it parses responses into a structured
//! [`protocol::Response`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tether_http::connection::{HttpConnection, HttpOptions};
//! use tether_http::query::{QueryFlags, QueryStatus};
//! use tether_net::transport::Transport;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Transport::builder().build();
//!     let connection = HttpConnection::open(&transport, "example.com", 80, HttpOptions::default());
//!
//!     connection.add_query(
//!         &b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"[..],
//!         QueryFlags::retry(),
//!         |status, response| {
//!             if status == QueryStatus::Success {
//!                 let response = response.expect("success carries a response");
//!                 println!("{} ({} bytes)", response.status(), response.body().len());
//!             } else {
//!                 eprintln!("query failed: {status:?}");
//!             }
//!         },
//!     );
//!
//!     while connection.query_count() > 0 {
//!         transport.wait(Duration::from_millis(100)).await;
//!         connection.process();
//!     }
//!     transport.shutdown();
//! }
//! ```
//!
//! # Architecture
//!
//! - [`codec`]: streaming response decoding (head, chunked/length/
//!   until-close bodies)
//! - [`protocol`]: response types, payload vocabulary, parse errors
//! - [`query`]: one exchange's state machine and completion contract
//! - [`connection`]: the engine — queues, negotiation, retry policy
//!
//! # Failure model
//!
//! Every query completes exactly once through its own callback with a
//! [`query::QueryStatus`]; there is no global error channel. Retry happens
//! silently only for queries flagged retry-eligible and only up to
//! [`connection::HTTP_FAILED_RETRY_MAXIMUM`] consecutive failures. A
//! malformed response is fatal to its whole connection.

pub mod codec;
pub mod connection;
pub mod protocol;
pub mod query;

pub use connection::{HttpConnection, HttpOptions, HttpStatus};
pub use protocol::{Response, ResponseHead};
pub use query::{QueryFlags, QueryStatus};

/// Early-return with an error when a condition does not hold.
///
/// Like `assert!`, but propagates instead of panicking.
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
