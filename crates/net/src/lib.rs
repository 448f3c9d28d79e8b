//! A non-blocking transport layer for many simultaneous TCP (optionally
//! TLS) connections, without one thread per connection.
//!
//! This crate provides the lower half of the `tether` stack: recycled
//! buffers, a per-process [`transport::Transport`] context owning a registry
//! of links, and an event machinery that reports every deliverable socket
//! transition to per-role callbacks. The HTTP client engine in `tether-http`
//! is its primary consumer, but the surface is protocol-agnostic: anything
//! that needs `connect`/`listen`, timed send/receive and explicit buffer
//! ownership transfer can sit on top of it.
//!
//! # Features
//!
//! - Outbound and listening links over plain TCP or TLS (rustls)
//! - One owning tokio task per socket, no poll-set construction
//! - Pooled receive buffers with explicit delivery/release ownership
//! - Per-link activity timeouts and a bounded closing-timeout
//! - Caller-driven (`wait`/`flush`) or background-worker-driven progress
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tether_net::buffer::Buffer;
//! use tether_net::event::LinkEvents;
//! use tether_net::link::{LinkId, Token};
//! use tether_net::transport::Transport;
//!
//! struct Printer(Transport);
//!
//! impl LinkEvents for Printer {
//!     fn incoming(&self, _listener: Token, _link: LinkId) -> Token {
//!         0
//!     }
//!     fn recv(&self, _token: Token, buffer: Buffer) {
//!         println!("{} bytes", buffer.len());
//!         self.0.release_recv_buffer(buffer);
//!     }
//!     fn send_ready(&self, _token: Token, _queued: usize) {}
//!     fn send_finished(&self, _token: Token) {}
//!     fn timeout(&self, _token: Token) {}
//!     fn closed(&self, _token: Token) {}
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Transport::builder().build();
//!     let handler = Arc::new(Printer(transport.clone()));
//!
//!     let link = transport.connect("example.com", 80, false, 1, handler).expect("resolvable");
//!     let mut buffer = transport.allocate_send_buffer(64);
//!     buffer.put_slice(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
//!     transport.queue_send_buffer(link, buffer).expect("link open");
//!
//!     while transport.wait(Duration::from_secs(5)).await {}
//!     transport.shutdown();
//! }
//! ```
//!
//! # Concurrency model
//!
//! All mutable shared state (link registry, event queue, buffer pool) is
//! guarded by one mutex per [`transport::Transport`]; the lock is never held
//! across an await point and always released before a callback is invoked,
//! so callbacks may freely call back into the transport. The single
//! forbidden pattern is re-entering the blocking
//! [`wait`](transport::Transport::wait) call from inside a dispatched
//! callback.

pub mod buffer;
pub mod error;
pub mod event;
pub mod link;
pub mod transport;

mod tls;

pub use error::TransportError;
