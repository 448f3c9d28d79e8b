use std::io;
use thiserror::Error;

use crate::link::LinkId;

/// Failures surfaced synchronously by transport operations.
///
/// Asynchronous failures (a connect that fails mid-flight, a peer reset) are
/// never returned from these entry points; they arrive later as a `closed`
/// event on the affected link.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("can't resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("{host} is not a valid tls server name")]
    InvalidServerName { host: String },

    #[error("can't bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("tls listener requested but no server config installed")]
    MissingTlsServerConfig,

    #[error("{0} is not registered")]
    UnknownLink(LinkId),

    #[error("{0} is closing, operation rejected")]
    LinkClosing(LinkId),

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl TransportError {
    pub fn resolve<E: Into<io::Error>>(host: &str, port: u16, e: E) -> Self {
        Self::Resolve { host: host.to_string(), port, source: e.into() }
    }

    pub fn bind<E: Into<io::Error>>(port: u16, e: E) -> Self {
        Self::Bind { port, source: e.into() }
    }
}
