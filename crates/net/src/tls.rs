//! TLS handshake driving and the unified stream type.
//!
//! The cryptography itself is rustls; this module only drives the
//! connect/accept handshakes and folds the resulting stream flavors into one
//! [`IoStream`] the link task can read and write uniformly.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::TransportError;

pub(crate) struct TlsContext {
    connector: TlsConnector,
    acceptor: Option<TlsAcceptor>,
}

impl TlsContext {
    pub(crate) fn new(
        client: Option<Arc<rustls::ClientConfig>>,
        server: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        let client = client.unwrap_or_else(default_client_config);
        Self { connector: TlsConnector::from(client), acceptor: server.map(TlsAcceptor::from) }
    }

    pub(crate) fn has_acceptor(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Validates `host` as an SNI name up front so a bad address fails fast,
    /// before any socket exists.
    pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
        ServerName::try_from(host.to_string())
            .map_err(|_| TransportError::InvalidServerName { host: host.to_string() })
    }

    pub(crate) async fn client_handshake(
        &self,
        name: ServerName<'static>,
        stream: TcpStream,
    ) -> io::Result<IoStream> {
        let tls = self.connector.connect(name, stream).await?;
        Ok(IoStream::ClientTls(Box::new(tls)))
    }

    pub(crate) async fn server_handshake(&self, stream: TcpStream) -> io::Result<IoStream> {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no tls acceptor"))?;
        let tls = acceptor.accept(stream).await?;
        Ok(IoStream::ServerTls(Box::new(tls)))
    }
}

fn default_client_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}

/// One stream type for every link flavor, so the owning task is generic over
/// none of this.
pub(crate) enum IoStream {
    Plain(TcpStream),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            IoStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            IoStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_flush(cx),
            IoStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            IoStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            IoStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
