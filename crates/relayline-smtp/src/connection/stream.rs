//! Transport primitives: byte streams and the factory that opens them.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, RootCertStore},
};

use crate::config::Config;
use crate::error::{Error, Result};

/// A duplex byte stream to an SMTP server.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Returns true once the stream is protected by TLS.
    fn is_encrypted(&self) -> bool;
}

/// Opens transports and upgrades them to TLS.
///
/// The pool owns one connector and calls [`Connector::shutdown`] exactly
/// once, after it has been stopped and its last connection is gone.
pub trait Connector: Send + Sync + 'static {
    /// Stream type produced by this connector.
    type Stream: Transport;

    /// Opens a new stream to the server.
    fn connect(&self) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Performs the TLS handshake on a plaintext stream after STARTTLS.
    fn upgrade_to_tls(
        &self,
        stream: Self::Stream,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Releases connector-wide resources.
    fn shutdown(&self) {}
}

/// SMTP stream (TCP or TLS).
#[derive(Debug)]
pub enum SmtpStream {
    /// Plain TCP connection.
    Tcp(TcpStream),
    /// TLS-encrypted connection.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport for SmtpStream {
    fn is_encrypted(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connector over `tokio` TCP with `rustls`.
#[derive(Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    implicit_tls: bool,
    connect_timeout: Duration,
    tls: TlsConnector,
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("implicit_tls", &self.implicit_tls)
            .finish_non_exhaustive()
    }
}

impl TcpConnector {
    /// Creates a connector for the configured server, trusting the
    /// `webpki-roots` certificate authorities.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_tls_config(config, Arc::new(default_tls_config()))
    }

    /// Creates a connector with a custom `rustls` client configuration.
    #[must_use]
    pub fn with_tls_config(config: &Config, tls: Arc<ClientConfig>) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port(),
            implicit_tls: config.implicit_tls,
            connect_timeout: config.connect_timeout,
            tls: TlsConnector::from(tls),
        }
    }

    async fn handshake(&self, tcp: TcpStream) -> Result<SmtpStream> {
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| Error::Tls(format!("Invalid hostname: {}", self.host)))?;
        let tls_stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(handshake_error)?;
        Ok(SmtpStream::Tls(Box::new(tls_stream)))
    }
}

/// Classifies a failed handshake. Negotiation and certificate problems
/// surface from `tokio-rustls` as `InvalidData` wrapping a `rustls::Error`.
fn handshake_error(err: io::Error) -> Error {
    if let Some(tls) = err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
        return Error::Tls(format!("Handshake failed: {tls}"));
    }
    if err.kind() == io::ErrorKind::InvalidData {
        return Error::Tls(format!("Handshake failed: {err}"));
    }
    Error::Io(err)
}

impl Connector for TcpConnector {
    type Stream = SmtpStream;

    async fn connect(&self) -> Result<SmtpStream> {
        let addr = (self.host.as_str(), self.port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        tcp.set_nodelay(true)?;

        tracing::debug!(host = %self.host, port = self.port, tls = self.implicit_tls, "connected");

        if self.implicit_tls {
            self.handshake(tcp).await
        } else {
            Ok(SmtpStream::Tcp(tcp))
        }
    }

    async fn upgrade_to_tls(&self, stream: SmtpStream) -> Result<SmtpStream> {
        match stream {
            SmtpStream::Tcp(tcp) => self.handshake(tcp).await,
            SmtpStream::Tls(_) => Err(Error::Tls("Already using TLS".into())),
        }
    }
}

/// Creates a TLS client configuration with the bundled root certificates.
fn default_tls_config() -> ClientConfig {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_takes_config() {
        let config = Config::builder("smtp.example.com").implicit_tls(true).build();
        let connector = TcpConnector::new(&config);
        assert_eq!(connector.port, 465);
        assert!(connector.implicit_tls);
        assert!(format!("{connector:?}").contains("smtp.example.com"));
    }

    #[tokio::test]
    async fn test_plain_connect_is_not_encrypted() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Config::builder("127.0.0.1").port(port).build();

        let connector = TcpConnector::new(&config);
        let (client, server) = tokio::join!(connector.connect(), listener.accept());
        let stream = client.unwrap();
        server.unwrap();
        assert!(!stream.is_encrypted());
    }

    #[test]
    fn test_handshake_error_classification() {
        let rejected = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::General("bad certificate".into()),
        );
        assert!(matches!(handshake_error(rejected), Error::Tls(ref m) if m.contains("bad certificate")));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(handshake_error(reset), Error::Io(_)));
    }

    #[tokio::test]
    async fn test_implicit_tls_against_plaintext_server_is_tls_error() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Config::builder("127.0.0.1")
            .port(port)
            .implicit_tls(true)
            .build();

        let connector = TcpConnector::new(&config);
        let server = async {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"220 plaintext.example.com ESMTP\r\n")
                .await
                .unwrap();
            socket
        };
        let (client, _socket) = tokio::join!(connector.connect(), server);
        assert!(matches!(client, Err(Error::Tls(_))));
    }
}
