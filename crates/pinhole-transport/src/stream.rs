//! Relay stream: a TCP or TLS connection with uniform semantics

use crate::error::{TransportError, TransportResult};
use crate::security::TransportSecurityConfig;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Keep-alive probe interval applied to every established leg
pub const KEEP_ALIVE_PROBE: Duration = Duration::from_secs(120);

/// A single leg of a relay pairing, plaintext or TLS
pub enum RelayStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayStream::Tcp(s) => f.debug_tuple("Tcp").field(&s.peer_addr()).finish(),
            RelayStream::Tls(s) => f
                .debug_tuple("Tls")
                .field(&s.get_ref().0.peer_addr())
                .finish(),
        }
    }
}

impl RelayStream {
    /// Common name of the verified peer certificate, if the peer sent one.
    ///
    /// Only meaningful on the server side of a TLS leg that requested a
    /// client certificate; returns `None` everywhere else.
    pub fn peer_certificate_cn(&self) -> Option<String> {
        let RelayStream::Tls(stream) = self else {
            return None;
        };
        let (_, state) = stream.get_ref();
        let cert = state.peer_certificates()?.first()?;
        common_name_from_der(cert.as_ref())
    }
}

/// Extract the subject common name from a DER-encoded certificate
pub fn common_name_from_der(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    cn
}

/// Enable TCP keep-alive with the fixed probe interval
pub fn set_keep_alive(stream: &TcpStream) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEP_ALIVE_PROBE);
    sock.set_tcp_keepalive(&keepalive)
}

/// Open a connection to `host:port` over the configured transport.
///
/// Keep-alive is enabled on the underlying TCP stream before any TLS
/// handshake. No retries happen here.
pub async fn connect(
    host: &str,
    port: u16,
    security: &TransportSecurityConfig,
) -> TransportResult<RelayStream> {
    let stream = TcpStream::connect((host, port)).await?;
    set_keep_alive(&stream)?;

    if !security.tls {
        debug!("Connected to {}:{} over TCP", host, port);
        return Ok(RelayStream::Tcp(stream));
    }

    let connector = security.build_tls_connector()?;
    let server_name = security
        .server_name
        .clone()
        .unwrap_or_else(|| host.to_string());
    let server_name = rustls::pki_types::ServerName::try_from(server_name)
        .map_err(|e| TransportError::ConfigurationError(format!("Invalid server name: {}", e)))?;

    let tls_stream = connector.connect(server_name, stream).await?;
    debug!("Connected to {}:{} over TLS", host, port);

    Ok(RelayStream::Tls(Box::new(tls_stream.into())))
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RelayStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
