//! The backend connector: a `tower::Service<Uri>` that always dials the
//! resolved backend `(proto, endpoint)` — never the URI it's handed — and
//! optionally wraps the transport in TLS using the backend's own,
//! independent trust domain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::addr::Proto;
use crate::error::ForwardError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(90);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Either side of the backend transport, with or without TLS, behind a
/// single `AsyncRead`/`AsyncWrite` implementation.
pub enum BackendStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    TcpTls(Box<TlsStream<TcpStream>>),
    UnixTls(Box<TlsStream<UnixStream>>),
}

macro_rules! delegate {
    ($self:ident, $method:ident, $cx:ident $(, $arg:ident)*) => {
        match $self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).$method($cx $(, $arg)*),
            BackendStream::Unix(s) => Pin::new(s).$method($cx $(, $arg)*),
            BackendStream::TcpTls(s) => Pin::new(s.as_mut()).$method($cx $(, $arg)*),
            BackendStream::UnixTls(s) => Pin::new(s.as_mut()).$method($cx $(, $arg)*),
        }
    };
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        delegate!(self, poll_read, cx, buf)
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        delegate!(self, poll_write, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        delegate!(self, poll_flush, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        delegate!(self, poll_shutdown, cx)
    }
}

impl Connection for BackendStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

fn apply_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    sock_ref.set_tcp_keepalive(&keepalive)
}

/// `tower::Service<Uri>` implementation that always connects to the
/// resolved backend address, ignoring the URI's own host/port.
#[derive(Clone)]
pub struct BackendConnector {
    proto: Proto,
    endpoint: String,
    tls: Option<Arc<rustls::ClientConfig>>,
    /// Server name used for the TLS handshake and SNI; `localhost` for
    /// unix backends, the backend host otherwise (mirrors the `Host`
    /// header rewrite rule in the forwarding engine).
    tls_server_name: String,
}

impl BackendConnector {
    pub fn new(
        proto: Proto,
        endpoint: String,
        tls: Option<Arc<rustls::ClientConfig>>,
        tls_server_name: String,
    ) -> Self {
        Self {
            proto,
            endpoint,
            tls,
            tls_server_name,
        }
    }

    async fn connect(self) -> Result<BackendStream, ForwardError> {
        match self.proto {
            Proto::Tcp => {
                let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.endpoint))
                    .await
                    .map_err(|_| {
                        ForwardError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "timed out connecting to backend",
                        ))
                    })??;
                apply_keepalive(&tcp)?;

                match &self.tls {
                    Some(tls_config) => {
                        let connector = TlsConnector::from(tls_config.clone());
                        let name = ServerName::try_from(self.tls_server_name.clone())
                            .map_err(|_| {
                                ForwardError::Io(std::io::Error::new(
                                    std::io::ErrorKind::InvalidInput,
                                    "invalid TLS server name",
                                ))
                            })?;
                        let tls = tokio::time::timeout(
                            TLS_HANDSHAKE_TIMEOUT,
                            connector.connect(name, tcp),
                        )
                        .await
                        .map_err(|_| {
                            ForwardError::Io(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "timed out performing TLS handshake with backend",
                            ))
                        })??;
                        Ok(BackendStream::TcpTls(Box::new(tls)))
                    }
                    None => Ok(BackendStream::Tcp(tcp)),
                }
            }
            Proto::Unix => {
                let unix =
                    tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.endpoint))
                        .await
                        .map_err(|_| {
                            ForwardError::Io(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "timed out connecting to backend",
                            ))
                        })??;

                match &self.tls {
                    Some(tls_config) => {
                        let connector = TlsConnector::from(tls_config.clone());
                        let name = ServerName::try_from(self.tls_server_name.clone())
                            .map_err(|_| {
                                ForwardError::Io(std::io::Error::new(
                                    std::io::ErrorKind::InvalidInput,
                                    "invalid TLS server name",
                                ))
                            })?;
                        let tls = tokio::time::timeout(
                            TLS_HANDSHAKE_TIMEOUT,
                            connector.connect(name, unix),
                        )
                        .await
                        .map_err(|_| {
                            ForwardError::Io(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "timed out performing TLS handshake with backend",
                            ))
                        })??;
                        Ok(BackendStream::UnixTls(Box::new(tls)))
                    }
                    None => Ok(BackendStream::Unix(unix)),
                }
            }
        }
    }
}

impl tower_service::Service<Uri> for BackendConnector {
    type Response = TokioIo<BackendStream>;
    type Error = ForwardError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.connect().await.map(TokioIo::new) })
    }
}
