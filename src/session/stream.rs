//! The session transport: plain TCP or TLS, switchable mid-session.
//!
//! Clients may negotiate TLS at three points: before startup, while the
//! server waits for their password, or from the ready state. All three
//! funnel through [`SessionStream::upgrade`], which swaps the transport in
//! place; after the swap no further plaintext byte is written.

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::errors::Error;

pin_project! {
    #[project = SessionStreamProj]
    pub enum SessionStream {
        Plain {
            #[pin]
            stream: TcpStream,
        },
        Tls {
            #[pin]
            stream: tokio_native_tls::TlsStream<TcpStream>,
        },
        // Transient placeholder while an upgrade owns the transport.
        Detached,
    }
}

impl SessionStream {
    pub fn plain(stream: TcpStream) -> SessionStream {
        SessionStream::Plain { stream }
    }

    pub fn tls(stream: tokio_native_tls::TlsStream<TcpStream>) -> SessionStream {
        SessionStream::Tls { stream }
    }

    pub fn is_plain(&self) -> bool {
        matches!(self, SessionStream::Plain { .. })
    }

    /// Wrap the transport in TLS. Anything but a plain stream passes through
    /// untouched.
    pub async fn upgrade(
        self,
        acceptor: &tokio_native_tls::TlsAcceptor,
    ) -> Result<SessionStream, Error> {
        match self {
            SessionStream::Plain { stream } => {
                let stream = acceptor.accept(stream).await.map_err(Error::Tls)?;
                Ok(SessionStream::Tls { stream })
            }
            other => Ok(other),
        }
    }
}

fn detached_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "session transport is detached",
    )
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            SessionStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            SessionStreamProj::Tls { stream } => stream.poll_read(cx, buf),
            SessionStreamProj::Detached => std::task::Poll::Ready(Err(detached_error())),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.project() {
            SessionStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            SessionStreamProj::Tls { stream } => stream.poll_write(cx, buf),
            SessionStreamProj::Detached => std::task::Poll::Ready(Err(detached_error())),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            SessionStreamProj::Plain { stream } => stream.poll_flush(cx),
            SessionStreamProj::Tls { stream } => stream.poll_flush(cx),
            SessionStreamProj::Detached => std::task::Poll::Ready(Err(detached_error())),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            SessionStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            SessionStreamProj::Tls { stream } => stream.poll_shutdown(cx),
            SessionStreamProj::Detached => std::task::Poll::Ready(Err(detached_error())),
        }
    }
}
