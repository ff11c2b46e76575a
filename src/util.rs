use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

pub(crate) use self::rewind::Rewind;

mod rewind;

/// A duplex byte stream the proxy can relay through.
///
/// Implementations may override [`tune`](RelayStream::tune) to apply the
/// socket options expected of long-lived full-duplex connections. The
/// default is a no-op, which suits in-memory streams and TLS wrappers where
/// the host owns the underlying transport.
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Applies long-lived-connection options to the underlying socket.
    fn tune(&self) -> io::Result<()> {
        Ok(())
    }
}

impl RelayStream for TcpStream {
    fn tune(&self) -> io::Result<()> {
        self.set_nodelay(true)?;
        socket2::SockRef::from(self).set_keepalive(true)
    }
}

#[cfg(unix)]
impl RelayStream for tokio::net::UnixStream {}

impl RelayStream for tokio::io::DuplexStream {}

/// Relays bytes in both directions until either side closes or errors.
///
/// Returns the byte counts (client-to-upstream, upstream-to-client).
pub(crate) async fn relay_bidi(
    client: &mut (impl AsyncRead + AsyncWrite + Send + Unpin),
    upstream: &mut (impl AsyncRead + AsyncWrite + Send + Unpin),
) -> io::Result<(u64, u64)> {
    let result = tokio::io::copy_bidirectional(client, upstream).await;
    trace!(?result, "bidirectional relay finished");
    result
}
