//! One forwarding session: a client TCP connection bridged to the local socket.
//!
//! The session ends as soon as either copy direction finishes (EOF or
//! error) or the proxy shuts down. Both streams are dropped on the way out,
//! which closes both connections and cancels the other direction.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::stats::ProxyStats;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
enum SessionEnd {
    ClientClosed(io::Result<u64>),
    BackendClosed(io::Result<u64>),
    Shutdown,
}

/// Copy until EOF, counting bytes as they are written.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Run one session to completion. Never returns an error: failures end the
/// session and are logged.
pub(crate) async fn forward(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    socket_path: &Path,
    stats: &ProxyStats,
    mut shutdown: watch::Receiver<bool>,
) {
    let dialed = tokio::select! {
        dialed = UnixStream::connect(socket_path) => dialed,
        _ = shutdown.wait_for(|down| *down) => {
            stats.session_closed();
            return;
        }
    };

    let mut backend = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            stats.dial_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer_addr = %peer_addr,
                socket = %socket_path.display(),
                error = %e,
                "Failed to dial VNC socket, closing client"
            );
            let _ = client.shutdown().await;
            stats.session_closed();
            return;
        }
    };
    debug!(peer_addr = %peer_addr, "Session established");

    let end = {
        let (mut client_read, mut client_write) = client.split();
        let (mut backend_read, mut backend_write) = backend.split();

        tokio::select! {
            copied = copy_counted(&mut client_read, &mut backend_write, &stats.bytes_to_backend) => {
                SessionEnd::ClientClosed(copied)
            }
            copied = copy_counted(&mut backend_read, &mut client_write, &stats.bytes_to_client) => {
                SessionEnd::BackendClosed(copied)
            }
            _ = shutdown.wait_for(|down| *down) => SessionEnd::Shutdown,
        }
    };

    match &end {
        SessionEnd::ClientClosed(Ok(bytes)) => {
            debug!(peer_addr = %peer_addr, bytes_to_backend = bytes, "Client closed session")
        }
        SessionEnd::BackendClosed(Ok(bytes)) => {
            debug!(peer_addr = %peer_addr, bytes_to_client = bytes, "VNC socket closed session")
        }
        SessionEnd::ClientClosed(Err(e)) | SessionEnd::BackendClosed(Err(e)) => {
            debug!(peer_addr = %peer_addr, error = %e, "Session ended with I/O error")
        }
        SessionEnd::Shutdown => debug!(peer_addr = %peer_addr, "Session closed by shutdown"),
    }

    drop(backend);
    drop(client);
    stats.session_closed();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_counted_counts_every_byte() {
        let counter = AtomicU64::new(0);
        let data = vec![7u8; 100_000];
        let mut reader = &data[..];
        let mut out = Vec::new();

        let copied = copy_counted(&mut reader, &mut out, &counter).await.unwrap();

        assert_eq!(copied, 100_000);
        assert_eq!(counter.load(Ordering::Relaxed), 100_000);
        assert_eq!(out, data);
    }
}
