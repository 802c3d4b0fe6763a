//! A forwarded connection
//!
//! Pairs an accepted client socket with its backend socket and copies bytes
//! in both directions. End of stream on one side becomes a write shutdown on
//! the other, so the side that is still open can finish sending.

use std::io;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy buffer size per direction
pub const BUFFER_SIZE: usize = 8192;

/// Byte counters of a finished connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub duration: Duration,
}

pub struct Connection<C, B> {
    id: u64,
    peer: String,
    client: C,
    backend: B,
    opened_at: Instant,
}

impl<C, B> Connection<C, B>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: u64, peer: impl Into<String>, client: C, backend: B) -> Self {
        Self {
            id,
            peer: peer.into(),
            client,
            backend,
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Splice until both directions reach end of stream
    ///
    /// An I/O error in either direction ends the connection; both sockets are
    /// dropped on return.
    pub async fn run(self) -> io::Result<ConnectionStats> {
        let (client_rd, client_wr) = tokio::io::split(self.client);
        let (backend_rd, backend_wr) = tokio::io::split(self.backend);

        let (up, down) = tokio::try_join!(
            pipe(client_rd, backend_wr),
            pipe(backend_rd, client_wr),
        )?;

        tracing::trace!(conn = self.id, peer = %self.peer, up, down, "Both directions closed");

        Ok(ConnectionStats {
            client_to_backend: up,
            backend_to_client: down,
            duration: self.opened_at.elapsed(),
        })
    }
}

/// Copy one direction, then half-close the writer
async fn pipe<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut total = 0u64;

    loop {
        buffer.clear();
        let n = reader.read_buf(&mut buffer).await?;

        if n == 0 {
            match writer.shutdown().await {
                Ok(()) => {}
                // peer already gone, nothing left to signal
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e),
            }
            return Ok(total);
        }

        writer.write_all(&buffer).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_pipe_counts_and_half_closes() {
        let (mut src, src_peer) = duplex(64);
        let (dst_peer, mut dst) = duplex(64);

        src.write_all(b"hello world").await.unwrap();
        src.shutdown().await.unwrap();

        let copied = pipe(src_peer, dst_peer).await.unwrap();
        assert_eq!(copied, 11);

        let mut out = Vec::new();
        dst.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_run_allows_reply_after_client_half_close() {
        let (mut client, client_side) = duplex(1024);
        let (backend_side, mut backend) = duplex(1024);

        let conn = Connection::new(7, "test", client_side, backend_side);
        assert_eq!(conn.id(), 7);
        let task = tokio::spawn(conn.run());

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        // backend sees the whole request and then EOF
        let mut request = Vec::new();
        backend.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // and can still answer
        backend.write_all(b"response").await.unwrap();
        backend.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, 7);
        assert_eq!(stats.backend_to_client, 8);
    }
}
