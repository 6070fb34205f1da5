//! Pipe-pair adapter: one read stream plus one write stream as a duplex.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A child's stdout/stdin seen from the parent, or a process's own
/// stdin/stdout seen from itself.
pub struct PipePair<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> PipePair<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for PipePair<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for PipePair<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_reads_and_writes_go_to_separate_pipes() {
        let (reader, mut upstream) = tokio::io::duplex(64);
        let (writer, mut downstream) = tokio::io::duplex(64);
        let mut pair = PipePair::new(reader, writer);

        upstream.write_all(b"in").await.unwrap();
        pair.write_all(b"out").await.unwrap();
        pair.shutdown().await.unwrap();

        let mut inbound = [0u8; 2];
        pair.read_exact(&mut inbound).await.unwrap();
        assert_eq!(&inbound, b"in");

        let mut outbound = Vec::new();
        downstream.read_to_end(&mut outbound).await.unwrap();
        assert_eq!(outbound, b"out");
    }
}
