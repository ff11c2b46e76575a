//! A rewindable buffered wrapper for Tokio byte streams.
//!
//! [`Rewind`] pairs a stream with a front buffer. Bytes can be pushed back
//! in front of the stream, accumulated for head parsing, inspected, and
//! partially consumed; reads drain the buffer before falling through to the
//! inner stream, writes pass straight through.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

pub(crate) struct Rewind<S> {
    inner: S,
    buf: BytesMut,
    max_len: usize,
}

impl<S> Rewind<S> {
    pub(crate) fn new(inner: S, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_len,
        }
    }

    /// Wraps `inner` with `head` placed in front of everything it will yield.
    pub(crate) fn with_buffer(inner: S, head: Bytes, max_len: usize) -> Self {
        let mut buf = BytesMut::with_capacity(INITIAL_CAPACITY.max(head.len()));
        buf.extend_from_slice(&head);
        Self {
            inner,
            buf,
            max_len,
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Discards `n` bytes from the front of the buffer.
    pub(crate) fn discard(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Takes up to `n` buffered bytes from the front.
    pub(crate) fn take_buffered(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    pub(crate) fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> Rewind<S> {
    /// Buffers more data from the inner stream, up to the configured limit.
    pub(crate) async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn cursor(data: &'static [u8]) -> Cursor<&'static [u8]> {
        Cursor::new(data)
    }

    #[tokio::test]
    async fn buffer_more_reads_available_data() {
        let mut r = Rewind::new(cursor(b"abcdefgh"), usize::MAX);
        let n = r.buffer_more().await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(r.buffer(), b"abcdefgh");
    }

    #[tokio::test]
    async fn buffer_more_respects_max() {
        let mut r = Rewind::new(cursor(b"hello world"), 5);
        r.buffer_more().await.unwrap();
        assert_eq!(r.buffer(), b"hello");
        assert!(r.is_full());
        assert_eq!(r.buffer_more().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn buffer_more_eof() {
        let mut r = Rewind::new(cursor(b""), usize::MAX);
        assert_eq!(r.buffer_more().await.unwrap(), 0);
        assert_eq!(r.buffer(), b"");
    }

    #[tokio::test]
    async fn reads_drain_buffer_then_fall_through() {
        let mut r = Rewind::new(cursor(b"abcdef"), 4);
        r.buffer_more().await.unwrap();
        assert_eq!(r.buffer(), b"abcd");
        r.discard(2);
        assert_eq!(r.take_buffered(1), &b"c"[..]);

        let mut rest = Vec::new();
        r.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"def");
        assert_eq!(r.buffer(), b"");
    }

    #[tokio::test]
    async fn pushed_back_bytes_come_first() {
        let mut r = Rewind::with_buffer(cursor(b" world"), Bytes::from_static(b"hello"), usize::MAX);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn take_buffered_is_capped_at_buffer_len() {
        let mut r = Rewind::new(cursor(b"abc"), usize::MAX);
        r.buffer_more().await.unwrap();
        assert_eq!(r.take_buffered(usize::MAX), &b"abc"[..]);
        assert_eq!(r.take_buffered(usize::MAX), &b""[..]);
    }

    #[tokio::test]
    async fn writes_pass_through_to_the_inner_stream() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut r = Rewind::with_buffer(near, Bytes::from_static(b"buffered"), usize::MAX);
        r.write_all(b"sent").await.unwrap();
        r.flush().await.unwrap();

        let mut out = [0u8; 4];
        far.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"sent");

        // The pushback buffer is untouched by writes.
        assert_eq!(r.buffer(), b"buffered");
    }
}
