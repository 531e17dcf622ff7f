//! Byte-count hooks around async readers and writers.
//!
//! Used by the client to account transferred bytes for progress
//! reporting without the pipeline knowing about it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Reader wrapper invoking a callback with the size of every read.
#[derive(Debug)]
pub struct CallbackReader<R, F> {
    inner: R,
    callback: F,
}

impl<R, F> CallbackReader<R, F> {
    pub fn new(inner: R, callback: F) -> Self {
        Self { inner, callback }
    }
}

impl<R, F> AsyncRead for CallbackReader<R, F>
where
    R: AsyncRead + Unpin,
    F: FnMut(usize) + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                (me.callback)(buf.filled().len() - before);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Writer wrapper invoking a callback with the size of every write.
#[derive(Debug)]
pub struct CallbackWriter<W, F> {
    inner: W,
    callback: F,
}

impl<W, F> CallbackWriter<W, F> {
    pub fn new(inner: W, callback: F) -> Self {
        Self { inner, callback }
    }
}

impl<W, F> AsyncWrite for CallbackWriter<W, F>
where
    W: AsyncWrite + Unpin,
    F: FnMut(usize) + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                (me.callback)(n);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_reader_counts_bytes() {
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let mut reader = CallbackReader::new(&b"hello world"[..], move |n| {
            c2.fetch_add(n, Ordering::Relaxed);
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(count.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn test_writer_counts_bytes() {
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let mut writer = CallbackWriter::new(Vec::new(), move |n| {
            c2.fetch_add(n, Ordering::Relaxed);
        });

        writer.write_all(b"abcde").await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }
}
