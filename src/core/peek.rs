//! Capture-and-replay stream wrapper
//!
//! While capturing, every byte handed to the reader is also kept in a buffer.
//! After `stop_capture` the kept bytes are served again, in order, before the
//! underlying stream is touched. This lets the handshake decoder read a
//! connection and, if authentication fails, give the very same byte stream to
//! the fallback consumer.

use bytes::{Buf, BytesMut};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Default)]
struct PeekBuffer {
    buf: BytesMut,
    // Bytes of `buf` already delivered to the reader
    pos: usize,
    capturing: bool,
}

impl PeekBuffer {
    fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn start(&mut self) {
        // Keep only what nobody has read yet; it stays ahead of new captures.
        self.buf.advance(self.pos);
        self.pos = 0;
        self.capturing = true;
    }

    fn stop(&mut self) {
        self.pos = 0;
        self.capturing = false;
        self.release_if_drained();
    }

    fn discard(&mut self) {
        self.buf = BytesMut::new();
        self.pos = 0;
        self.capturing = false;
    }

    fn release_if_drained(&mut self) {
        if !self.capturing && self.pos >= self.buf.len() {
            self.buf = BytesMut::new();
            self.pos = 0;
        }
    }
}

pin_project! {
    /// A stream that can record what it reads and play it back once.
    pub struct PeekableStream<S> {
        #[pin]
        inner: S,
        peek: PeekBuffer,
    }
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            peek: PeekBuffer::default(),
        }
    }

    /// Record every byte read from now on.
    pub fn start_capture(&mut self) {
        self.peek.start();
    }

    /// Stop recording and arm replay of everything recorded.
    pub fn stop_capture(&mut self) {
        self.peek.stop();
    }

    /// Stop recording and forget the recorded bytes without replaying them.
    pub fn discard_capture(&mut self) {
        self.peek.discard();
    }
}

impl<S: AsyncRead> AsyncRead for PeekableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let peek = this.peek;

        let pending = peek.pending();
        if !pending.is_empty() {
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            peek.pos += n;
            peek.release_if_drained();
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if peek.capturing {
            if let Poll::Ready(Ok(())) = &result {
                peek.buf.extend_from_slice(&buf.filled()[before..]);
                peek.pos = peek.buf.len();
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
