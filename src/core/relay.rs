//! Bidirectional TCP relay with bounded shutdown
//!
//! Each direction runs `tokio::io::copy` into a byte-counting writer, which
//! flushes whenever the source has nothing more to read. When one direction
//! ends (end of stream or error) it arms a deadline on the other direction and
//! half-closes its destination, so a peer that never closes cannot keep the
//! relay alive for longer than one deadline window.

use pin_project_lite::pin_project;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::{Direction, Error, Result};
use crate::logger::log;

/// Default window a still-running copy loop gets after its peer finished
pub const DEFAULT_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Outcome of one relay invocation
#[derive(Debug)]
pub struct RelayResult {
    /// Bytes that travelled right -> left (target to client)
    pub received: u64,
    /// Bytes that travelled left -> right (client to target)
    pub sent: u64,
    /// First genuine error, deadline noise excluded
    pub error: Option<Error>,
}

impl RelayResult {
    pub(crate) fn failed(error: Error) -> Self {
        Self {
            received: 0,
            sent: 0,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// `(received, sent)` on success, the terminal error otherwise.
    pub fn into_result(self) -> Result<(u64, u64)> {
        match self.error {
            None => Ok((self.received, self.sent)),
            Some(e) => Err(e),
        }
    }
}

/// Marker carried inside the I/O error produced when a read deadline passes.
#[derive(Debug)]
struct DeadlineExceeded;

impl fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("read deadline exceeded")
    }
}

impl std::error::Error for DeadlineExceeded {}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, DeadlineExceeded)
}

fn is_deadline_exceeded(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<DeadlineExceeded>())
}

/// Run `copy` until it completes, or until `wait` after `peer_done` fires.
async fn with_deadline<F>(copy: F, peer_done: &CancellationToken, wait: Duration) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    let deadline = async {
        peer_done.cancelled().await;
        tokio::time::sleep(wait).await;
    };
    tokio::select! {
        result = copy => result,
        _ = deadline => Err(deadline_exceeded()),
    }
}

pin_project! {
    /// Writer that counts the bytes its inner writer accepted
    struct CountingWriter<W> {
        #[pin]
        inner: W,
        written: u64,
    }
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: AsyncWrite> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            *this.written += *n as u64;
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Copy one direction to end of stream, then arm the peer deadline and
/// half-close the destination.
///
/// Returns the copy outcome and the number of bytes written.
async fn copy_one_way<R, W>(
    reader: R,
    writer: W,
    direction: Direction,
    buffer_size: usize,
    peer_done: &CancellationToken,
    done: &CancellationToken,
    wait: Duration,
) -> (io::Result<()>, u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::with_capacity(buffer_size, reader);
    let mut writer = CountingWriter::new(writer);

    let result = with_deadline(
        async { tokio::io::copy(&mut reader, &mut writer).await.map(drop) },
        peer_done,
        wait,
    )
    .await;
    done.cancel();

    match tokio::time::timeout(wait, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!(direction = %direction, error = %e, "Half-close failed"),
        Err(_) => log::debug!(direction = %direction, "Half-close timed out"),
    }
    (result, writer.written)
}

/// Relay `left` (client side) and `right` (target side) in both directions.
pub async fn relay_tcp<L, R>(left: L, right: R, wait: Duration, buffer_size: usize) -> RelayResult
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (left_r, left_w) = tokio::io::split(left);
    let (right_r, right_w) = tokio::io::split(right);

    // Fired when the corresponding direction has finished copying
    let upstream_done = CancellationToken::new();
    let downstream_done = CancellationToken::new();

    let upstream = copy_one_way(
        left_r,
        right_w,
        Direction::LeftToRight,
        buffer_size,
        &downstream_done,
        &upstream_done,
        wait,
    );
    let downstream = copy_one_way(
        right_r,
        left_w,
        Direction::RightToLeft,
        buffer_size,
        &upstream_done,
        &downstream_done,
        wait,
    );

    let ((up, sent), (down, received)) = tokio::join!(upstream, downstream);

    let error = match (up, down) {
        (Err(e), _) if !is_deadline_exceeded(&e) => Some(Error::Relay {
            direction: Direction::LeftToRight,
            source: e,
        }),
        (_, Err(e)) if !is_deadline_exceeded(&e) => Some(Error::Relay {
            direction: Direction::RightToLeft,
            source: e,
        }),
        _ => None,
    };

    RelayResult {
        received,
        sent,
        error,
    }
}
