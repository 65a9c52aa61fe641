//! Fallback listener fed by connections that failed authentication
//!
//! The accept path pushes into a single-slot queue; an external consumer
//! (typically a web server or the built-in forwarder) accepts from
//! [`FallbackListener`] as if the connections had arrived on their own.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::transport::TransportStream;

/// Depth of the hand-off queue: at most one failed-auth connection in flight.
const HANDOFF_QUEUE_DEPTH: usize = 1;

type Handoff = (TransportStream, SocketAddr);

/// Create a connected sender/listener pair.
pub fn channel() -> (FallbackSender, FallbackListener) {
    let (tx, rx) = mpsc::channel(HANDOFF_QUEUE_DEPTH);
    let done = CancellationToken::new();
    let sender = FallbackSender {
        tx,
        done: done.clone(),
    };
    let listener = FallbackListener {
        shared: Arc::new(Shared {
            rx: Mutex::new(rx),
            done,
        }),
    };
    (sender, listener)
}

struct Shared {
    rx: Mutex<mpsc::Receiver<Handoff>>,
    done: CancellationToken,
}

/// Consumer side of the hand-off queue, with a listener-like contract.
#[derive(Clone)]
pub struct FallbackListener {
    shared: Arc<Shared>,
}

impl FallbackListener {
    /// Wait for the next handed-off connection.
    ///
    /// Returns [`Error::ListenerClosed`] once the listener has been closed.
    pub async fn accept(&self) -> Result<(TransportStream, SocketAddr)> {
        let done = &self.shared.done;
        if done.is_cancelled() {
            return Err(Error::ListenerClosed);
        }

        let mut rx = tokio::select! {
            biased;
            _ = done.cancelled() => return Err(Error::ListenerClosed),
            rx = self.shared.rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = done.cancelled() => Err(Error::ListenerClosed),
            handoff = rx.recv() => handoff.ok_or(Error::ListenerClosed),
        }
    }

    /// Close the listener. Pending and future `accept` calls return
    /// [`Error::ListenerClosed`]. Closing again has no effect.
    pub fn close(&self) {
        self.shared.done.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.done.is_cancelled()
    }
}

impl std::fmt::Debug for FallbackListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackListener")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Producer side, owned by the orchestrator.
#[derive(Clone)]
pub struct FallbackSender {
    tx: mpsc::Sender<Handoff>,
    done: CancellationToken,
}

impl FallbackSender {
    /// Push a connection to the fallback consumer.
    ///
    /// Waits at most `wait`, and gives up early when the listener is closed or
    /// `cancel` fires. On any error the connection has already been dropped,
    /// which closes it.
    pub async fn hand_off(
        &self,
        stream: TransportStream,
        peer_addr: SocketAddr,
        cancel: &CancellationToken,
        wait: Duration,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.done.cancelled() => Err(Error::ListenerClosed),
            _ = cancel.cancelled() => Err(Error::ListenerClosed),
            sent = tokio::time::timeout(wait, self.tx.send((stream, peer_addr))) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Error::ListenerClosed),
                Err(_) => Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "fallback hand-off timed out",
                ))),
            },
        }
    }
}
