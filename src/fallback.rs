//! Camouflage forwarder
//!
//! Consumes the fallback listener and relays every connection that failed
//! authentication to a real web server, so scanners see an ordinary site.

use std::io;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::ConnConfig;
use crate::core::{relay_tcp, FallbackListener};
use crate::error::{Error, Result};
use crate::logger::log;
use crate::transport::TransportStream;

/// Forward handed-off connections to `upstream` until the listener closes.
pub async fn forward(
    listener: FallbackListener,
    upstream: String,
    conn_config: ConnConfig,
    cancel: CancellationToken,
) -> Result<()> {
    log::info!(upstream = %upstream, "Fallback forwarder started");

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(Error::ListenerClosed) => break,
            Err(e) => return Err(e),
        };

        let upstream = upstream.clone();
        tokio::spawn(async move {
            let peer = peer_addr.to_string();
            match forward_one(stream, &upstream, &conn_config).await {
                Ok((received, sent)) => {
                    log::debug!(peer = %peer, up = sent, down = received, "Fallback relay finished")
                }
                Err(e) => log::debug!(peer = %peer, error = %e, "Fallback relay failed"),
            }
        });
    }

    log::info!("Fallback forwarder stopped");
    Ok(())
}

async fn forward_one(
    stream: TransportStream,
    upstream: &str,
    conn_config: &ConnConfig,
) -> Result<(u64, u64)> {
    let remote = match tokio::time::timeout(conn_config.connect_timeout, TcpStream::connect(upstream)).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(source)) => {
            return Err(Error::Dial {
                target: upstream.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(Error::Dial {
                target: upstream.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };

    relay_tcp(
        stream,
        remote,
        conn_config.relay_shutdown_wait,
        conn_config.buffer_size,
    )
    .await
    .into_result()
}
