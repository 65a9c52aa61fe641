use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use trojan_cloak::config::{CliArgs, Config};
use trojan_cloak::core::Server;
use trojan_cloak::logger::{self, log, LogLevel};
use trojan_cloak::{fallback, tls};

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls
    // This must be done before any TLS operations
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    let cli = CliArgs::parse_args();
    let config = Config::load(&cli.config)?;

    let level = match cli.log_level.as_deref() {
        Some(s) => LogLevel::parse(s).with_context(|| format!("unknown log level '{}'", s))?,
        None => config.log_level(),
    };
    logger::init_logger(level);

    config.validate()?;
    let tls_config = tls::load_tls_config(&config.ssl.cert, &config.ssl.key, &config.ssl.alpn)
        .context("failed to load TLS certificate")?;

    if cli.test {
        log::info!(config = %cli.config.display(), "Configuration OK");
        return Ok(());
    }

    let authenticator = config.authenticator()?;
    log::info!(credentials = authenticator.len(), "Credentials loaded");

    let conn_config = config.conn_config();
    let server = Server::builder()
        .listen_addr(config.listen_addr()?)
        .tls_config(tls_config)
        .authenticator(Arc::new(authenticator))
        .conn_config(conn_config)
        .bind()
        .context("failed to start server")?;

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();
    let cancel_token_clone = cancel_token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigint, mut sigterm) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                    _ => {
                        log::error!("Failed to set up signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        cancel_token_clone.cancel();
    });

    let forwarder = tokio::spawn(fallback::forward(
        server.fallback_listener(),
        config.fallback_addr.clone(),
        conn_config,
        cancel_token.clone(),
    ));

    server.serve(cancel_token).await?;

    match forwarder.await {
        Ok(result) => result?,
        Err(e) => log::warn!(error = %e, "Fallback forwarder task failed"),
    }
    Ok(())
}
