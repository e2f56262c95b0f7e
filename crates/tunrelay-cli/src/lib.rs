//! tunrelay command-line front end
//!
//! Parses arguments, installs logging and the rustls crypto provider, then
//! runs the selected server until Ctrl-C.

pub mod cli;

pub use cli::{Cli, Commands, GlobalArgs};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunrelay_cert::Certificate;
use tunrelay_server_http::{HttpProxyConfig, HttpProxyServer};
use tunrelay_server_tls::{TlsServer, TlsServerConfig};

/// Run the command described by `cli`.
///
/// Returns `Ok` after a clean shutdown and an error for startup failures
/// or a fatal accept error.
pub async fn run(cli: Cli) -> Result<()> {
    init_logging(&cli.global.log_level)?;
    tunrelay_cert::install_crypto_provider();

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_ctrl_c(shutdown.clone()));

    let relay = cli.global.relay_config();
    match cli.command {
        Commands::Tls {
            listen,
            cert,
            key,
            secret,
        } => {
            let acceptor = Certificate::from_pem_files(&cert, &key)
                .and_then(Certificate::into_acceptor)
                .context("Failed to load TLS certificate")?;
            let config = TlsServerConfig {
                listen,
                secret: secret.filter(|s| !s.is_empty()),
                relay,
            };
            TlsServer::new(config, acceptor)
                .start(shutdown)
                .await
                .context("TLS tunnel server failed")?;
        }
        Commands::Http {
            listen,
            cert,
            key,
            credentials,
        } => {
            let config = HttpProxyConfig {
                listen,
                credentials: credentials.filter(|c| !c.is_empty()),
                relay,
                ..HttpProxyConfig::default()
            };
            let mut server = HttpProxyServer::new(config);
            if let (Some(cert), Some(key)) = (cert, key) {
                let acceptor = Certificate::from_pem_files(&cert, &key)
                    .and_then(Certificate::into_acceptor)
                    .context("Failed to load TLS certificate")?;
                server = server.with_tls(acceptor);
            }
            server
                .start(shutdown)
                .await
                .context("HTTP proxy server failed")?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn watch_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
    }
    shutdown.cancel();
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
