use anyhow::Context;
use certkeeper::manager::CertManager;
use certkeeper::{config, rest};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "certkeeperd", version, about = "ACME certificate lifecycle daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CERTKEEPER_CONFIG")]
    config: PathBuf,
    /// Override the REST listen address from the configuration file
    #[arg(long, env = "CERTKEEPER_LISTEN")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CERTKEEPER_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut initial_config = config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        initial_config.rest.listen = listen;
    }
    let listen = initial_config.rest.listen;
    let manager = Arc::new(CertManager::new(initial_config.clone())?);

    // Reconciliation against the CA may fail transiently at boot; the
    // checker retries on its error schedule, so keep running.
    if let Err(e) = manager.apply_config(initial_config).await {
        error!("Initial certificate reconciliation failed: {e:#}");
    }

    let shutdown = CancellationToken::new();
    let rest_server = tokio::spawn(rest::serve(manager.clone(), listen, shutdown.clone()));

    let mut sighup = signal(SignalKind::hangup()).context("Installing SIGHUP handler failed")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Waiting for shutdown signal failed")?;
                info!("Shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("Reloading configuration from {}", cli.config.display());
                match config::load(&cli.config) {
                    Ok(mut new_config) => {
                        if let Some(listen) = cli.listen {
                            new_config.rest.listen = listen;
                        }
                        if new_config.rest.listen != listen {
                            info!("Changing the REST listen address requires a restart");
                        }
                        if let Err(e) = manager.apply_config(new_config).await {
                            error!("Configuration reload failed: {e:#}");
                        }
                    }
                    Err(e) => error!("Could not read the configuration file: {e:#}"),
                }
            }
        }
    }

    shutdown.cancel();
    manager.stop_scheduler();
    rest_server
        .await
        .context("REST server task panicked")??;
    Ok(())
}
