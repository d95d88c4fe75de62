mod auth;
mod backend;
mod cli;
mod config;
mod credentials;
mod errors;
mod launch;
mod pool;
#[cfg(test)]
mod pool_tests;
mod server;
mod sidecar;
mod template;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{BackendSpec, Catalog, RuntimeOptions};
use crate::credentials::CredentialStore;
use crate::pool::ClientPool;

/// Shared startup: logging, catalog, runtime config, operator options.
struct Initialized {
    catalog: Arc<Catalog>,
    config: Arc<config::BackendConfig>,
    options: RuntimeOptions,
}

fn initialize(cli: &cli::Cli) -> Result<Initialized> {
    let mut options = RuntimeOptions::from_env();
    options.verbose |= cli.verbose;

    // Logs go to stderr so the stdio protocol stream stays clean.
    let default_level = if options.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let catalog = Catalog::load(&cli.catalog)?;
    let config = if cli.config.is_file() {
        config::BackendConfig::load(&cli.config)?
    } else {
        config::BackendConfig::default()
    };

    info!(
        catalog = %cli.catalog.display(),
        backends = catalog.backends.len(),
        "fedgate starting"
    );

    Ok(Initialized {
        catalog: Arc::new(catalog),
        config: Arc::new(config),
        options,
    })
}

/// Serve the federation over stdio until the client disconnects or a
/// signal lands, then drain the pool.
async fn run_gateway(gw: Initialized, read_only: bool) -> Result<()> {
    let store = CredentialStore::default_local()?;
    let pool = ClientPool::new(gw.options.clone(), store);
    let cancel = CancellationToken::new();

    let gateway = server::GatewayServer::new(
        Arc::clone(&pool),
        Arc::clone(&gw.catalog),
        Arc::clone(&gw.config),
        read_only,
        cancel.clone(),
    );

    info!("starting MCP stdio server");
    let service = gateway.serve(stdio()).await?;

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = service.waiting() => {
                if let Err(e) = result {
                    warn!(error = %e, "MCP service exited with error");
                }
            }
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        service.waiting().await?;
    }

    info!("shutting down");
    cancel.cancel();
    pool.close().await;

    Ok(())
}

/// Drive the OAuth flow for one remote backend. Best-effort by design:
/// the outcome is reported, never retried.
async fn run_authorize(gw: Initialized, server: &str) -> Result<()> {
    let spec = gw
        .catalog
        .get(server)
        .with_context(|| format!("backend '{server}' is not in the catalog"))?;
    let BackendSpec::Remote(remote) = spec else {
        bail!("backend '{server}' is a container image; only remote backends use OAuth");
    };

    let store = CredentialStore::default_local()?;
    let orchestrator = auth::AuthOrchestrator::new(store, gw.options.callback_port)?;
    let cancel = CancellationToken::new();

    match orchestrator.authorize(&cancel, remote).await? {
        auth::AuthorizeOutcome::NotRequired => {
            println!("{server}: no authorization required");
        }
        auth::AuthorizeOutcome::Completed => {
            println!("{server}: authorization complete");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let gw = initialize(&cli)?;

    match &cli.command {
        None => run_gateway(gw, false).await,
        Some(cli::Command::Run {
            static_containers,
            force_retain,
            read_only,
            network,
        }) => {
            let mut gw = gw;
            gw.options.static_containers = *static_containers;
            gw.options.force_retain = *force_retain;
            gw.options.networks.extend(network.iter().cloned());
            run_gateway(gw, *read_only).await
        }
        Some(cli::Command::Authorize { server }) => run_authorize(gw, server).await,
    }
}
