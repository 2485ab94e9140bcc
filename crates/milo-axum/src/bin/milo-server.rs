use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use milo_axum::{Milo, ServerConfig};
use milo_billing::ProductCatalog;
use milo_store::StoreClient;

/// milo backend: auth storage, billing webhooks and feature gating over HTTP
#[derive(Parser)]
#[command(name = "milo-server", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML config file; `MILO_*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,

    /// Insert the default plans into an empty product catalog
    Seed,

    /// Delete expired sessions, verifications and cache entries once
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    milo_core::env::init_logger();
    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref())?;

    let client = Arc::new(
        StoreClient::connect(&config.store)
            .await
            .context("failed to connect to the document store")?,
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(client, config).await,
        Commands::Seed => {
            let inserted = ProductCatalog::new(client).seed_default_products().await?;
            info!(inserted, "catalog seed finished");
            Ok(())
        }
        Commands::Sweep => {
            let milo = Milo::new(client, &config);
            let report = milo.state().adapter.sweep_expired(Utc::now()).await?;
            let cache = milo.state().cache.cleanup_expired().await?;
            info!(
                sessions = report.sessions,
                verifications = report.verifications,
                cache,
                "sweep finished"
            );
            Ok(())
        }
    }
}

async fn serve(client: Arc<StoreClient>, config: ServerConfig) -> Result<()> {
    if config.billing.seed_products {
        ProductCatalog::new(client.clone()).seed_default_products().await?;
    }
    if config.billing.webhook_secret.is_none() {
        tracing::warn!("no webhook secret configured; only signature presence is checked");
    }

    let milo = Milo::new(client, &config);
    if config.server.sweep_interval_secs > 0 {
        milo.spawn_expiry_sweeper(Duration::from_secs(config.server.sweep_interval_secs));
    }

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, backend = ?config.store.backend, "milo server listening");

    axum::serve(listener, milo.router_with_cors())
        .with_graceful_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutting down"),
                Err(e) => error!(error = %e, "failed to listen for the shutdown signal"),
            }
        })
        .await?;
    Ok(())
}
