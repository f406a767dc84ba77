//! blobdrop -- single-file upload form backed by Azure Blob Storage.
//!
//! On SIGTERM/SIGINT the listener stops accepting connections and in-flight
//! uploads get `server.shutdown_timeout` seconds to finish.

use std::future::IntoFuture;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use blobdrop::config::{Config, SECRET_KEY_ENV};
use blobdrop::credential::ManagedIdentityCredential;
use blobdrop::flash::FlashSigner;
use blobdrop::storage::azure::AzureBlobBackend;
use blobdrop::storage::backend::StorageBackend;
use blobdrop::storage::memory::MemoryBackend;
use clap::Parser;
use tracing::{info, warn};

/// Command-line arguments for the blobdrop server.
#[derive(Parser, Debug)]
#[command(
    name = "blobdrop",
    version,
    about = "Upload form that stores files in Azure Blob Storage"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "blobdrop.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, config_found) = if Path::new(&cli.config).exists() {
        (blobdrop::config::load_config(&cli.config)?, true)
    } else {
        (Config::default(), false)
    };

    init_tracing(&config);
    if config_found {
        info!("Loaded configuration from {}", cli.config);
    } else {
        info!("No configuration at {}, using defaults", cli.config);
    }

    let bind_addr = cli.bind.unwrap_or_else(|| config.bind_addr());

    if config.observability.metrics {
        blobdrop::metrics::init_metrics()?;
        blobdrop::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let flash = match config.resolve_secret_key() {
        Some(secret) => FlashSigner::new(&secret),
        None => {
            warn!(
                "{} not set; flash messages are signed with a per-process key",
                SECRET_KEY_ENV
            );
            FlashSigner::ephemeral()
        }
    };

    let storage = build_storage(&config)?;

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(blobdrop::AppState::new(config, storage, flash));
    let app = blobdrop::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("blobdrop listening on {}", bind_addr);

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stop_tx.send(true);
        })
        .into_future();
    let deadline = async move {
        let _ = stop_rx.wait_for(|stopped| *stopped).await;
        tokio::time::sleep(shutdown_timeout).await;
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => {
            warn!(
                "In-flight requests still running after {}s, exiting",
                shutdown_timeout.as_secs()
            );
        }
    }

    info!("blobdrop shut down");

    Ok(())
}

/// Install the global subscriber.  `RUST_LOG` wins over `logging.level`.
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Pick the storage backend named by `storage.backend`.
fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let azure = &config.storage.azure;
    match config.storage.backend.as_str() {
        "azure" => {
            let credential = Arc::new(ManagedIdentityCredential::from_env(
                azure.managed_identity_client_id.clone(),
            )?);
            let backend =
                AzureBlobBackend::new(azure.endpoint_url(), azure.container.clone(), credential)?;
            Ok(Arc::new(backend))
        }
        "memory" => {
            info!(
                "In-memory storage backend initialized: container={}",
                azure.container
            );
            Ok(Arc::new(MemoryBackend::new(&azure.container, 0)))
        }
        other => anyhow::bail!("unknown storage.backend '{}' (expected azure or memory)", other),
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl+C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
