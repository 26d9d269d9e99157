mod config;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{load_operations, Config};
use docx_remote_control::http::{
    HttpBatchExecutor, HttpSessionBackend, HttpTransport, StaticCredentials,
};
use docx_remote_control::{CredentialSource, ExecuteOptions, RemoteClient, RemoteTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let control = config.control_config();

    info!("Starting docx-remote-control");
    info!("  Base URL: {}", config.base_url);
    info!("  Resource: {}", config.resource);
    info!("  Persist: {}", config.persist());
    info!(
        "  Batches: {} ops / {} bytes, {} in parallel",
        control.batch.max_count, control.batch.max_bytes, control.batch.parallelism
    );

    let operations = load_operations(&config.operations)?;
    info!("Loaded {} operations", operations.len());

    // Transport and remote contracts
    let credentials: Arc<dyn CredentialSource> =
        Arc::new(StaticCredentials::new(config.access_token.clone()));
    let transport: Arc<dyn RemoteTransport> = Arc::new(
        HttpTransport::new(config.base_url.clone(), config.request_timeout())?
            .with_credentials(credentials.clone(), config.scopes.clone()),
    );
    let sessions = Arc::new(HttpSessionBackend::new(transport.clone(), control.lease.ttl));
    let executor = Arc::new(HttpBatchExecutor::new(transport));

    let client = RemoteClient::builder(sessions, executor)
        .config(control)
        .credentials(credentials)
        .build()?;
    let reaper = client.spawn_reaper();

    let options = match config.deadline() {
        Some(deadline) => ExecuteOptions::with_deadline(Instant::now() + deadline),
        None => ExecuteOptions::default(),
    };

    let mut shutdown_rx = create_shutdown_signal();
    let report = tokio::select! {
        report = client.submit_batch_with(&config.resource, config.persist(), operations, options) => Some(report),
        _ = shutdown_rx.wait_for(|&v| v) => {
            warn!("Shutdown requested before the submission finished");
            None
        }
    };

    let released = client.shutdown().await;
    reaper.abort();
    info!("Closed {} sessions", released);

    let Some(report) = report else {
        anyhow::bail!("submission interrupted");
    };
    println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    info!(
        "Done: {} succeeded, {} failed",
        report.success_count, report.failure_count
    );

    if report.failure_count > 0 {
        std::process::exit(2);
    }
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
