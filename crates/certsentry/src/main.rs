//! Certsentry - Main entry point
//!
//! Unattended agent that keeps a TLS key/certificate pair synchronized from
//! a remote issuing service onto local storage and serves it live over TLS.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use certsentry::config::Config;
use certsentry::containers::{ContainerNotifier, ContainerRuntime, DockerRuntime, LifecycleAction};
use certsentry::fetch::RemoteFetcher;
use certsentry::reconcile::{
    OpensslPfxEncoder, ReconciliationEngine, StorageLayout, CERT_CHAIN_FILENAME, KEY_PEM_FILENAME,
};
use certsentry::schedule::{JobKind, Scheduler};
use certsentry::server::{HttpsServer, PushReceiver};
use certsentry::store::CertificateStore;

/// Upper bound on graceful shutdown before the process force-exits
const SHUTDOWN_GRACE: Duration = Duration::from_secs(120);

/// Certsentry - keeps TLS key/certificate material synchronized from a remote service
#[derive(Parser, Debug)]
#[command(name = "certsentry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CERTSENTRY_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting certsentry");

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        "new key/cert files will be permitted to write on {}",
        config.window.describe()
    );

    // storage directory must exist before anything reads or writes it
    if !config.storage_dir.exists() {
        fs::create_dir_all(&config.storage_dir)
            .context("failed to create cert storage directory")?;
        info!(dir = %config.storage_dir.display(), "cert storage directory created");
    }

    let store = Arc::new(CertificateStore::new());
    load_material_from_disk(&config, &store);

    let notifier = build_notifier(&config).await?;
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::clone(&store),
        StorageLayout::from_config(&config),
        Box::new(OpensslPfxEncoder),
        notifier,
    ));
    let fetcher =
        Arc::new(RemoteFetcher::from_config(&config).context("failed to build http client")?);

    // initial fetch; failure is tolerable as long as the disk gave us
    // something usable
    let fetched = match fetcher.fetch_pair().await {
        Ok((key_pem, cert_pem)) => match store.update(&key_pem, &cert_pem) {
            Ok(true) => {
                info!("initial key/cert pair fetched and installed");
                true
            }
            Ok(false) => {
                info!("remote key/cert pair identical to local material");
                true
            }
            Err(e) => {
                warn!(error = %e, "remote returned an unusable key/cert pair");
                false
            }
        },
        Err(e) => {
            warn!(error = %e, "initial fetch from remote failed");
            false
        }
    };

    if !store.has_valid_certificate() {
        bail!("no usable certificate from disk or remote, refusing to serve");
    }

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::new(
        config.window.clone(),
        Arc::clone(&store),
        Arc::clone(&engine),
        Arc::clone(&fetcher),
        shutdown.clone(),
    );

    if fetched {
        // write whatever is missing now; stale-but-present files wait for
        // the maintenance window
        if engine.reconcile(true).await {
            scheduler.schedule(JobKind::WriteToDisk);
        }
    } else {
        scheduler.schedule(JobKind::FetchRetry);
    }

    let receiver = Arc::new(PushReceiver::new(
        &config.aes_key,
        Arc::clone(&store),
        Arc::clone(&engine),
        Arc::clone(&scheduler),
    ));
    let server = HttpsServer::bind(&config.bind_address, config.bind_port, store, receiver)
        .await
        .context("failed to start https server")?;
    let server_task = tokio::spawn(server.serve(shutdown.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    // cancels the pending job (a child token) and stops the accept loop
    shutdown.cancel();

    match tokio::time::timeout(SHUTDOWN_GRACE, server_task).await {
        Ok(result) => {
            if let Err(e) = result {
                error!(error = %e, "https server task failed");
            }
        }
        Err(_) => bail!("graceful shutdown timed out, forcing exit"),
    }

    info!("certsentry exited");
    Ok(())
}

/// Seed the store from any existing pem pair in the storage directory.
fn load_material_from_disk(config: &Config, store: &CertificateStore) {
    let key_path = config.storage_dir.join(KEY_PEM_FILENAME);
    let cert_path = config.storage_dir.join(CERT_CHAIN_FILENAME);

    let key_pem = match fs::read(&key_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            info!(error = %e, "could not read key from disk, will fetch from remote");
            return;
        }
    };
    let cert_pem = match fs::read(&cert_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            info!(error = %e, "could not read cert from disk, will fetch from remote");
            return;
        }
    };

    match store.update(&key_pem, &cert_pem) {
        Ok(_) => info!("loaded existing key/cert pair from disk"),
        Err(e) => warn!(error = %e, "key/cert pair on disk unusable, will fetch from remote"),
    }
}

/// Build the container notifier when containers are configured.
///
/// A Docker client that cannot be constructed is fatal; an unanswered ping
/// is only a warning so transient daemon restarts do not block startup.
async fn build_notifier(config: &Config) -> Result<Option<ContainerNotifier>> {
    if config.containers.is_empty() {
        return Ok(None);
    }

    let runtime = DockerRuntime::connect()
        .context("containers configured but docker api client could not be created")?;
    if let Err(e) = runtime.ping().await {
        error!(
            error = %e,
            "could not reach docker api, verify access or container restarts will not occur"
        );
    }

    let action = if config.stop_only {
        LifecycleAction::Stop
    } else {
        LifecycleAction::Restart
    };

    Ok(Some(ContainerNotifier::new(
        Arc::new(runtime) as Arc<dyn ContainerRuntime>,
        config.containers.clone(),
        action,
    )))
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
