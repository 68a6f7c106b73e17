use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenantgate::acme::AcmeProvider;
use tenantgate::cert::{CertStore, CertificateProvider};
use tenantgate::config::Config;
use tenantgate::dispatcher::Dispatcher;
use tenantgate::proxy::GateServer;
use tenantgate::stats::StatsCollector;
use tenantgate::store::Store;
use tenantgate::worker::TokioSpawner;
use tenantgate::{PKG_NAME, VERSION};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write-and-lock the PID file if configured; Drop removes it on exit.
    let _pid_lock = config
        .server
        .pid_file
        .as_deref()
        .map(|path| PidLock::acquire(PathBuf::from(path)))
        .transpose()?;
    if let Some(lock) = &_pid_lock {
        info!(path = %lock.path.display(), "PID file written and locked");
    }

    let config = Arc::new(config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Open the site/stats store
    let store = Arc::new(Store::open(&config.server.db_path)?);

    // Activity events flow from the supervisor into the stats collector
    let (activity_tx, activity_rx) = mpsc::unbounded_channel();

    let dispatcher = Dispatcher::new(Arc::clone(&config), Arc::new(TokioSpawner), activity_tx)?;

    // Certificate provisioning is optional; without a contact email the
    // HTTP listener still runs.
    let cert_store = if config.tls.enabled() {
        let provider: Arc<dyn CertificateProvider> = Arc::new(AcmeProvider::new(&config.tls)?);
        dispatcher.set_certificate_provider(Arc::clone(&provider));

        let email = config.tls.email.clone().unwrap_or_default();
        info!(
            email = %email,
            cache_dir = %config.tls.cache_dir,
            "ACME certificate provisioning enabled"
        );
        Some(CertStore::new(provider, email))
    } else {
        warn!("no tls.email configured, TLS provisioning disabled");
        None
    };

    // Sync site records from the store
    let records = store.load_sites()?;
    info!(sites = records.len(), "Loaded site records");
    dispatcher.apply_records(records).await;

    // Stats collection: sampling, persistence, activity drain
    let collector = StatsCollector::new(
        config.stats.clone(),
        Arc::clone(&dispatcher),
        Arc::clone(&store),
    );
    collector.spawn(activity_rx, shutdown_rx.clone());

    // HTTP listener (if port > 0)
    let http_handle = if config.server.port > 0 {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid HTTP bind address");
                anyhow::anyhow!("Invalid HTTP bind address: {}", e)
            })?;

        let server = GateServer::new(addr, Arc::clone(&dispatcher), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP listener error");
            }
        }))
    } else {
        None
    };

    // HTTPS listener (if TLS enabled and port > 0)
    let https_port = config.server.https_port();
    let https_handle = match (&cert_store, https_port) {
        (Some(certs), port) if port > 0 => {
            let addr: SocketAddr = format!("{}:{}", config.server.bind, port)
                .parse()
                .map_err(|e| {
                    error!(bind = %config.server.bind, port, error = %e, "Invalid HTTPS bind address");
                    anyhow::anyhow!("Invalid HTTPS bind address: {}", e)
                })?;

            let server = GateServer::new(addr, Arc::clone(&dispatcher), shutdown_rx.clone())
                .with_tls(Arc::clone(certs));
            Some(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTPS listener error");
                }
            }))
        }
        _ => None,
    };

    // Wait for a shutdown signal, or SIGHUP to re-sync site records
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
        let mut sigusr1 = signal(SignalKind::user_defined1()).expect("Failed to install SIGUSR1 handler");
        let mut sigusr2 = signal(SignalKind::user_defined2()).expect("Failed to install SIGUSR2 handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sigusr1.recv() => {
                    info!("Received SIGUSR1, shutting down...");
                    break;
                }
                _ = sigusr2.recv() => {
                    info!("Received SIGUSR2, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, re-syncing site records...");
                    match store.load_sites() {
                        Ok(records) => {
                            let count = records.len();
                            dispatcher.apply_records(records).await;
                            info!(sites = count, "Site records re-synced");
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to re-sync site records");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all supervised workers
    info!("Stopping worker pools...");
    dispatcher.shutdown_pools().await;

    // Wait for listeners to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Our PID, written to a file that stays flock-ed for the process lifetime.
/// A second instance pointed at the same path fails fast instead of fighting
/// over ports. Dropping the lock removes the file.
struct PidLock {
    path: PathBuf,
    #[cfg(unix)]
    _file: std::fs::File,
}

impl PidLock {
    #[cfg(unix)]
    fn acquire(path: PathBuf) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let mut file = std::fs::File::create(&path)?;
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!(
                    "PID file {} is held by a running instance",
                    path.display()
                );
            }
            return Err(err.into());
        }
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path, _file: file })
    }

    #[cfg(not(unix))]
    fn acquire(path: PathBuf) -> anyhow::Result<Self> {
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "Failed to remove PID file");
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy host");
    info!(
        bind = %config.server.bind,
        http_port = if config.server.port > 0 { Some(config.server.port) } else { None },
        https_port = if config.tls.enabled() { Some(config.server.https_port()) } else { None },
        tls = config.tls.enabled(),
        db_path = %config.server.db_path,
        "Server configuration"
    );
    info!(
        worker_port_base = config.server.worker_port_base,
        socket_dir = %config.server.socket_dir,
        minimum_processes = config.pools.minimum_processes,
        maximum_processes = config.pools.maximum_processes,
        runtime = %config.pools.runtime,
        "Worker pool defaults"
    );
    info!(
        sample_interval_ms = config.stats.sample_interval_ms,
        persist_interval_secs = config.stats.persist_interval_secs,
        minute_retention_days = config.stats.minute_retention_days,
        hour_retention_days = config.stats.hour_retention_days,
        day_retention_days = config.stats.day_retention_days,
        "Stats collection settings"
    );
}
