use hostgate::access::OpenAccess;
use hostgate::acme::AcmeCertificates;
use hostgate::config::{Config, TlsMode};
use hostgate::control::{ControlServer, ControlService, PKG_NAME, VERSION};
use hostgate::pool::{ConnectionPool, PoolConfig};
use hostgate::registry::HostRegistry;
use hostgate::reload::{ReloadController, ReloadSettings};
use hostgate::tls::{CertificateClient, Plaintext, SelfSigned};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not configured yet
            eprintln!("Failed to load configuration from {}: {}", config_path.display(), e);
            return Err(e.into());
        }
    };

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("hostgate={}", config.log_level()))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let sessions = config.session_settings()?;
    info!(
        default_age_secs = sessions.default_age.as_secs(),
        max_age_secs = sessions.max_age.as_secs(),
        "Session signing key derived"
    );

    let registry = Arc::new(HostRegistry::open(&config.database_path).map_err(|e| {
        error!(path = %config.database_path, error = %e, "Failed to open host registry");
        e
    })?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut renewal_task = None;
    let certificates: Arc<dyn CertificateClient> = match config.tls.mode {
        TlsMode::Acme => {
            let email = config.email.as_deref().unwrap_or_default();
            let acme = AcmeCertificates::new(email, config.staging, &config.tls.cache_dir)?
                .with_challenge_listener(config.server.listen_addr()?);
            renewal_task = Some(acme.spawn_renewal(shutdown_rx.clone()));
            Arc::new(acme)
        }
        TlsMode::SelfSigned => Arc::new(SelfSigned),
        TlsMode::Off => {
            warn!("TLS disabled, serving plain HTTP");
            Arc::new(Plaintext)
        }
    };

    let pool_config = PoolConfig::default();
    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let mut controller = ReloadController::new(
        Arc::clone(&registry),
        certificates,
        Arc::new(OpenAccess::new(sessions)),
        pool,
        ReloadSettings::from_config(&config)?,
    );

    // A failed boot is fatal regardless of the reload policy
    controller.start().await.map_err(|e| {
        error!(error = %e, "Gateway failed to start");
        e
    })?;

    let control_service = Arc::new(ControlService::new(registry, controller.handle()));
    let control_server = ControlServer::new(
        config.control.listen_addr()?,
        control_service,
        shutdown_rx.clone(),
    );
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            error!(error = %e, "Control server error");
        }
    });

    let mut controller_handle = tokio::spawn(controller.run(shutdown_rx));

    // The controller only stops on its own after a fatal reload failure
    let finished = tokio::select! {
        result = wait_for_signal() => {
            result?;
            None
        }
        joined = &mut controller_handle => Some(joined),
    };

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    let joined = match finished {
        Some(joined) => joined,
        None => controller_handle.await,
    };

    let outcome = match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Gateway stopped after a failed reload");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("Reload controller panicked: {}", e)),
    };

    if let Some(task) = renewal_task {
        task.abort();
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), control_handle).await;

    info!("Shutdown complete");
    outcome
}

/// Operator interrupt; no other signal is handled
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT (Ctrl+C), shutting down...");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        hostname = %config.hostname,
        listen = %config.server.listen,
        control = %config.control.listen,
        tls = ?config.tls.mode,
        staging = config.staging,
        "Server configuration"
    );
    info!(
        drain_timeout_secs = config.server.drain_timeout_secs,
        on_reload_failure = ?config.server.on_reload_failure,
        "Reload settings"
    );
    info!(database = %config.database_path, "Host registry");
}
