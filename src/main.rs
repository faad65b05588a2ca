use gatewarden::approval::{ApprovalSchedule, DeviceApprover};
use gatewarden::auth::AuthGate;
use gatewarden::cli::BackendCli;
use gatewarden::config::Config;
use gatewarden::onboarding::Onboarding;
use gatewarden::pool::{PoolConfig, UpstreamPool};
use gatewarden::proxy::{AppState, ProxyServer};
use gatewarden::supervisor::{BackendState, Supervisor};
use gatewarden::token::TokenStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatewarden=debug".parse().expect("valid log directive")),
        )
        .init();

    // Optional TOML file; the environment overrides it
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;
    config.ensure_writable_dirs()?;

    info!(
        version = VERSION,
        state_dir = %config.gateway.state_dir.display(),
        workspace_dir = %config.gateway.workspace_dir.display(),
        gateway = %config.gateway.target(),
        "Configuration loaded"
    );

    let (secret, source) = TokenStore::new(config.gateway.token_path(), config.gateway.token.clone()).resolve()?;
    info!(source = ?source, "Gateway token resolved");

    let auth = AuthGate::new(config.server.setup_password.as_deref());
    if !auth.is_configured() {
        warn!("SETUP_PASSWORD is not set; /setup and the proxied gateway will refuse all requests");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        ..PoolConfig::default()
    };
    let pool = Arc::new(UpstreamPool::new(config.gateway.socket_addr()?, pool_config));

    let supervisor = Supervisor::new(config.gateway.clone(), secret, Arc::clone(&pool));
    let approver = DeviceApprover::new(
        BackendCli::new(&config.gateway),
        ApprovalSchedule::from(&config.approval),
    );
    let onboarding = Onboarding::new(
        config.gateway.clone(),
        config.onboarding.clone(),
        Arc::clone(&supervisor),
    );

    let state = Arc::new(AppState {
        server: config.server.clone(),
        gateway: config.gateway.clone(),
        auth,
        supervisor: Arc::clone(&supervisor),
        onboarding: Arc::clone(&onboarding),
        pool,
        cli: BackendCli::new(&config.gateway),
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;
    let server = ProxyServer::new(bind_addr, state, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Reconcile configuration against the environment in the background
    let reconcile = Arc::clone(&onboarding);
    tokio::spawn(async move {
        let outcome = reconcile.reconcile_on_startup().await;
        info!(outcome = ?outcome, "Startup reconciliation finished");
    });

    // Every fresh gateway gets its own approval burst
    let approval_handle = tokio::spawn(follow_gateway(
        supervisor.subscribe(),
        Arc::clone(&approver),
        shutdown_rx.clone(),
    ));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    approver.stop();

    info!("Stopping gateway...");
    supervisor.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = approval_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Restart the approval loop each time the gateway becomes ready, stop it when the gateway goes away
async fn follow_gateway(
    mut states: watch::Receiver<BackendState>,
    approver: Arc<DeviceApprover>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut previous = *states.borrow();
    if previous == BackendState::Running {
        approver.restart();
    }

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *states.borrow();
                match current {
                    BackendState::Running if previous != BackendState::Running => approver.restart(),
                    BackendState::Exited | BackendState::Absent => approver.stop(),
                    _ => {}
                }
                previous = current;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
