use billing_gateway::api::{self, AppState};
use billing_gateway::config::AppConfig;
use billing_gateway::database::{BillingRepository, InMemoryBillingRepository};
use billing_gateway::health::HealthChecker;
use billing_gateway::logging::init_tracing;
use billing_gateway::payments::registry::AdapterRegistry;
use billing_gateway::services::PaymentOrchestrator;
use billing_gateway::workers::payment_status_poller::PaymentStatusPoller;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

/// Postgres when `DATABASE_URL` is set, otherwise the in-memory store.
#[cfg(feature = "database")]
async fn build_storage(
    config: &AppConfig,
    health_checker: HealthChecker,
) -> anyhow::Result<(Arc<dyn BillingRepository>, HealthChecker)> {
    use billing_gateway::database::{init_pool_from_config, PgBillingRepository};

    match &config.database {
        Some(database) => {
            info!("📊 Initializing database connection pool...");
            let pool = init_pool_from_config(database).await.map_err(|e| {
                error!("Failed to initialize database pool: {}", e);
                e
            })?;
            info!(
                max_connections = pool.options().get_max_connections(),
                "✅ Database connection pool initialized"
            );
            let repository: Arc<dyn BillingRepository> =
                Arc::new(PgBillingRepository::new(pool.clone()));
            Ok((repository, health_checker.with_database(pool)))
        }
        None => {
            warn!("⏭️  DATABASE_URL not set, using in-memory storage");
            Ok((Arc::new(InMemoryBillingRepository::new()), health_checker))
        }
    }
}

#[cfg(not(feature = "database"))]
async fn build_storage(
    _config: &AppConfig,
    health_checker: HealthChecker,
) -> anyhow::Result<(Arc<dyn BillingRepository>, HealthChecker)> {
    warn!("⏭️  Built without the database feature, using in-memory storage");
    Ok((Arc::new(InMemoryBillingRepository::new()), health_checker))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        "🚀 Starting billing gateway"
    );

    info!("💳 Initializing payment providers...");
    let registry = Arc::new(AdapterRegistry::from_configs(&config.providers).map_err(|e| {
        error!("Failed to initialize payment providers: {}", e);
        e
    })?);
    let providers = registry.list_available_providers();
    info!(providers = ?providers, "✅ Payment providers initialized");

    let (repository, health_checker) =
        build_storage(&config, HealthChecker::new(providers)).await?;

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        repository.clone(),
        registry,
        config.orchestrator.clone(),
    ));

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let poller_enabled = std::env::var("PAYMENT_POLLER_ENABLED")
        .unwrap_or_else(|_| "true".to_string())
        .to_lowercase()
        != "false";
    let poller_handle = if poller_enabled {
        info!(
            poll_interval_secs = config.poller.poll_interval.as_secs(),
            batch_size = config.poller.batch_size,
            "Starting payment status poller"
        );
        let poller =
            PaymentStatusPoller::new(repository, orchestrator.clone(), config.poller.clone());
        Some(tokio::spawn(poller.run(worker_shutdown_rx)))
    } else {
        info!("Payment status poller disabled (PAYMENT_POLLER_ENABLED=false)");
        None
    };

    info!("🛣️  Setting up application routes...");
    let app = api::router(AppState {
        orchestrator,
        health_checker,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;
    info!(address = %addr, "✅ Billing gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = poller_handle {
        if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
            error!(error = %e, "Timed out waiting for poller shutdown");
        }
    }

    info!("👋 Server shutdown complete");

    Ok(())
}
