//! Storefront HTTP server.
//!
//! Orders with stock reservation, Alipay / WeChat Pay charges, provider
//! callbacks and the background jobs that expire unpaid orders and payments.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use storefront_core::environment::{Clock, SystemClock};
use storefront_core::store::{AddressDirectory, Database};
use storefront_postgres::PgDatabase;
use storefront_runtime::metrics::MetricsServer;
use storefront_runtime::{
    BackgroundJob, CallbackReconciler, ExpirySweeper, JobRunner, OrderService, PaymentService,
    PaymentTimeoutReaper,
};
use storefront_server::Config;
use storefront_server::wiring::{self, RevocationCleanup};
use storefront_web::{AppState, TokenRevocations};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const REVOCATION_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storefront=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting storefront server");
    let config = Config::from_env().context("Invalid configuration")?;

    let mut metrics = MetricsServer::new();
    if config.server.metrics_enabled {
        metrics.start().context("Failed to start metrics")?;
    }

    let pg = PgDatabase::connect(&config.database.url, &config.database.pool)
        .await
        .context("Failed to connect to PostgreSQL")?;
    if config.database.run_migrations {
        pg.migrate().await.context("Failed to apply migrations")?;
    }
    let pg = Arc::new(pg);
    let db: Arc<dyn Database> = pg.clone();
    let addresses: Arc<dyn AddressDirectory> = pg;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let providers = Arc::new(
        wiring::providers(&config, &clock).context("Failed to configure payment providers")?,
    );
    let lifecycle = config.lifecycle;

    let orders = OrderService::new(db.clone(), addresses, clock.clone())
        .with_reservation_window(lifecycle.reservation_window);
    let payments = PaymentService::new(db.clone(), providers.clone(), clock.clone())
        .with_payment_timeout(lifecycle.payment_timeout);
    let reconciler = CallbackReconciler::new(db.clone(), providers, clock.clone());

    // Background jobs
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let revocations = Arc::new(TokenRevocations::new());
    let sweeper: Arc<dyn BackgroundJob> = Arc::new(
        ExpirySweeper::new(db.clone(), clock.clone()).with_batch_size(lifecycle.job_batch_size),
    );
    let reaper: Arc<dyn BackgroundJob> = Arc::new(
        PaymentTimeoutReaper::new(db.clone(), clock.clone())
            .with_batch_size(lifecycle.job_batch_size),
    );
    let cleanup: Arc<dyn BackgroundJob> =
        Arc::new(RevocationCleanup::new(revocations.clone(), clock.clone()));
    let jobs = [
        (sweeper, lifecycle.sweeper_interval),
        (reaper, lifecycle.reaper_interval),
        (cleanup, REVOCATION_CLEANUP_INTERVAL),
    ];
    let handles: Vec<_> = jobs
        .into_iter()
        .map(|(job, interval)| JobRunner::new(job, interval, shutdown_tx.subscribe()).spawn())
        .collect();

    let state = AppState::new(
        orders,
        payments,
        reconciler,
        db,
        clock,
        wiring::jwt_keys(&config.auth),
    )
    .with_revocations(revocations)
    .with_metrics(metrics.handle().cloned());
    let app = storefront_web::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Receivers may already be gone if a runner exited early.
    let _ = shutdown_tx.send(());
    let drain = join_jobs(handles);
    if tokio::time::timeout(config.server.shutdown_timeout, drain)
        .await
        .is_err()
    {
        warn!("Background jobs did not stop within the shutdown timeout");
    }

    info!("Server stopped");
    Ok(())
}

async fn join_jobs(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background job panicked");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        () = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
