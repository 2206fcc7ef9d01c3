//! CraftPay server binary.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use craftpay_server::clock::SystemClock;
use craftpay_server::config::{Config, GatewayMode};
use craftpay_server::gateway::{DarajaClient, MockGateway, PaymentGateway};
use craftpay_server::orders::PgOrderService;
use craftpay_server::store::PgPaymentStore;
use craftpay_server::{create_router, db, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("craftpay_server=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("Invalid configuration")?;

    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let gateway: Arc<dyn PaymentGateway> = match config.gateway.clone() {
        GatewayMode::Daraja(daraja) => {
            tracing::info!(base_url = %daraja.base_url, "Using Daraja gateway");
            Arc::new(DarajaClient::new(daraja).context("Failed to build gateway client")?)
        }
        GatewayMode::Mock => {
            tracing::warn!("Using mock gateway; no money will move");
            Arc::new(MockGateway::new())
        }
    };

    let state = AppState::new(
        Arc::new(PgPaymentStore::new(pool.clone())),
        Arc::new(PgOrderService::new(pool)),
        gateway,
        Arc::new(SystemClock),
        &config.engine,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = state.scheduler.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "CraftPay server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install CTRL+C handler");
            }
            tracing::info!("Shutting down");
        })
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "Scheduler task panicked");
    }

    Ok(())
}
