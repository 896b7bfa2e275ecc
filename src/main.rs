//! Payout Engine - double-entry ledger with an exactly-once payout pipeline
//!
//! Startup order matters: storage and bootstrap accounts first, then the
//! worker pool, then recovery of in-flight payouts, then the HTTP listener.

use anyhow::{Context, Result};
use axum::middleware as axum_mw;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payout_engine::api::{self, AppState};
use payout_engine::config::{Config, ProviderMode};
use payout_engine::events::GaplessCounter;
use payout_engine::models::EventRecord;
use payout_engine::payouts::{
    Dispatcher, HttpPayoutProvider, PayoutEngine, PayoutProvider, RetryPolicy, SimulatedProvider,
    WorkerConfig,
};
use payout_engine::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let config = Config::from_env();
    info!(
        db = %config.database_path,
        port = config.port,
        workers = config.worker_count,
        "payout engine starting"
    );

    let store = Store::open(&config.database_path)?;
    store
        .bootstrap_accounts()
        .context("failed to bootstrap required accounts")?;

    // Committed events fan out here; the channel is advisory only.
    let (events_tx, _events_rx) = broadcast::channel::<EventRecord>(1024);

    let engine = Arc::new(PayoutEngine::new(
        store.clone(),
        Arc::new(GaplessCounter),
        events_tx.clone(),
        config.max_retries,
    ));

    let provider: Arc<dyn PayoutProvider> = match &config.provider_mode {
        ProviderMode::Http { base_url } => {
            info!(provider_url = %base_url, "using HTTP payout provider");
            let client = reqwest::Client::builder()
                .timeout(config.provider_timeout)
                .build()
                .context("failed to build HTTP client")?;
            Arc::new(HttpPayoutProvider::new(client, base_url.clone()))
        }
        ProviderMode::Simulated => {
            warn!("PROVIDER_URL not set, using simulated payout provider");
            Arc::new(SimulatedProvider::new())
        }
    };

    let dispatcher = Dispatcher::spawn(
        engine.clone(),
        provider,
        WorkerConfig {
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            retry_policy: RetryPolicy {
                base: config.retry_base,
                factor: 2,
                cap: config.retry_cap,
            },
            provider_timeout: config.provider_timeout,
        },
    );

    // Payouts stranded by a previous crash go back on the queue.
    let recovered = dispatcher.recover_inflight(&engine).await?;
    if recovered > 0 {
        info!(recovered, "re-enqueued unfinished payouts from last run");
    }

    let state = AppState {
        store,
        engine,
        work_tx: dispatcher.queue(),
        events_tx,
    };

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(
            payout_engine::middleware::request_logging,
        ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Let in-flight work units finish their current step.
    dispatcher.shutdown().await;
    info!("payout engine stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler");
    } else {
        info!("shutdown signal received");
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "payout_engine=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
