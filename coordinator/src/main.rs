use axum::{routing::get, Router};
use coordinator::alarm::{AlarmEvaluator, AlarmRuleStore};
use coordinator::checkin::CheckInHandler;
use coordinator::collaborators::{SqlOwnerDirectory, TracingNotificationSink};
use coordinator::config::Settings;
use coordinator::rest::{self, AppState};
use coordinator::telemetry::TelemetryStore;
use coordinator::{db, metrics, sweeper};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let settings = Settings::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting device coordinator");
    info!("HTTP server: {}", settings.http_addr);
    info!("Database: {}", settings.database_url);
    info!(
        "Check-in: claim_limit={}, retry_window={}s, default_max_attempts={}",
        settings.checkin.claim_limit,
        settings.checkin.retry_window.as_secs(),
        settings.checkin.default_max_attempts
    );

    // Initialize metrics
    metrics::init_metrics();

    // Connect to database
    let pool = match db::make_pool(&settings.database_url, settings.db_max_connections).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let record_pool = if settings.record_store_url == settings.database_url {
        pool.clone()
    } else {
        match db::connect(&settings.record_store_url, settings.db_max_connections).await {
            Ok(pool) => pool,
            Err(e) => {
                error!("Failed to open record store: {}", e);
                std::process::exit(1);
            }
        }
    };
    let owners = match SqlOwnerDirectory::new(record_pool, &settings.record_store_table) {
        Ok(directory) => Arc::new(directory),
        Err(e) => {
            error!("Invalid record store configuration: {}", e);
            std::process::exit(1);
        }
    };

    let alarms = AlarmEvaluator::new(pool.clone(), Arc::new(TracingNotificationSink));
    let telemetry = TelemetryStore::new(pool.clone(), owners.clone(), alarms.clone());
    let checkin = CheckInHandler::new(
        pool.clone(),
        settings.checkin.clone(),
        owners.clone(),
        alarms,
    );

    // Spawn sweeper task
    let sweeper_pool = pool.clone();
    let sweep_interval = settings.sweep_interval;
    let sweep_settings = settings.checkin.clone();
    let sweeper_handle = tokio::spawn(async move {
        sweeper::run_sweeper(sweeper_pool, sweep_interval, sweep_settings).await;
    });

    // Build HTTP app with REST API and metrics endpoint
    let state = AppState {
        pool: pool.clone(),
        checkin,
        owners,
        alarm_rules: AlarmRuleStore::new(pool),
        telemetry,
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&settings.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", settings.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", settings.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = sweeper_handle => {
            error!("Sweeper task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
