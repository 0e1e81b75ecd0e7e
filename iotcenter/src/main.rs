use iotcenter::config::{Config, StoreKind};
use iotcenter::metrics;
use iotcenter::rest::{self, AppState};
use iotcenter::store::influx::InfluxClient;
use iotcenter::store::memory::MemoryStore;
use iotcenter::store::TimeSeriesStore;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting IoT Center");
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Buckets: telemetry={}, auth={}",
        config.bucket, config.auth_bucket
    );
    if config.allow_raw_query {
        warn!("Raw Flux queries from clients are enabled");
    }

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
    }

    let store: Arc<dyn TimeSeriesStore> = match config.store {
        StoreKind::Influx => {
            info!("Store: InfluxDB at {}", config.influx_url);
            match InfluxClient::new(&config) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    error!("Failed to create store client: {}", e);
                    std::process::exit(1);
                }
            }
        }
        StoreKind::Memory => {
            warn!("Store: in-memory, data is lost on exit");
            Arc::new(MemoryStore::with_buckets(
                "memory",
                &[config.bucket.as_str(), config.auth_bucket.as_str()],
            ))
        }
    };

    let state = match AppState::new(&config, store) {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialise services: {}", e);
            std::process::exit(1);
        }
    };
    let app = rest::create_router(state);

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    });

    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
    }

    info!("Shutting down");
}
