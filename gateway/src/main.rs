use gateway::config::{GatewayConfig, StoreBackend};
use gateway::store::{self, ConfigStore, DeferredStore, MemoryStore};
use gateway::{http, listener, metrics, subscriber, GatewayContext, Registry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = GatewayConfig::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting device gateway");
    info!("Device listener: {}", config.device_addr);
    info!("HTTP server: {}", config.http_addr);
    info!("Config channel: {}", config.config_channel);

    // Initialize metrics
    metrics::init_metrics();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
            }
            shutdown.cancel();
        });
    }

    // the listener and subscriber start right away; store calls fail until
    // the backend is connected
    let store: Arc<dyn ConfigStore> = match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory config store, history will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Postgres => {
            info!(
                "Database: {}",
                config.database_url.split('@').last().unwrap_or("***")
            );
            let deferred = DeferredStore::new();
            let installer = deferred.clone();
            let database_url = config.database_url.clone();
            let interval = config.retry_interval;
            let connecting = shutdown.clone();
            tokio::spawn(async move {
                match store::postgres::connect_with_retry(&database_url, interval, &connecting)
                    .await
                {
                    Some(pg) => installer.install(Arc::new(pg)),
                    None => info!("Shut down before the config store was reachable"),
                }
            });
            Arc::new(deferred)
        }
    };

    let registry = Registry::new();
    let ctx = GatewayContext {
        registry: registry.clone(),
        store: Arc::clone(&store),
        settings: config.protocol.clone(),
        shutdown: shutdown.clone(),
    };

    let listener_handle = tokio::spawn(listener::run_listener(
        config.device_addr.clone(),
        ctx,
        config.retry_interval,
    ));

    let subscriber_handle = tokio::spawn(subscriber::run_subscriber(
        store,
        registry.clone(),
        config.config_channel.clone(),
        config.retry_interval,
        shutdown.clone(),
    ));

    let app = http::create_router(registry);

    // Start HTTP server
    let http_listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .unwrap_or_else(|e| {
                error!("HTTP server error: {}", e);
            });
    });

    tokio::select! {
        biased;

        _ = shutdown.cancelled() => {}
        _ = listener_handle => {
            error!("Device listener terminated");
        }
        _ = subscriber_handle => {
            error!("Config change subscriber terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
    }

    shutdown.cancel();
    info!("Shutting down");
}
