//! Beacon API server binary entrypoint.

use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use beacon_common::config::AppConfig;
use beacon_common::db::{create_pool, migrate};
use beacon_notifier::{MemoryNotificationStore, NotificationStore, PgNotificationStore};

use beacon_api::routes::create_router;
use beacon_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("beacon_api=debug,beacon_notifier=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Beacon API server...");

    // Load configuration
    let config = AppConfig::from_env()?;
    if config.jwt_secret.is_none() {
        anyhow::bail!("JWT_SECRET must be set for the API server");
    }

    // Choose the backing store
    let store: Arc<dyn NotificationStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = create_pool(url, config.db_max_connections).await?;
            migrate(&pool).await?;
            Arc::new(PgNotificationStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; notifications are kept in memory only");
            Arc::new(MemoryNotificationStore::new())
        }
    };

    let addr = config.api_bind_addr.clone();

    // Build application state
    let state = AppState::new(store, config);

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
