//! services/api/src/bin/api.rs

use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use axum::Router;
use class_scheduler_core::{
    memory::InMemoryStore,
    ports::{AutomationTrigger, SchedulingStore},
    SchedulerService,
};
use scheduler_api::{
    adapters::{DbAdapter, LogTrigger, PgOutboxTrigger},
    config::{Config, StoreBackend},
    error::ApiError,
    web::{self, rest::ApiDoc, state::AppState},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Choose the Store & Automation Adapters ---
    let (store, trigger): (Arc<dyn SchedulingStore>, Arc<dyn AutomationTrigger>) =
        match config.store_backend {
            StoreBackend::Postgres => {
                let database_url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| ApiError::Internal("DATABASE_URL is required".to_string()))?;
                info!("Connecting to database...");
                let db_pool = PgPoolOptions::new()
                    .max_connections(config.db_max_connections)
                    .connect(database_url)
                    .await?;
                let db_adapter = DbAdapter::new(db_pool.clone());
                info!("Running database migrations...");
                db_adapter.run_migrations().await?;
                info!("Database migrations complete.");
                (
                    Arc::new(db_adapter) as Arc<dyn SchedulingStore>,
                    Arc::new(PgOutboxTrigger::new(db_pool)) as Arc<dyn AutomationTrigger>,
                )
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory store; data will not survive a restart");
                (
                    Arc::new(InMemoryStore::new()) as Arc<dyn SchedulingStore>,
                    Arc::new(LogTrigger) as Arc<dyn AutomationTrigger>,
                )
            }
        };

    // --- 3. Build the Shared AppState ---
    let scheduler = Arc::new(SchedulerService::new(
        store,
        trigger,
        config.scheduler_settings(),
    ));
    let app_state = Arc::new(AppState { scheduler });

    let cors_origin = config
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|e| ApiError::Internal(format!("Invalid CORS_ORIGIN: {}", e)))?;
    let cors = CorsLayer::new()
        .allow_origin(cors_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT, HeaderName::from_static("x-user-id")]);

    // --- 4. Create the Web Router ---
    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(web::router(app_state).layer(cors))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
