//! Pubgate - ActivityPub federation gateway
//!
//! Makes the local accounts and public posts of an existing application
//! discoverable by, and interoperable with, remote federated servers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actors, inboxes, collections)     │
//! │  - WebFinger / NodeInfo discovery                           │
//! │  - Prometheus metrics                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Federation + Service Layer                      │
//! │  - HTTP Signatures, actor keys                              │
//! │  - Inbox processing, signed delivery, post fan-out          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Public post fan-out
//! - `federation`: ActivityPub protocol handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Upper bound on inbound request bodies
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Every component is built once here and shared behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// URL scheme of this instance
    pub urls: federation::ActorUrls,

    pub actors: Arc<federation::ActorResolver>,
    pub inbox: Arc<federation::InboxProcessor>,
    pub converter: Arc<federation::NoteConverter>,
    pub collections: Arc<federation::CollectionPaginator>,

    /// Called by the host application when a post is published
    pub publisher: Arc<service::PublishService>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Build the outbound HTTP client
    /// 3. Wire federation components
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(config.federation.user_agent.as_str())
                .timeout(config.federation.request_timeout())
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        let urls = federation::ActorUrls::new(&config.server);
        let keys = Arc::new(federation::KeyManager::new(
            db.clone(),
            config.federation.key_bits,
        ));
        let actors = Arc::new(federation::ActorResolver::new(
            db.clone(),
            keys.clone(),
            urls.clone(),
            http_client.clone(),
            config.federation.clone(),
        ));
        let delivery = Arc::new(federation::ActivityDelivery::new(
            db.clone(),
            keys.clone(),
            urls.clone(),
            http_client,
            config.federation.clone(),
        ));
        let inbox = Arc::new(federation::InboxProcessor::new(
            db.clone(),
            urls.clone(),
            actors.clone(),
            delivery.clone(),
        ));
        let converter = Arc::new(federation::NoteConverter::new(db.clone(), urls.clone()));
        let collections = Arc::new(federation::CollectionPaginator::new(
            db.clone(),
            urls.clone(),
            converter.clone(),
        ));
        let publisher = Arc::new(service::PublishService::new(
            db.clone(),
            keys,
            actors.clone(),
            delivery,
            converter.clone(),
            config.federation.delivery_concurrency,
        ));

        tracing::info!(base_url = %urls.base_url(), "Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            urls,
            actors,
            inbox,
            converter,
            collections,
            publisher,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
