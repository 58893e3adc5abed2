//! fedispatch - federated activity distribution
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - host-meta / WebFinger discovery                          │
//! │  - Dialback verification                                    │
//! │  - Metrics                                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Audience resolution                                      │
//! │  - Discovery, registration, signed delivery                 │
//! │  - Background job queue with retries                        │
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
//! - `federation`: Activities, audiences and delivery
//! - `queue`: Worker pool for federation jobs
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod queue;

use std::sync::Arc;

use federation::{
    AudienceResolver, CredentialManager, DeliveryDispatcher, DiscoveryClient, IdentityClassifier,
    NewActivity, StoreMembers,
};
use queue::{Job, JobHandle, JobQueue, WorkerPool};

/// Application state shared across all handlers
///
/// Cloned for each request; everything inside is shared.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub http_client: reqwest::Client,

    /// Background federation jobs
    pub queue: Arc<WorkerPool>,

    /// Local/remote delivery
    pub dispatcher: Arc<DeliveryDispatcher>,

    pub classifier: IdentityClassifier,

    /// Client credentials and dialback tokens
    pub credentials: CredentialManager,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Build the federation HTTP client
    /// 3. Wire discovery, registration and delivery
    ///
    /// Workers are not started; call [`AppState::start_workers`].
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let mut builder =
            reqwest::Client::builder().user_agent(config.federation.user_agent.clone());
        if let Some(timeout) = config.federation.http_timeout() {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        // 3. Federation components
        let queue = Arc::new(WorkerPool::new(&config.queue));
        let classifier = IdentityClassifier::new(db.clone(), &config.server);
        let resolver = AudienceResolver::new(Arc::new(StoreMembers::new(
            db.clone(),
            classifier.clone(),
        )));
        let discovery = DiscoveryClient::new(http_client.clone(), db.clone());
        let credentials =
            CredentialManager::new(http_client.clone(), db.clone(), &config.federation);
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            db.clone(),
            resolver,
            classifier.clone(),
            discovery,
            credentials.clone(),
            http_client.clone(),
            queue.clone(),
            config.server.base_url(),
        ));

        tracing::info!(
            workers = config.queue.workers,
            max_attempts = config.queue.max_attempts,
            "Application state initialized successfully"
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            queue,
            dispatcher,
            classifier,
            credentials,
        })
    }

    /// Start the background workers that run federation jobs
    pub fn start_workers(&self) {
        self.queue.start(self.dispatcher.clone());
    }

    /// Queue distribution of a stored activity.
    ///
    /// Returns as soon as the job is accepted.
    pub fn publish(&self, activity_id: &str) -> Result<JobHandle, error::AppError> {
        self.queue.submit(Job::Federate {
            activity_id: activity_id.to_string(),
        })
    }

    /// Store a new activity and queue its distribution.
    pub async fn create_and_publish(
        &self,
        new: NewActivity,
    ) -> Result<(data::ActivityRecord, JobHandle), error::AppError> {
        let record = federation::create_activity(&self.db, new).await?;
        let handle = self.publish(&record.id)?;
        tracing::info!(
            activity_id = %record.id,
            job_id = %handle.id,
            "Activity published"
        );
        Ok((record, handle))
    }
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
