//! Application startup and lifecycle management.

use crate::config::{EngineConfig, ReconciliationConfig, WorkerConfig};
use crate::engine::{ReconciliationEngine, ReviewService, RuleRegistry, StatsAggregator};
use crate::handlers;
use crate::middleware::metrics_middleware;
use crate::services::{
    init_metrics, AuditSink, BatchStore, Database, MatchResultStore, RecordStore,
};
use crate::workers::{requeue_unfinished, BatchQueue, BatchRunner, BatchWorker};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::config::Config as CommonConfig;
use service_core::middleware::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub batches: Arc<dyn BatchStore>,
    pub audit: Arc<dyn AuditSink>,
    pub runner: BatchRunner,
    pub stats: StatsAggregator,
    pub review: ReviewService,
    pub queue: BatchQueue,
    pub queue_size: usize,
}

impl AppState {
    /// Wire the engine, worker and read paths over one set of stores. The worker
    /// is returned unstarted.
    pub fn assemble(
        records: Arc<dyn RecordStore>,
        results: Arc<dyn MatchResultStore>,
        audit: Arc<dyn AuditSink>,
        batches: Arc<dyn BatchStore>,
        engine_config: &EngineConfig,
        worker_config: &WorkerConfig,
    ) -> (Self, BatchWorker) {
        let rules = RuleRegistry::builtin(engine_config.partial_match_variance)
            .with_disabled(&engine_config.disabled_rules);

        tracing::info!(
            rules = ?rules.active_rules().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            chunk_size = engine_config.chunk_size,
            "Rule registry built"
        );

        let engine = ReconciliationEngine::new(
            records.clone(),
            results.clone(),
            Arc::new(rules),
            engine_config.chunk_size,
        );
        let runner = BatchRunner::new(engine, audit.clone(), batches.clone(), worker_config);
        let (worker, queue) = BatchWorker::new(runner.clone(), worker_config);

        let state = Self {
            records,
            batches,
            audit: audit.clone(),
            runner,
            stats: StatsAggregator::new(results.clone()),
            review: ReviewService::new(results, audit),
            queue,
            queue_size: worker_config.queue_size.max(1),
        };

        (state, worker)
    }
}

/// HTTP routes of the service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/batches", post(handlers::create_batch))
        .route("/batches/:batch_id", get(handlers::get_batch))
        .route("/batches/:batch_id/reconcile", post(handlers::reconcile_batch))
        .route("/batches/:batch_id/stats", get(handlers::get_batch_stats))
        .route("/batches/:batch_id/results", get(handlers::list_batch_results))
        .route("/stats", post(handlers::aggregate_stats))
        .route(
            "/results/:result_id",
            get(handlers::get_result).patch(handlers::review_result),
        )
        .route(
            "/audit/:entity_type/:entity_id",
            get(handlers::get_audit_trail),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Bind the HTTP listener on the configured host and port.
pub async fn bind_listener(common: &CommonConfig) -> Result<TcpListener, AppError> {
    let addr = (common.host.as_str(), common.port);
    TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(error = %e, host = %common.host, port = common.port, "Failed to bind HTTP listener");
        AppError::from(e)
    })
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    worker: BatchWorker,
    shutdown_token: CancellationToken,
    db: Arc<Database>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: ReconciliationConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        // Connect to database
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        // Run migrations only if requested
        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);
        let (state, worker) = AppState::assemble(
            db.clone(),
            db.clone(),
            db.clone(),
            db.clone(),
            &config.engine,
            &config.worker,
        );
        let shutdown_token = worker.shutdown_token();

        // Bind HTTP listener
        let http_listener = bind_listener(&config.common).await?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(
            host = %config.common.host,
            http_port = http_port,
            "Reconciliation service listener bound"
        );

        Ok(Self {
            http_port,
            http_listener,
            state,
            worker,
            shutdown_token,
            db,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Cancelling this token stops the HTTP server and the batch worker; in-flight
    /// runs stop at their next chunk boundary.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Run the application until the shutdown token fires.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let worker_handle = self.worker.start();

        // Pick up batches whose run was cut short by a previous shutdown.
        if let Err(e) = requeue_unfinished(
            self.state.batches.as_ref(),
            &self.state.queue,
            self.state.queue_size,
        )
        .await
        {
            tracing::warn!(error = %e, "Failed to requeue unfinished batches");
        }

        let http_router = router(self.state);
        let shutdown = self.shutdown_token.clone();

        tracing::info!(
            service = "reconciliation-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let served = axum::serve(self.http_listener, http_router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        // Stop the worker even when the server exited on its own.
        self.shutdown_token.cancel();
        if let Err(e) = worker_handle.await {
            tracing::warn!(error = %e, "Batch worker task ended abnormally");
        }

        served.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
