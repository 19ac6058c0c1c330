//! API server: HTTP REST routes and the Prometheus metrics listener.

use crate::rest::{self, AppState};
use adpilot_agents::DecisionEngine;
use adpilot_core::config::AppConfig;
use axum::routing::{get, post, put};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(state: AppState) -> Router {
    Router::new()
        // Campaigns and variants
        .route("/v1/campaigns", post(rest::register_campaign))
        .route("/v1/campaigns/:id/allocation", get(rest::allocation))
        .route("/v1/campaigns/:id/kill-decisions", get(rest::kill_decisions))
        .route("/v1/campaigns/:id/kill-log", get(rest::kill_log))
        .route(
            "/v1/campaigns/:id/budget-recommendations",
            get(rest::budget_recommendations),
        )
        .route("/v1/variants/:id/counters", put(rest::sync_counters))
        // Feedback and learning
        .route("/v1/conversions", post(rest::ingest_conversion))
        .route("/v1/insights/:industry/:objective", get(rest::insights))
        .route("/v1/learnings", post(rest::record_learning))
        .route("/v1/predictions", post(rest::record_prediction))
        .route("/v1/models/:model_type/accuracy", get(rest::accuracy_report))
        .route("/v1/models/:model_type/retrain", post(rest::trigger_retrain))
        .route("/v1/models/:model_type/retrain-jobs", get(rest::retrain_jobs))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    engine: Arc<DecisionEngine>,
}

impl ApiServer {
    pub fn new(config: AppConfig, engine: Arc<DecisionEngine>) -> Self {
        Self { config, engine }
    }

    /// Serve REST until `shutdown` resolves.
    pub async fn start_http(&self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let app = router(AppState {
            engine: self.engine.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        });

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Start the metrics exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
