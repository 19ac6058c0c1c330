//! REST API handlers over the decision engine, plus operational endpoints.

use adpilot_agents::engine::AllocationResult;
use adpilot_agents::{DecisionEngine, NewCampaign, PredictionRequest};
use adpilot_core::error::PilotError;
use adpilot_core::learning::{
    AccuracyReport, CampaignLearning, IndustrySegmentInsight, PredictionRecord, RetrainJob,
    RetrainTrigger, SegmentRecommendation, TimeWindow,
};
use adpilot_core::types::{
    CampaignProfile, ConversionEvent, CounterWindow, KillDecision, VariantCounters,
};
use adpilot_decisioning::kill_switch::KillLog;
use adpilot_decisioning::OptimizationPlan;
use adpilot_feedback::IngestAck;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

/// Longest accuracy window a caller may request.
const MAX_WINDOW_HOURS: i64 = 24 * 90;

const DEFAULT_WINDOW_HOURS: i64 = 24 * 7;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DecisionEngine>,
    pub node_id: String,
    pub start_time: Instant,
}

// ─── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Engine errors mapped onto HTTP status codes.
pub struct ApiError(PilotError);

impl From<PilotError> for ApiError {
    fn from(e: PilotError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            PilotError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            PilotError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            PilotError::AlreadyResolved(_) => (StatusCode::CONFLICT, "already_resolved"),
            PilotError::Immature(_) => (StatusCode::UNPROCESSABLE_ENTITY, "immature_learning"),
            PilotError::Serialization(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
            "Internal processing error".to_string()
        } else {
            metrics::counter!("api.validation_errors").increment(1);
            self.0.to_string()
        };
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ─── Campaigns ──────────────────────────────────────────────────────────

/// POST /v1/campaigns: register a campaign with its targets and segment.
pub async fn register_campaign(
    State(state): State<AppState>,
    Json(req): Json<NewCampaign>,
) -> ApiResult<(StatusCode, Json<CampaignProfile>)> {
    if req.industry.trim().is_empty() || req.objective.trim().is_empty() {
        return Err(PilotError::Validation("industry and objective are required".into()).into());
    }
    let profile = state.engine.register_campaign(req)?;
    Ok((StatusCode::CREATED, Json(profile)))
}

/// Platform counters for one variant; the variant id comes from the path.
#[derive(Debug, Clone, Deserialize)]
pub struct CounterSync {
    pub campaign_id: Uuid,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub spend: f64,
    pub revenue: f64,
    pub budget: f64,
    pub hours_active: f64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub earlier: Option<CounterWindow>,
    #[serde(default)]
    pub recent: Option<CounterWindow>,
}

impl CounterSync {
    fn into_counters(self, variant_id: Uuid) -> VariantCounters {
        VariantCounters {
            variant_id,
            campaign_id: self.campaign_id,
            impressions: self.impressions,
            clicks: self.clicks,
            conversions: self.conversions,
            spend: self.spend,
            revenue: self.revenue,
            budget: self.budget,
            hours_active: self.hours_active,
            paused: self.paused,
            earlier: self.earlier,
            recent: self.recent,
        }
    }
}

/// PUT /v1/variants/:id/counters: platform counter sync.
pub async fn sync_counters(
    State(state): State<AppState>,
    Path(variant_id): Path<Uuid>,
    Json(body): Json<CounterSync>,
) -> ApiResult<StatusCode> {
    state.engine.sync_counters(body.into_counters(variant_id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/campaigns/:id/allocation
pub async fn allocation(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<AllocationResult>> {
    Ok(Json(state.engine.allocate(&campaign_id)?))
}

/// GET /v1/campaigns/:id/kill-decisions
pub async fn kill_decisions(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<Vec<KillDecision>>> {
    Ok(Json(state.engine.evaluate_kill(&campaign_id)?))
}

/// GET /v1/campaigns/:id/kill-log
pub async fn kill_log(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<KillLog>> {
    if state.engine.store().campaign(&campaign_id).is_none() {
        return Err(PilotError::not_found("campaign", campaign_id).into());
    }
    Ok(Json(state.engine.kill_log(&campaign_id)))
}

/// GET /v1/campaigns/:id/budget-recommendations
pub async fn budget_recommendations(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> ApiResult<Json<OptimizationPlan>> {
    Ok(Json(state.engine.optimize_budget(&campaign_id)?))
}

// ─── Feedback and learning ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub event_id: String,
    pub status: IngestAck,
}

/// POST /v1/conversions: at-least-once conversion delivery. A full queue
/// answers 503 so the sender redelivers.
pub async fn ingest_conversion(
    State(state): State<AppState>,
    Json(event): Json<ConversionEvent>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let event_id = event.event_id.clone();
    let ack = state.engine.ingest_conversion(event)?;
    let status = match ack {
        IngestAck::Accepted => StatusCode::ACCEPTED,
        IngestAck::Duplicate => StatusCode::OK,
        IngestAck::Backpressure => {
            warn!(event_id = %event_id, "Conversion queue full");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    Ok((status, Json(IngestResponse { event_id, status: ack })))
}

#[derive(Debug, Deserialize)]
pub struct InsightQuery {
    pub top_k: Option<usize>,
}

/// GET /v1/insights/:industry/:objective
pub async fn insights(
    State(state): State<AppState>,
    Path((industry, objective)): Path<(String, String)>,
    Query(query): Query<InsightQuery>,
) -> Json<SegmentRecommendation> {
    Json(state.engine.get_recommendations(&industry, &objective, query.top_k))
}

/// POST /v1/learnings: fold a finished campaign's learning into its segment.
pub async fn record_learning(
    State(state): State<AppState>,
    Json(learning): Json<CampaignLearning>,
) -> ApiResult<Json<IndustrySegmentInsight>> {
    Ok(Json(state.engine.record_learning(learning)?))
}

/// POST /v1/predictions: calibrate and track a model output.
pub async fn record_prediction(
    State(state): State<AppState>,
    Json(req): Json<PredictionRequest>,
) -> ApiResult<(StatusCode, Json<PredictionRecord>)> {
    let record = state.engine.predict(req)?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
pub struct AccuracyQuery {
    pub hours: Option<i64>,
}

/// GET /v1/models/:model_type/accuracy?hours=
pub async fn accuracy_report(
    State(state): State<AppState>,
    Path(model_type): Path<String>,
    Query(query): Query<AccuracyQuery>,
) -> ApiResult<Json<AccuracyReport>> {
    let hours = query.hours.unwrap_or(DEFAULT_WINDOW_HOURS);
    if !(1..=MAX_WINDOW_HOURS).contains(&hours) {
        return Err(PilotError::Validation(format!(
            "hours must be between 1 and {MAX_WINDOW_HOURS}"
        ))
        .into());
    }
    Ok(Json(
        state
            .engine
            .get_accuracy_report(&model_type, TimeWindow::last_hours(hours)),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct RetrainRequest {
    #[serde(default)]
    pub reason: Option<RetrainTrigger>,
}

/// POST /v1/models/:model_type/retrain
pub async fn trigger_retrain(
    State(state): State<AppState>,
    Path(model_type): Path<String>,
    body: Option<Json<RetrainRequest>>,
) -> ApiResult<(StatusCode, Json<RetrainJob>)> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or(RetrainTrigger::Manual);
    let job = state.engine.trigger_retrain(&model_type, reason)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /v1/models/:model_type/retrain-jobs
pub async fn retrain_jobs(
    State(state): State<AppState>,
    Path(model_type): Path<String>,
) -> Json<Vec<RetrainJob>> {
    Json(state.engine.retrain_jobs(&model_type))
}

// ─── Operational ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub campaigns: usize,
    pub feedback_queue_depth: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        campaigns: state.engine.store().campaign_ids().len(),
        feedback_queue_depth: state.engine.feedback().queue_depth(),
    })
}

/// GET /live: Liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
