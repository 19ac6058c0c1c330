//! Decision engine: the in-process API over every component.
//!
//! Owns the shared stores and wires the scheduled path (aggregate, kill,
//! allocate, optimize) to the event path (feedback, accuracy, retraining)
//! through the performance store, the learner and the model registry.

use adpilot_core::config::AppConfig;
use adpilot_core::error::{PilotError, PilotResult};
use adpilot_core::learning::{
    AccuracyReport, CampaignLearning, IndustrySegmentInsight, MetricType, NewPrediction,
    PredictionRecord, RetrainJob, RetrainTrigger, SegmentRecommendation, TimeWindow,
};
use adpilot_core::store::PerformanceStore;
use adpilot_core::types::{
    CampaignProfile, CampaignTargets, ConversionEvent, KillDecision, PerformanceSnapshot,
    SkippedVariant, VariantCounters,
};
use adpilot_decisioning::kill_switch::KillLog;
use adpilot_decisioning::{
    BudgetAllocator, BudgetOptimizer, KillSwitchEvaluator, MetricsAggregator, OptimizationPlan,
    PosteriorStats, RewardPrior,
};
use adpilot_feedback::{FeedbackIngestor, IngestAck};
use adpilot_learning::{
    CrossCampaignLearner, ModelRegistry, PredictionAccuracyTracker, RetrainPipeline,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};
use uuid::Uuid;

/// Model whose calibration is applied to segment ROAS benchmarks.
pub const ROAS_MODEL: &str = "roas";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    #[serde(default)]
    pub campaign_id: Option<Uuid>,
    pub name: String,
    pub industry: String,
    pub objective: String,
    #[serde(default)]
    pub target_roas: Option<f64>,
    #[serde(default)]
    pub target_cpa: Option<f64>,
    #[serde(default)]
    pub target_cvr: Option<f64>,
}

/// A raw model output to be calibrated by the production version and tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub model_type: String,
    pub metric_type: MetricType,
    pub raw_value: f64,
    pub confidence: f64,
    pub campaign_id: Uuid,
    pub creative_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResult {
    pub campaign_id: Uuid,
    pub shares: HashMap<Uuid, f64>,
    pub prior: RewardPrior,
    pub excluded: Vec<SkippedVariant>,
}

/// Everything one campaign needs applied this cycle.
#[derive(Debug, Clone)]
pub struct CampaignDecision {
    pub campaign_id: Uuid,
    pub kills: Vec<KillDecision>,
    pub plan: OptimizationPlan,
}

pub struct DecisionEngine {
    config: AppConfig,
    store: Arc<PerformanceStore>,
    aggregator: MetricsAggregator,
    kill_switch: KillSwitchEvaluator,
    allocator: BudgetAllocator,
    optimizer: BudgetOptimizer,
    learner: CrossCampaignLearner,
    tracker: Arc<PredictionAccuracyTracker>,
    registry: Arc<ModelRegistry>,
    retrain: Arc<RetrainPipeline>,
    feedback: Arc<FeedbackIngestor>,
    feedback_rx: Mutex<Option<mpsc::Receiver<ConversionEvent>>>,
    retrain_wakeup: Notify,
}

impl DecisionEngine {
    pub fn new(config: AppConfig) -> Self {
        let store = Arc::new(PerformanceStore::new());
        let tracker = Arc::new(PredictionAccuracyTracker::new(
            config.accuracy.clone(),
            config.feedback.resolution_delay_hours,
        ));
        let registry = Arc::new(ModelRegistry::new(config.retrain.max_versions));
        let retrain = Arc::new(RetrainPipeline::new(
            config.retrain.clone(),
            tracker.clone(),
            registry.clone(),
        ));
        let (feedback, feedback_rx) =
            FeedbackIngestor::new(config.feedback.clone(), store.clone(), tracker.clone());

        info!(node_id = %config.node_id, "Decision engine initialized");

        Self {
            aggregator: MetricsAggregator::new(config.lifecycle.clone()),
            kill_switch: KillSwitchEvaluator::new(config.kill_switch.clone()),
            allocator: BudgetAllocator::new(config.allocator.clone()),
            optimizer: BudgetOptimizer::new(
                config.budget.clone(),
                config.lifecycle.winner_roas_multiple,
            ),
            learner: CrossCampaignLearner::new(config.learner.clone()),
            store,
            tracker,
            registry,
            retrain,
            feedback: Arc::new(feedback),
            feedback_rx: Mutex::new(Some(feedback_rx)),
            retrain_wakeup: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PerformanceStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<PredictionAccuracyTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn retrain_pipeline(&self) -> &Arc<RetrainPipeline> {
        &self.retrain
    }

    pub fn feedback(&self) -> &Arc<FeedbackIngestor> {
        &self.feedback
    }

    /// The feedback queue receiver. Yields `Some` exactly once.
    pub fn take_feedback_receiver(&self) -> Option<mpsc::Receiver<ConversionEvent>> {
        self.feedback_rx.lock().take()
    }

    pub(crate) async fn retrain_requested(&self) {
        self.retrain_wakeup.notified().await;
    }

    // ─── Campaigns and counters ─────────────────────────────────────────

    pub fn register_campaign(&self, req: NewCampaign) -> PilotResult<CampaignProfile> {
        let lifecycle = &self.config.lifecycle;
        let targets = CampaignTargets {
            target_roas: req.target_roas.unwrap_or(lifecycle.default_target_roas),
            target_cpa: req.target_cpa.unwrap_or(lifecycle.default_target_cpa),
            target_cvr: req.target_cvr.unwrap_or(lifecycle.default_target_cvr),
        };
        if targets.target_roas <= 0.0 || targets.target_cpa <= 0.0 || targets.target_cvr <= 0.0 {
            return Err(PilotError::Validation("campaign targets must be positive".into()));
        }
        let campaign_id = req.campaign_id.unwrap_or_else(Uuid::new_v4);
        let profile = self.store.register_campaign(
            campaign_id,
            &req.name,
            &req.industry,
            &req.objective,
            targets,
        );
        info!(campaign_id = %campaign_id, industry = %req.industry, objective = %req.objective, "Campaign registered");
        Ok(profile)
    }

    pub fn sync_counters(&self, counters: VariantCounters) -> PilotResult<()> {
        if counters.spend < 0.0 || counters.budget < 0.0 || counters.revenue < 0.0 {
            return Err(PilotError::Validation(
                "spend, budget and revenue must be non-negative".into(),
            ));
        }
        self.store.upsert_counters(counters)
    }

    fn campaign(&self, campaign_id: &Uuid) -> PilotResult<CampaignProfile> {
        self.store
            .campaign(campaign_id)
            .ok_or_else(|| PilotError::not_found("campaign", campaign_id))
    }

    pub fn snapshots(&self, campaign_id: &Uuid) -> PilotResult<Vec<PerformanceSnapshot>> {
        let profile = self.campaign(campaign_id)?;
        let counters = self.store.campaign_counters(campaign_id);
        Ok(self.aggregator.aggregate_all(&counters, &profile.targets))
    }

    /// Reward prior from the campaign's segment benchmark, calibrated by the
    /// production ROAS model.
    pub fn segment_prior(&self, profile: &CampaignProfile) -> RewardPrior {
        let (benchmark_roas, confidence) = self.learner.prior_for(&profile.industry, &profile.objective);
        let (_, calibrated) = self.registry.predict(ROAS_MODEL, benchmark_roas);
        self.allocator
            .prior_from_benchmark(calibrated.max(0.0), confidence, &profile.targets)
    }

    /// Allocator statistics for one variant.
    pub fn posterior(&self, variant_id: &Uuid) -> PosteriorStats {
        self.allocator.stats(variant_id)
    }

    // ─── Decisions ──────────────────────────────────────────────────────

    /// Current allocation shares across actionable variants. Read-only.
    pub fn allocate(&self, campaign_id: &Uuid) -> PilotResult<AllocationResult> {
        let profile = self.campaign(campaign_id)?;
        let snapshots = self.snapshots(campaign_id)?;
        let prior = self.segment_prior(&profile);
        let (ids, excluded) = partition_actionable(&snapshots);
        Ok(AllocationResult {
            campaign_id: *campaign_id,
            shares: self.allocator.allocate(&ids, &prior),
            prior,
            excluded,
        })
    }

    /// Kill verdicts for every variant, counted in the kill log.
    pub fn evaluate_kill(&self, campaign_id: &Uuid) -> PilotResult<Vec<KillDecision>> {
        let profile = self.campaign(campaign_id)?;
        let snapshots = self.snapshots(campaign_id)?;
        Ok(self.kill_switch.evaluate_all(&snapshots, &profile.targets))
    }

    pub fn kill_log(&self, campaign_id: &Uuid) -> KillLog {
        self.kill_switch.get_kill_log(campaign_id)
    }

    /// Preview of this cycle's budget plan. Variants the kill switch would
    /// stop are excluded; nothing is recorded or applied.
    pub fn optimize_budget(&self, campaign_id: &Uuid) -> PilotResult<OptimizationPlan> {
        let profile = self.campaign(campaign_id)?;
        let snapshots = self.snapshots(campaign_id)?;
        let now = Utc::now();
        let kills: Vec<KillDecision> = snapshots
            .iter()
            .map(|s| self.kill_switch.assess(s, &profile.targets, now))
            .filter(|d| d.should_kill)
            .collect();
        Ok(self.plan(&profile, &snapshots, &kills))
    }

    /// One campaign's share of a decision cycle: fold this cycle's
    /// observations into the allocator, run the kill switch, then plan
    /// budgets for the survivors.
    pub fn decide_campaign(&self, campaign_id: &Uuid) -> PilotResult<CampaignDecision> {
        let profile = self.campaign(campaign_id)?;
        let snapshots = self.snapshots(campaign_id)?;
        for snapshot in &snapshots {
            self.allocator.observe_snapshot(snapshot, &profile.targets);
        }
        let kills: Vec<KillDecision> = self
            .kill_switch
            .evaluate_all(&snapshots, &profile.targets)
            .into_iter()
            .filter(|d| d.should_kill)
            .collect();
        let plan = self.plan(&profile, &snapshots, &kills);
        debug!(
            campaign_id = %campaign_id,
            kills = kills.len(),
            recommendations = plan.recommendations.len(),
            "Campaign decided"
        );
        Ok(CampaignDecision {
            campaign_id: *campaign_id,
            kills,
            plan,
        })
    }

    fn plan(
        &self,
        profile: &CampaignProfile,
        snapshots: &[PerformanceSnapshot],
        kills: &[KillDecision],
    ) -> OptimizationPlan {
        let killed: Vec<Uuid> = kills.iter().map(|k| k.variant_id).collect();
        let survivors: Vec<PerformanceSnapshot> = snapshots
            .iter()
            .filter(|s| !killed.contains(&s.variant_id))
            .cloned()
            .collect();
        let (ids, _) = partition_actionable(&survivors);
        let prior = self.segment_prior(profile);
        let shares = self.allocator.allocate(&ids, &prior);

        let mut plan = self
            .optimizer
            .optimize(profile.campaign_id, &survivors, &shares, &profile.targets);
        for kill in kills {
            plan.skipped.push(SkippedVariant {
                variant_id: kill.variant_id,
                reason: format!(
                    "kill switch: {}",
                    kill.reason.map(|r| r.as_str()).unwrap_or("unknown")
                ),
            });
        }
        plan
    }

    // ─── Feedback and learning ──────────────────────────────────────────

    pub fn ingest_conversion(&self, event: ConversionEvent) -> PilotResult<IngestAck> {
        self.feedback.ingest(event)
    }

    pub fn get_recommendations(
        &self,
        industry: &str,
        objective: &str,
        top_k: Option<usize>,
    ) -> SegmentRecommendation {
        self.learner.recommend(industry, objective, top_k)
    }

    pub fn record_learning(&self, learning: CampaignLearning) -> PilotResult<IndustrySegmentInsight> {
        self.learner.record(learning)
    }

    pub fn learnings_for(&self, campaign_id: &Uuid) -> Vec<CampaignLearning> {
        self.learner.learnings_for(campaign_id)
    }

    /// Calibrate a raw prediction with the production model and track it.
    pub fn predict(&self, req: PredictionRequest) -> PilotResult<PredictionRecord> {
        if !req.raw_value.is_finite() {
            return Err(PilotError::Validation("raw_value must be finite".into()));
        }
        let (version, calibrated) = self.registry.predict(&req.model_type, req.raw_value);
        self.tracker.record_prediction(NewPrediction {
            model_type: req.model_type,
            model_version: version,
            predicted_value: calibrated,
            raw_value: Some(req.raw_value),
            confidence: req.confidence,
            metric_type: req.metric_type,
            campaign_id: req.campaign_id,
            creative_id: req.creative_id,
            resolve_after: None,
        })
    }

    pub fn record_prediction(&self, prediction: NewPrediction) -> PilotResult<PredictionRecord> {
        self.tracker.record_prediction(prediction)
    }

    pub fn get_accuracy_report(&self, model_type: &str, window: TimeWindow) -> AccuracyReport {
        self.tracker.get_accuracy_report(model_type, window)
    }

    /// Queue a retrain job and wake the retrain worker.
    pub fn trigger_retrain(&self, model_type: &str, reason: RetrainTrigger) -> PilotResult<RetrainJob> {
        if model_type.trim().is_empty() {
            return Err(PilotError::Validation("model_type must not be empty".into()));
        }
        let job = self.retrain.trigger(model_type, reason);
        self.retrain_wakeup.notify_one();
        Ok(job)
    }

    pub fn retrain_jobs(&self, model_type: &str) -> Vec<RetrainJob> {
        self.retrain.jobs(model_type)
    }

    /// Model types known to either the tracker or the registry.
    pub fn model_types(&self) -> Vec<String> {
        let mut types = self.tracker.model_types();
        for t in self.registry.model_types() {
            if !types.contains(&t) {
                types.push(t);
            }
        }
        types.sort();
        types
    }
}

/// Split snapshots into actionable variant ids and skipped entries.
fn partition_actionable(snapshots: &[PerformanceSnapshot]) -> (Vec<Uuid>, Vec<SkippedVariant>) {
    let mut ids = Vec::new();
    let mut skipped = Vec::new();
    for s in snapshots {
        if s.lifecycle_state.is_actionable() {
            ids.push(s.variant_id);
        } else {
            skipped.push(SkippedVariant {
                variant_id: s.variant_id,
                reason: format!("not actionable: {:?}", s.lifecycle_state).to_lowercase(),
            });
        }
    }
    (ids, skipped)
}
