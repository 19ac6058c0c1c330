//! Types shared by the prediction-accuracy, retraining and cross-campaign
//! learning components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::ToleranceBands;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Ctr,
    Cvr,
    Cpa,
    Roas,
    Conversions,
}

impl MetricType {
    pub fn tolerance(&self, bands: &ToleranceBands) -> f64 {
        match self {
            Self::Ctr => bands.ctr,
            Self::Cvr => bands.cvr,
            Self::Cpa => bands.cpa,
            Self::Roas => bands.roas,
            Self::Conversions => bands.conversions,
        }
    }
}

/// A model's prediction, later joined with the realized outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionRecord {
    pub prediction_id: Uuid,
    pub model_type: String,
    pub model_version: u32,
    /// Value served to callers, after the version's calibration.
    pub predicted_value: f64,
    /// Upstream model output before calibration; what retraining fits against.
    pub raw_value: f64,
    pub confidence: f64,
    pub metric_type: MetricType,
    pub campaign_id: Uuid,
    pub creative_id: Uuid,
    pub actual_value: Option<f64>,
    pub error: Option<f64>,
    pub error_percent: Option<f64>,
    pub is_accurate: Option<bool>,
    pub created_at: DateTime<Utc>,
    /// Feedback may not resolve the record before this instant.
    pub resolve_after: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PredictionRecord {
    pub fn is_resolved(&self) -> bool {
        self.actual_value.is_some()
    }
}

/// Input for recording a new prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPrediction {
    pub model_type: String,
    pub model_version: u32,
    pub predicted_value: f64,
    #[serde(default)]
    pub raw_value: Option<f64>,
    pub confidence: f64,
    pub metric_type: MetricType,
    pub campaign_id: Uuid,
    pub creative_id: Uuid,
    #[serde(default)]
    pub resolve_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTrend {
    Improving,
    Stable,
    Declining,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - chrono::Duration::hours(hours),
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Derived on demand from resolved predictions; never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccuracyReport {
    pub model_type: String,
    pub model_version: Option<u32>,
    pub window: TimeWindow,
    pub total_predictions: usize,
    pub resolved_predictions: usize,
    pub accurate_predictions: usize,
    pub accuracy_rate: f64,
    pub mae: f64,
    pub mape: f64,
    pub rmse: f64,
    pub trend: AccuracyTrend,
    pub needs_retraining: bool,
    pub confidence_adjustment: f64,
    pub insufficient_data: bool,
}

// ─── Retraining ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrainTrigger {
    Scheduled,
    AccuracyDrop,
    DataThreshold,
    DriftDetected,
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrainStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrainOutcome {
    Promoted,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrainJob {
    pub job_id: Uuid,
    pub model_type: String,
    pub trigger: RetrainTrigger,
    pub status: RetrainStatus,
    pub outcome: Option<RetrainOutcome>,
    pub training_samples: usize,
    pub validation_samples: usize,
    pub old_accuracy: Option<f64>,
    pub new_accuracy: Option<f64>,
    pub improvement: Option<f64>,
    /// Version promoted or restored by this job.
    pub model_version: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RetrainJob {
    pub fn pending(model_type: impl Into<String>, trigger: RetrainTrigger) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            model_type: model_type.into(),
            trigger,
            status: RetrainStatus::Pending,
            outcome: None,
            training_samples: 0,
            validation_samples: 0,
            old_accuracy: None,
            new_accuracy: None,
            improvement: None,
            model_version: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, RetrainStatus::Pending | RetrainStatus::Running)
    }
}

// ─── Cross-campaign learning ────────────────────────────────────────────

/// The creative/targeting dimension a variation changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VariationDimension {
    Hook,
    Cta,
    Visual,
    Audience,
    Placement,
    Format,
    Copy,
}

/// One `{dimension → new value}` change that produced a variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VariationChange {
    pub dimension: VariationDimension,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignLearning {
    pub learning_id: Uuid,
    pub campaign_id: Uuid,
    pub industry: String,
    pub objective: String,
    pub winning_patterns: Vec<VariationChange>,
    pub failed_patterns: Vec<VariationChange>,
    pub winning_hooks: Vec<String>,
    pub winning_ctas: Vec<String>,
    pub best_roas: f64,
    pub best_ctr: f64,
    pub best_cpa: f64,
    pub total_spend: f64,
    pub confidence_score: f64,
    pub data_points: u64,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct SegmentKey {
    pub industry: String,
    pub objective: String,
}

impl SegmentKey {
    pub fn new(industry: &str, objective: &str) -> Self {
        Self {
            industry: industry.trim().to_lowercase(),
            objective: objective.trim().to_lowercase(),
        }
    }
}

/// Running tally for a hook or CTA across campaigns in a segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatternStat {
    pub count: u64,
    pub total_roas: f64,
}

impl PatternStat {
    pub fn avg_roas(&self) -> f64 {
        crate::types::safe_div(self.total_roas, self.count as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndustrySegmentInsight {
    pub segment: SegmentKey,
    pub sample_size: u64,
    pub avg_roas: f64,
    pub avg_ctr: f64,
    pub avg_cpa: f64,
    pub hooks: BTreeMap<String, PatternStat>,
    pub ctas: BTreeMap<String, PatternStat>,
    pub dimension_wins: BTreeMap<VariationDimension, u64>,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedPattern {
    pub value: String,
    pub count: u64,
    pub avg_roas: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentBenchmark {
    pub roas: f64,
    pub ctr: f64,
    pub cpa: f64,
    pub sample_size: u64,
}

/// Answer to "what is likely to perform" for an industry × objective.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRecommendation {
    pub segment: SegmentKey,
    pub benchmarks: SegmentBenchmark,
    pub hooks: Vec<RankedPattern>,
    pub ctas: Vec<RankedPattern>,
    pub confidence: f64,
    pub is_fallback: bool,
}
