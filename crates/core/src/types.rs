use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Division that yields 0.0 for a zero denominator instead of NaN/inf.
pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        0.0
    } else {
        numerator / denominator
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Learning,
    Stable,
    Scaling,
    Declining,
    Paused,
}

impl LifecycleState {
    /// Whether automated kill/budget decisions may act on the variant.
    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::Learning | Self::Paused)
    }
}

/// Per-campaign performance goals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CampaignTargets {
    pub target_roas: f64,
    pub target_cpa: f64,
    pub target_cvr: f64,
}

/// A campaign registered with the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignProfile {
    pub campaign_id: Uuid,
    pub name: String,
    pub industry: String,
    pub objective: String,
    pub targets: CampaignTargets,
    pub created_at: DateTime<Utc>,
}

/// Raw counters over one sub-window, used for the decline check.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CounterWindow {
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub spend: f64,
    pub revenue: f64,
}

/// Raw per-variant counters as synced from the ad platform. Spend, budget and
/// pause state are authoritative; conversions and revenue are also folded in
/// from attributed feedback events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantCounters {
    pub variant_id: Uuid,
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

impl VariantCounters {
    pub fn new(campaign_id: Uuid, variant_id: Uuid, budget: f64) -> Self {
        Self {
            variant_id,
            campaign_id,
            impressions: 0,
            clicks: 0,
            conversions: 0,
            spend: 0.0,
            revenue: 0.0,
            budget,
            hours_active: 0.0,
            paused: false,
            earlier: None,
            recent: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct DerivedMetrics {
    pub ctr: f64,
    pub cvr: f64,
    pub cpa: f64,
    pub roas: f64,
}

impl DerivedMetrics {
    pub fn compute(impressions: u64, clicks: u64, conversions: u64, spend: f64, revenue: f64) -> Self {
        Self {
            ctr: safe_div(clicks as f64, impressions as f64),
            cvr: safe_div(conversions as f64, clicks as f64),
            cpa: safe_div(spend, conversions as f64),
            roas: safe_div(revenue, spend),
        }
    }
}

/// ROAS in an earlier versus a recent sub-window of the aggregation window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PeriodComparison {
    pub earlier_roas: f64,
    pub recent_roas: f64,
    pub earlier_spend: f64,
    pub recent_spend: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub variant_id: Uuid,
    pub campaign_id: Uuid,
    pub spend: f64,
    pub budget: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub revenue: f64,
    pub derived: DerivedMetrics,
    pub hours_active: f64,
    pub lifecycle_state: LifecycleState,
    pub trend: Option<PeriodComparison>,
    pub computed_at: DateTime<Utc>,
}

// ─── Kill switch ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KillReason {
    #[serde(rename = "low_ctr")]
    LowCtr,
    #[serde(rename = "low_cvr")]
    LowCvr,
    #[serde(rename = "high_cpa")]
    HighCpa,
    #[serde(rename = "negative_roas")]
    NegativeRoas,
    #[serde(rename = "no_conversions")]
    NoConversions,
    #[serde(rename = "performance_decline")]
    PerformanceDecline,
}

impl KillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowCtr => "low_ctr",
            Self::LowCvr => "low_cvr",
            Self::HighCpa => "high_cpa",
            Self::NegativeRoas => "negative_roas",
            Self::NoConversions => "no_conversions",
            Self::PerformanceDecline => "performance_decline",
        }
    }
}

/// Verdict for one variant. Never amended; the next cycle emits a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KillDecision {
    pub variant_id: Uuid,
    pub campaign_id: Uuid,
    pub should_kill: bool,
    pub reason: Option<KillReason>,
    pub confidence: f64,
    /// Audit figure only; never feeds a control decision.
    pub waste_prevented: f64,
    pub detail: String,
    pub evaluated_at: DateTime<Utc>,
}

// ─── Budget ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCategory {
    Loser,
    Underperforming,
    Stable,
    Winner,
}

impl BudgetCategory {
    pub fn priority(&self) -> u8 {
        match self {
            Self::Loser => 1,
            Self::Underperforming => 2,
            Self::Stable | Self::Winner => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetRecommendation {
    pub variant_id: Uuid,
    pub campaign_id: Uuid,
    pub current_budget: f64,
    pub recommended_budget: f64,
    pub change_amount: f64,
    pub change_percent: f64,
    pub category: BudgetCategory,
    pub reason: String,
    pub confidence: f64,
    pub priority: u8,
}

/// A variant left out of a decision pass, with the reason it was skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedVariant {
    pub variant_id: Uuid,
    pub reason: String,
}

// ─── Feedback ───────────────────────────────────────────────────────────

/// A delayed conversion reported by the attribution source. Delivered
/// at-least-once; `event_id` is the dedupe key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub event_id: String,
    pub event_name: String,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub campaign_id: Option<Uuid>,
    #[serde(default)]
    pub creative_id: Option<Uuid>,
    #[serde(default)]
    pub value: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub custom_data: HashMap<String, String>,
}

fn default_currency() -> String {
    "USD".to_string()
}
