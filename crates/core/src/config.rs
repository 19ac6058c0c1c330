use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `ADPILOT__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub learner: LearnerConfig,
    #[serde(default)]
    pub accuracy: AccuracyConfig,
    #[serde(default)]
    pub retrain: RetrainConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_node_id() -> String {
    "adpilot-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

// ─── Lifecycle ──────────────────────────────────────────────────────────

/// Learning-phase gate and the default per-campaign targets.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_learning_period_hours")]
    pub learning_period_hours: f64,
    #[serde(default = "default_min_decision_spend")]
    pub min_decision_spend: f64,
    /// ROAS at or above `winner_roas_multiple × target_roas` counts as a winner.
    #[serde(default = "default_winner_roas_multiple")]
    pub winner_roas_multiple: f64,
    #[serde(default = "default_target_roas")]
    pub default_target_roas: f64,
    #[serde(default = "default_target_cpa")]
    pub default_target_cpa: f64,
    #[serde(default = "default_target_cvr")]
    pub default_target_cvr: f64,
}

fn default_learning_period_hours() -> f64 { 24.0 }
fn default_min_decision_spend() -> f64 { 50.0 }
fn default_winner_roas_multiple() -> f64 { 1.5 }
fn default_target_roas() -> f64 { 2.0 }
fn default_target_cpa() -> f64 { 25.0 }
fn default_target_cvr() -> f64 { 0.02 }

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            learning_period_hours: default_learning_period_hours(),
            min_decision_spend: default_min_decision_spend(),
            winner_roas_multiple: default_winner_roas_multiple(),
            default_target_roas: default_target_roas(),
            default_target_cpa: default_target_cpa(),
            default_target_cvr: default_target_cvr(),
        }
    }
}

// ─── Kill Switch ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct KillSwitchConfig {
    #[serde(default = "default_ctr_floor")]
    pub ctr_floor: f64,
    #[serde(default = "default_min_impressions")]
    pub min_impressions: u64,
    #[serde(default = "default_cvr_floor")]
    pub cvr_floor: f64,
    #[serde(default = "default_min_clicks")]
    pub min_clicks: u64,
    #[serde(default = "default_cpa_multiple")]
    pub cpa_multiple: f64,
    #[serde(default = "default_min_conversions")]
    pub min_conversions: u64,
    #[serde(default = "default_roas_floor")]
    pub roas_floor: f64,
    #[serde(default = "default_min_spend_for_roas")]
    pub min_spend_for_roas: f64,
    #[serde(default = "default_min_spend_no_conversions")]
    pub min_spend_no_conversions: f64,
    /// Fractional drop in ROAS between the earlier and recent sub-window.
    #[serde(default = "default_decline_threshold")]
    pub decline_threshold: f64,
    #[serde(default = "default_min_window_spend")]
    pub min_window_spend: f64,
    #[serde(default = "default_waste_horizon_hours")]
    pub waste_horizon_hours: f64,
}

fn default_ctr_floor() -> f64 { 0.005 }
fn default_min_impressions() -> u64 { 2000 }
fn default_cvr_floor() -> f64 { 0.005 }
fn default_min_clicks() -> u64 { 150 }
fn default_cpa_multiple() -> f64 { 3.0 }
fn default_min_conversions() -> u64 { 3 }
fn default_roas_floor() -> f64 { 0.5 }
fn default_min_spend_for_roas() -> f64 { 150.0 }
fn default_min_spend_no_conversions() -> f64 { 100.0 }
fn default_decline_threshold() -> f64 { 0.5 }
fn default_min_window_spend() -> f64 { 30.0 }
fn default_waste_horizon_hours() -> f64 { 24.0 }

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            ctr_floor: default_ctr_floor(),
            min_impressions: default_min_impressions(),
            cvr_floor: default_cvr_floor(),
            min_clicks: default_min_clicks(),
            cpa_multiple: default_cpa_multiple(),
            min_conversions: default_min_conversions(),
            roas_floor: default_roas_floor(),
            min_spend_for_roas: default_min_spend_for_roas(),
            min_spend_no_conversions: default_min_spend_no_conversions(),
            decline_threshold: default_decline_threshold(),
            min_window_spend: default_min_window_spend(),
            waste_horizon_hours: default_waste_horizon_hours(),
        }
    }
}

// ─── Allocator ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AllocatorConfig {
    /// Softmax temperature over sampled rewards. Lower is greedier.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_roas_weight")]
    pub roas_weight: f64,
    #[serde(default = "default_cvr_weight")]
    pub cvr_weight: f64,
    /// Pseudo-observations granted to a fully confident segment prior.
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f64,
    #[serde(default = "default_prior_variance")]
    pub prior_variance: f64,
}

fn default_temperature() -> f64 { 0.5 }
fn default_roas_weight() -> f64 { 0.7 }
fn default_cvr_weight() -> f64 { 0.3 }
fn default_prior_strength() -> f64 { 10.0 }
fn default_prior_variance() -> f64 { 0.25 }

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            roas_weight: default_roas_weight(),
            cvr_weight: default_cvr_weight(),
            prior_strength: default_prior_strength(),
            prior_variance: default_prior_variance(),
        }
    }
}

// ─── Budget Optimizer ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_floor")]
    pub floor: f64,
    #[serde(default = "default_max_increase_pct")]
    pub max_increase_pct: f64,
    #[serde(default = "default_max_decrease_pct")]
    pub max_decrease_pct: f64,
    /// ROAS below `loser_roas_ratio × target` is a loser.
    #[serde(default = "default_loser_roas_ratio")]
    pub loser_roas_ratio: f64,
    #[serde(default = "default_moderate_cut_pct")]
    pub moderate_cut_pct: f64,
    #[serde(default = "default_min_scale_confidence")]
    pub min_scale_confidence: f64,
    #[serde(default = "default_confidence_spend_scale")]
    pub confidence_spend_scale: f64,
    #[serde(default = "default_confidence_conversion_scale")]
    pub confidence_conversion_scale: f64,
}

fn default_budget_floor() -> f64 { 10.0 }
fn default_max_increase_pct() -> f64 { 0.30 }
fn default_max_decrease_pct() -> f64 { 0.50 }
fn default_loser_roas_ratio() -> f64 { 0.5 }
fn default_moderate_cut_pct() -> f64 { 0.15 }
fn default_min_scale_confidence() -> f64 { 0.7 }
fn default_confidence_spend_scale() -> f64 { 200.0 }
fn default_confidence_conversion_scale() -> f64 { 20.0 }

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            floor: default_budget_floor(),
            max_increase_pct: default_max_increase_pct(),
            max_decrease_pct: default_max_decrease_pct(),
            loser_roas_ratio: default_loser_roas_ratio(),
            moderate_cut_pct: default_moderate_cut_pct(),
            min_scale_confidence: default_min_scale_confidence(),
            confidence_spend_scale: default_confidence_spend_scale(),
            confidence_conversion_scale: default_confidence_conversion_scale(),
        }
    }
}

// ─── Cross-Campaign Learner ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LearnerConfig {
    #[serde(default = "default_min_data_points")]
    pub min_data_points: u64,
    #[serde(default = "default_min_total_spend")]
    pub min_total_spend: f64,
    /// Segment data points at which confidence reaches ~63%.
    #[serde(default = "default_confidence_scale")]
    pub confidence_scale: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_fallback_roas")]
    pub fallback_roas: f64,
    #[serde(default = "default_fallback_ctr")]
    pub fallback_ctr: f64,
    #[serde(default = "default_fallback_cpa")]
    pub fallback_cpa: f64,
}

fn default_min_data_points() -> u64 { 50 }
fn default_min_total_spend() -> f64 { 500.0 }
fn default_confidence_scale() -> f64 { 2000.0 }
fn default_top_k() -> usize { 5 }
fn default_fallback_roas() -> f64 { 2.0 }
fn default_fallback_ctr() -> f64 { 0.01 }
fn default_fallback_cpa() -> f64 { 30.0 }

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            min_data_points: default_min_data_points(),
            min_total_spend: default_min_total_spend(),
            confidence_scale: default_confidence_scale(),
            top_k: default_top_k(),
            fallback_roas: default_fallback_roas(),
            fallback_ctr: default_fallback_ctr(),
            fallback_cpa: default_fallback_cpa(),
        }
    }
}

// ─── Accuracy Tracker ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AccuracyConfig {
    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: f64,
    #[serde(default = "default_min_report_samples")]
    pub min_report_samples: usize,
    /// Resolved records required in each half of a window before a trend is called.
    #[serde(default = "default_min_trend_samples")]
    pub min_trend_samples: usize,
    #[serde(default = "default_trend_delta")]
    pub trend_delta: f64,
    #[serde(default)]
    pub tolerances: ToleranceBands,
}

/// Relative error tolerated per metric before a prediction counts as inaccurate.
#[derive(Debug, Clone, Deserialize)]
pub struct ToleranceBands {
    #[serde(default = "default_ctr_tolerance")]
    pub ctr: f64,
    #[serde(default = "default_cvr_tolerance")]
    pub cvr: f64,
    #[serde(default = "default_cpa_tolerance")]
    pub cpa: f64,
    #[serde(default = "default_roas_tolerance")]
    pub roas: f64,
    #[serde(default = "default_conversions_tolerance")]
    pub conversions: f64,
}

fn default_accuracy_threshold() -> f64 { 0.6 }
fn default_min_report_samples() -> usize { 30 }
fn default_min_trend_samples() -> usize { 10 }
fn default_trend_delta() -> f64 { 0.05 }
fn default_ctr_tolerance() -> f64 { 0.25 }
fn default_cvr_tolerance() -> f64 { 0.30 }
fn default_cpa_tolerance() -> f64 { 0.35 }
fn default_roas_tolerance() -> f64 { 0.30 }
fn default_conversions_tolerance() -> f64 { 0.30 }

impl Default for ToleranceBands {
    fn default() -> Self {
        Self {
            ctr: default_ctr_tolerance(),
            cvr: default_cvr_tolerance(),
            cpa: default_cpa_tolerance(),
            roas: default_roas_tolerance(),
            conversions: default_conversions_tolerance(),
        }
    }
}

impl Default for AccuracyConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold: default_accuracy_threshold(),
            min_report_samples: default_min_report_samples(),
            min_trend_samples: default_min_trend_samples(),
            trend_delta: default_trend_delta(),
            tolerances: ToleranceBands::default(),
        }
    }
}

// ─── Retrain Pipeline ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RetrainConfig {
    #[serde(default = "default_retrain_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_min_new_samples")]
    pub min_new_samples: usize,
    #[serde(default = "default_data_threshold")]
    pub data_threshold: usize,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,
    #[serde(default = "default_schedule_interval_hours")]
    pub schedule_interval_hours: i64,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f64,
    #[serde(default = "default_min_training_samples")]
    pub min_training_samples: usize,
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,
    #[serde(default = "default_rollback_threshold")]
    pub rollback_threshold: f64,
    #[serde(default = "default_min_rollback_samples")]
    pub min_rollback_samples: usize,
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
    #[serde(default = "default_recency_half_life_days")]
    pub recency_half_life_days: f64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retrain_min_samples() -> usize { 100 }
fn default_min_new_samples() -> usize { 100 }
fn default_data_threshold() -> usize { 1000 }
fn default_cooldown_hours() -> i64 { 24 }
fn default_schedule_interval_hours() -> i64 { 168 }
fn default_max_samples() -> usize { 10_000 }
fn default_validation_fraction() -> f64 { 0.2 }
fn default_min_training_samples() -> usize { 40 }
fn default_min_improvement() -> f64 { 0.02 }
fn default_rollback_threshold() -> f64 { 0.5 }
fn default_min_rollback_samples() -> usize { 30 }
fn default_max_versions() -> usize { 10 }
fn default_recency_half_life_days() -> f64 { 14.0 }
fn default_check_interval_secs() -> u64 { 900 }

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            min_samples: default_retrain_min_samples(),
            min_new_samples: default_min_new_samples(),
            data_threshold: default_data_threshold(),
            cooldown_hours: default_cooldown_hours(),
            schedule_interval_hours: default_schedule_interval_hours(),
            max_samples: default_max_samples(),
            validation_fraction: default_validation_fraction(),
            min_training_samples: default_min_training_samples(),
            min_improvement: default_min_improvement(),
            rollback_threshold: default_rollback_threshold(),
            min_rollback_samples: default_min_rollback_samples(),
            max_versions: default_max_versions(),
            recency_half_life_days: default_recency_half_life_days(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

// ─── Feedback Ingestion ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seen event ids older than this are forgotten by the dedupe set.
    #[serde(default = "default_dedupe_retention_hours")]
    pub dedupe_retention_hours: i64,
    /// Delay before a new prediction becomes eligible for resolution.
    #[serde(default = "default_resolution_delay_hours")]
    pub resolution_delay_hours: i64,
}

fn default_queue_capacity() -> usize { 10_000 }
fn default_dedupe_retention_hours() -> i64 { 168 }
fn default_resolution_delay_hours() -> i64 { 24 }

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            dedupe_retention_hours: default_dedupe_retention_hours(),
            resolution_delay_hours: default_resolution_delay_hours(),
        }
    }
}

// ─── Platform Executor ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Record platform calls in memory instead of applying them.
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

fn default_max_retries() -> u32 { 4 }
fn default_initial_backoff_ms() -> u64 { 200 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_dry_run() -> bool { true }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            dry_run: default_dry_run(),
        }
    }
}

// ─── Decision Cycle ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_cycle_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrent_campaigns")]
    pub max_concurrent_campaigns: usize,
}

fn default_cycle_interval_secs() -> u64 { 3600 }
fn default_max_concurrent_campaigns() -> usize { 16 }

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cycle_interval_secs(),
            max_concurrent_campaigns: default_max_concurrent_campaigns(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            lifecycle: LifecycleConfig::default(),
            kill_switch: KillSwitchConfig::default(),
            allocator: AllocatorConfig::default(),
            budget: BudgetConfig::default(),
            learner: LearnerConfig::default(),
            accuracy: AccuracyConfig::default(),
            retrain: RetrainConfig::default(),
            feedback: FeedbackConfig::default(),
            executor: ExecutorConfig::default(),
            cycle: CycleConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file and environment variables.
    /// Environment values win over the file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("ADPILOT")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
