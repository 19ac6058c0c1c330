//! Metrics aggregation: raw platform counters into normalized per-variant
//! performance snapshots with derived ratios and a lifecycle state.

use adpilot_core::config::LifecycleConfig;
use adpilot_core::types::{
    safe_div, CampaignTargets, DerivedMetrics, LifecycleState, PerformanceSnapshot,
    PeriodComparison, VariantCounters,
};
use chrono::Utc;

/// Stateless transform; safe to share across tasks working on disjoint variants.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    config: LifecycleConfig,
}

impl MetricsAggregator {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    pub fn aggregate(&self, counters: &VariantCounters, targets: &CampaignTargets) -> PerformanceSnapshot {
        let derived = DerivedMetrics::compute(
            counters.impressions,
            counters.clicks,
            counters.conversions,
            counters.spend,
            counters.revenue,
        );

        let trend = match (counters.earlier, counters.recent) {
            (Some(earlier), Some(recent)) => Some(PeriodComparison {
                earlier_roas: safe_div(earlier.revenue, earlier.spend),
                recent_roas: safe_div(recent.revenue, recent.spend),
                earlier_spend: earlier.spend,
                recent_spend: recent.spend,
            }),
            _ => None,
        };

        PerformanceSnapshot {
            variant_id: counters.variant_id,
            campaign_id: counters.campaign_id,
            spend: counters.spend,
            budget: counters.budget,
            impressions: counters.impressions,
            clicks: counters.clicks,
            conversions: counters.conversions,
            revenue: counters.revenue,
            derived,
            hours_active: counters.hours_active,
            lifecycle_state: self.classify(counters, &derived, targets),
            trend,
            computed_at: Utc::now(),
        }
    }

    pub fn aggregate_all(
        &self,
        counters: &[VariantCounters],
        targets: &CampaignTargets,
    ) -> Vec<PerformanceSnapshot> {
        counters.iter().map(|c| self.aggregate(c, targets)).collect()
    }

    fn classify(
        &self,
        counters: &VariantCounters,
        derived: &DerivedMetrics,
        targets: &CampaignTargets,
    ) -> LifecycleState {
        if counters.paused {
            return LifecycleState::Paused;
        }
        if counters.hours_active < self.config.learning_period_hours
            || counters.spend < self.config.min_decision_spend
        {
            return LifecycleState::Learning;
        }
        if derived.roas >= targets.target_roas * self.config.winner_roas_multiple {
            LifecycleState::Scaling
        } else if derived.roas >= targets.target_roas {
            LifecycleState::Stable
        } else {
            LifecycleState::Declining
        }
    }
}
