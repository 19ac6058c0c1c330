//! Budget optimizer: turns allocator shares into bounded, prioritized budget
//! recommendations for one campaign. Never talks to a platform.

use adpilot_core::config::BudgetConfig;
use adpilot_core::types::{
    safe_div, BudgetCategory, BudgetRecommendation, CampaignTargets, LifecycleState,
    PerformanceSnapshot, SkippedVariant,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// All recommendations for one campaign in one cycle. Applied as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationPlan {
    pub campaign_id: Uuid,
    pub recommendations: Vec<BudgetRecommendation>,
    pub skipped: Vec<SkippedVariant>,
    pub total_current: f64,
    pub total_recommended: f64,
}

struct Draft {
    rec: BudgetRecommendation,
    lower: f64,
    upper: f64,
    /// The category proposed no change; batch rounding leaves it alone.
    holds: bool,
}

pub struct BudgetOptimizer {
    config: BudgetConfig,
    winner_multiple: f64,
}

impl BudgetOptimizer {
    pub fn new(config: BudgetConfig, winner_multiple: f64) -> Self {
        Self {
            config,
            winner_multiple,
        }
    }

    pub fn categorize(&self, roas: f64, targets: &CampaignTargets) -> BudgetCategory {
        let ratio = safe_div(roas, targets.target_roas);
        if ratio < self.config.loser_roas_ratio {
            BudgetCategory::Loser
        } else if ratio < 1.0 {
            BudgetCategory::Underperforming
        } else if ratio < self.winner_multiple {
            BudgetCategory::Stable
        } else {
            BudgetCategory::Winner
        }
    }

    /// Confidence grows with spend and conversions, saturating at 1.0.
    pub fn confidence(&self, snapshot: &PerformanceSnapshot) -> f64 {
        let spend_part = safe_div(snapshot.spend, self.config.confidence_spend_scale).min(1.0);
        let conv_part =
            safe_div(snapshot.conversions as f64, self.config.confidence_conversion_scale).min(1.0);
        0.5 * spend_part + 0.5 * conv_part
    }

    pub fn optimize(
        &self,
        campaign_id: Uuid,
        snapshots: &[PerformanceSnapshot],
        shares: &HashMap<Uuid, f64>,
        targets: &CampaignTargets,
    ) -> OptimizationPlan {
        let mut skipped = Vec::new();
        let mut eligible = Vec::new();
        for s in snapshots {
            if !s.lifecycle_state.is_actionable() {
                skipped.push(SkippedVariant {
                    variant_id: s.variant_id,
                    reason: match s.lifecycle_state {
                        LifecycleState::Paused => "variant paused".to_string(),
                        _ => "insufficient data: learning phase".to_string(),
                    },
                });
            } else if !shares.contains_key(&s.variant_id) {
                skipped.push(SkippedVariant {
                    variant_id: s.variant_id,
                    reason: "no allocation share".to_string(),
                });
            } else {
                eligible.push(s);
            }
        }

        let pool: f64 = eligible.iter().map(|s| s.budget).sum();
        let mut drafts: Vec<Draft> = eligible
            .iter()
            .map(|s| self.draft(s, shares[&s.variant_id] * pool, targets))
            .collect();

        round_batch(&mut drafts);

        let mut recommendations: Vec<BudgetRecommendation> =
            drafts.into_iter().map(|d| d.rec).collect();
        recommendations.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.change_amount.total_cmp(&b.change_amount))
        });

        let total_recommended = recommendations.iter().map(|r| r.recommended_budget).sum();
        debug!(
            campaign_id = %campaign_id,
            recommendations = recommendations.len(),
            skipped = skipped.len(),
            "Budget plan computed"
        );

        OptimizationPlan {
            campaign_id,
            recommendations,
            skipped,
            total_current: pool,
            total_recommended,
        }
    }

    fn draft(&self, s: &PerformanceSnapshot, share_target: f64, targets: &CampaignTargets) -> Draft {
        let current = s.budget;
        let category = self.categorize(s.derived.roas, targets);
        let confidence = self.confidence(s);
        let roas_ratio = safe_div(s.derived.roas, targets.target_roas);

        let (proposed, reason) = match category {
            BudgetCategory::Loser => (
                self.config.floor,
                format!("loser: ROAS at {:.2}x target, cutting toward floor", roas_ratio),
            ),
            BudgetCategory::Underperforming => (
                share_target.min(current * (1.0 - self.config.moderate_cut_pct)),
                format!("underperforming: ROAS at {:.2}x target, moderate cut", roas_ratio),
            ),
            BudgetCategory::Stable => (
                current,
                format!("stable: ROAS at {:.2}x target, holding", roas_ratio),
            ),
            BudgetCategory::Winner if confidence >= self.config.min_scale_confidence => (
                share_target.max(current * (1.0 + self.config.max_increase_pct * confidence)),
                format!("winner: ROAS at {:.2}x target, scaling", roas_ratio),
            ),
            BudgetCategory::Winner => (
                current,
                format!(
                    "winner: ROAS at {:.2}x target, holding until confidence {:.2} reaches {:.2}",
                    roas_ratio, confidence, self.config.min_scale_confidence
                ),
            ),
        };
        let holds = proposed == current;

        let upper = current * (1.0 + self.config.max_increase_pct);
        let lower = (current * (1.0 - self.config.max_decrease_pct)).max(self.config.floor);
        // A budget already under the floor steps toward it at the max rate.
        let recommended = if lower > upper {
            upper
        } else {
            proposed.clamp(lower, upper)
        };

        Draft {
            rec: BudgetRecommendation {
                variant_id: s.variant_id,
                campaign_id: s.campaign_id,
                current_budget: current,
                recommended_budget: recommended,
                change_amount: 0.0,
                change_percent: 0.0,
                category,
                reason,
                confidence,
                priority: category.priority(),
            },
            lower: lower.min(upper),
            upper,
            holds,
        }
    }
}

fn cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Round a campaign's budgets to cents as one batch, keeping every value in
/// its bounds and pushing the rounding residual onto the largest changing
/// budget that can absorb it. Holding budgets never take the residual.
fn round_batch(drafts: &mut [Draft]) {
    let raw_total: f64 = drafts.iter().map(|d| d.rec.recommended_budget).sum();
    for d in drafts.iter_mut() {
        d.rec.recommended_budget = round_within(d.rec.recommended_budget, d.lower, d.upper);
    }

    let rounded_total: f64 = drafts.iter().map(|d| d.rec.recommended_budget).sum();
    let residual = cents(cents(raw_total) - rounded_total);
    if residual != 0.0 {
        let candidate = drafts
            .iter_mut()
            .filter(|d| {
                let adjusted = d.rec.recommended_budget + residual;
                !d.holds && adjusted >= d.lower && adjusted <= d.upper
            })
            .max_by(|a, b| a.rec.recommended_budget.total_cmp(&b.rec.recommended_budget));
        if let Some(d) = candidate {
            d.rec.recommended_budget = cents(d.rec.recommended_budget + residual);
        }
    }

    for d in drafts.iter_mut() {
        let rec = &mut d.rec;
        rec.change_amount = rec.recommended_budget - rec.current_budget;
        rec.change_percent = safe_div(rec.change_amount, rec.current_budget) * 100.0;
    }
}

fn round_within(value: f64, lower: f64, upper: f64) -> f64 {
    let rounded = cents(value);
    if rounded > upper {
        (upper * 100.0).floor() / 100.0
    } else if rounded < lower {
        (lower * 100.0).ceil() / 100.0
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::config::LifecycleConfig;
    use adpilot_core::types::VariantCounters;
    use crate::aggregator::MetricsAggregator;

    fn targets() -> CampaignTargets {
        CampaignTargets {
            target_roas: 2.0,
            target_cpa: 25.0,
            target_cvr: 0.02,
        }
    }

    fn optimizer() -> BudgetOptimizer {
        BudgetOptimizer::new(BudgetConfig::default(), LifecycleConfig::default().winner_roas_multiple)
    }

    fn snapshot(campaign_id: Uuid, budget: f64, spend: f64, revenue: f64, conversions: u64) -> PerformanceSnapshot {
        let mut c = VariantCounters::new(campaign_id, Uuid::new_v4(), budget);
        c.impressions = 20_000;
        c.clicks = 400;
        c.conversions = conversions;
        c.spend = spend;
        c.revenue = revenue;
        c.hours_active = 72.0;
        MetricsAggregator::new(LifecycleConfig::default()).aggregate(&c, &targets())
    }

    fn equal_shares(snaps: &[PerformanceSnapshot]) -> HashMap<Uuid, f64> {
        let n = snaps.len() as f64;
        snaps.iter().map(|s| (s.variant_id, 1.0 / n)).collect()
    }

    #[test]
    fn test_categories() {
        let opt = optimizer();
        let t = targets();
        assert_eq!(opt.categorize(0.8, &t), BudgetCategory::Loser);
        assert_eq!(opt.categorize(1.5, &t), BudgetCategory::Underperforming);
        assert_eq!(opt.categorize(2.4, &t), BudgetCategory::Stable);
        assert_eq!(opt.categorize(6.4, &t), BudgetCategory::Winner);
    }

    #[test]
    fn test_scenario_winner_scales_within_cap() {
        let opt = optimizer();
        let campaign = Uuid::new_v4();
        // ROAS 6.4 on spend 142.
        let winner = snapshot(campaign, 100.0, 142.0, 908.8, 20);
        assert!(opt.confidence(&winner) >= 0.7);
        let plan = opt.optimize(campaign, &[winner.clone()], &equal_shares(&[winner.clone()]), &targets());

        let rec = &plan.recommendations[0];
        assert_eq!(rec.category, BudgetCategory::Winner);
        assert!(rec.change_amount > 0.0);
        assert!(rec.change_percent <= BudgetConfig::default().max_increase_pct * 100.0 + 1e-9);
    }

    #[test]
    fn test_bounds_hold_for_every_category() {
        let opt = optimizer();
        let config = BudgetConfig::default();
        let campaign = Uuid::new_v4();
        let snaps = vec![
            snapshot(campaign, 80.0, 200.0, 40.0, 4),    // loser
            snapshot(campaign, 33.33, 200.0, 300.0, 10), // underperforming
            snapshot(campaign, 57.0, 200.0, 450.0, 15),  // stable
            snapshot(campaign, 41.0, 200.0, 1200.0, 25), // winner
            snapshot(campaign, 12.0, 200.0, 20.0, 2),    // loser near floor
        ];
        let plan = opt.optimize(campaign, &snaps, &equal_shares(&snaps), &targets());
        assert_eq!(plan.recommendations.len(), 5);
        for rec in &plan.recommendations {
            let pct = (rec.recommended_budget - rec.current_budget).abs() / rec.current_budget;
            let cap = if rec.recommended_budget >= rec.current_budget {
                config.max_increase_pct
            } else {
                config.max_decrease_pct
            };
            assert!(pct <= cap + 1e-9, "{:?}", rec);
            assert!(rec.recommended_budget >= config.floor, "{:?}", rec);
        }
        // Losers come first.
        assert_eq!(plan.recommendations[0].priority, 1);
        assert_eq!(plan.recommendations.last().unwrap().priority, 3);
    }

    #[test]
    fn test_learning_variants_are_skipped() {
        let opt = optimizer();
        let campaign = Uuid::new_v4();
        let mut young = snapshot(campaign, 50.0, 10.0, 0.0, 0);
        young.lifecycle_state = LifecycleState::Learning;
        let plan = opt.optimize(campaign, &[young.clone()], &equal_shares(&[young]), &targets());
        assert!(plan.recommendations.is_empty());
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.skipped[0].reason.contains("insufficient data"));
    }

    #[test]
    fn test_low_confidence_winner_holds() {
        let opt = optimizer();
        let campaign = Uuid::new_v4();
        let winner = snapshot(campaign, 100.0, 60.0, 400.0, 2);
        let plan = opt.optimize(campaign, &[winner.clone()], &equal_shares(&[winner]), &targets());
        assert_eq!(plan.recommendations[0].change_amount, 0.0);
    }

    #[test]
    fn test_budget_under_floor_steps_up_at_max_rate() {
        let opt = optimizer();
        let config = BudgetConfig::default();
        let campaign = Uuid::new_v4();
        let snaps = vec![
            snapshot(campaign, 5.0, 200.0, 40.0, 4),   // loser
            snapshot(campaign, 5.0, 200.0, 450.0, 15), // stable
        ];
        let plan = opt.optimize(campaign, &snaps, &equal_shares(&snaps), &targets());
        assert_eq!(plan.recommendations.len(), 2);
        for rec in &plan.recommendations {
            assert!(config.floor > rec.current_budget);
            assert!((rec.recommended_budget - 6.5).abs() < 1e-9, "{:?}", rec);
            assert!(rec.change_amount > 0.0);
            assert!(rec.change_percent <= config.max_increase_pct * 100.0 + 1e-9);
        }
    }

    fn draft(current: f64, recommended: f64, category: BudgetCategory, holds: bool) -> Draft {
        Draft {
            rec: BudgetRecommendation {
                variant_id: Uuid::new_v4(),
                campaign_id: Uuid::nil(),
                current_budget: current,
                recommended_budget: recommended,
                change_amount: 0.0,
                change_percent: 0.0,
                category,
                reason: String::new(),
                confidence: 1.0,
                priority: category.priority(),
            },
            lower: current * 0.5,
            upper: current * 1.3,
            holds,
        }
    }

    #[test]
    fn test_rounding_residual_skips_holding_budgets() {
        let mut drafts = vec![
            draft(200.0, 200.0, BudgetCategory::Stable, true),
            draft(10.0, 10.004, BudgetCategory::Winner, false),
            draft(10.0, 10.004, BudgetCategory::Winner, false),
        ];
        round_batch(&mut drafts);
        assert_eq!(drafts[0].rec.recommended_budget, 200.0);
        assert_eq!(drafts[0].rec.change_amount, 0.0);
        let moved: f64 = drafts[1..].iter().map(|d| d.rec.recommended_budget).sum();
        assert!((moved - 20.01).abs() < 1e-9);
    }

    #[test]
    fn test_rounding_residual_dropped_when_only_holders_can_absorb() {
        // the winner sits at its cap, so only the holding budget has room
        let mut drafts = vec![
            draft(200.0, 200.0, BudgetCategory::Stable, true),
            draft(10.0, 13.006, BudgetCategory::Winner, false),
        ];
        round_batch(&mut drafts);
        assert_eq!(drafts[0].rec.recommended_budget, 200.0);
        assert!((drafts[1].rec.recommended_budget - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_budgets_rounded_to_cents() {
        let opt = optimizer();
        let campaign = Uuid::new_v4();
        let snaps = vec![
            snapshot(campaign, 33.33, 200.0, 300.0, 10),
            snapshot(campaign, 66.67, 200.0, 310.0, 10),
            snapshot(campaign, 45.55, 200.0, 1000.0, 25),
        ];
        let plan = opt.optimize(campaign, &snaps, &equal_shares(&snaps), &targets());
        for rec in &plan.recommendations {
            let scaled = rec.recommended_budget * 100.0;
            assert!((scaled - scaled.round()).abs() < 1e-6);
        }
    }
}
