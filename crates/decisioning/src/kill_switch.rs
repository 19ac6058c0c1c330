//! Kill switch: threshold checks that stop a variant before it wastes budget.
//!
//! Checks run in a fixed precedence and each has its own minimum sample size,
//! so sparse data never trips a kill. The evaluation path has no randomness:
//! an identical snapshot always yields an identical verdict.

use adpilot_core::config::KillSwitchConfig;
use adpilot_core::types::{
    CampaignTargets, KillDecision, KillReason, LifecycleState, PerformanceSnapshot,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Per-campaign kill statistics for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillLog {
    pub campaign_id: Uuid,
    pub total_evaluated: u64,
    pub total_killed: u64,
    pub kills_by_reason: HashMap<String, u64>,
    pub waste_prevented: f64,
}

struct Trip {
    reason: KillReason,
    confidence: f64,
    detail: String,
}

pub struct KillSwitchEvaluator {
    config: KillSwitchConfig,
    total_evaluated: DashMap<Uuid, u64>,
    kill_counts: DashMap<(Uuid, KillReason), u64>,
    waste_totals: DashMap<Uuid, f64>,
}

impl KillSwitchEvaluator {
    pub fn new(config: KillSwitchConfig) -> Self {
        Self {
            config,
            total_evaluated: DashMap::new(),
            kill_counts: DashMap::new(),
            waste_totals: DashMap::new(),
        }
    }

    pub fn evaluate(&self, snapshot: &PerformanceSnapshot, targets: &CampaignTargets) -> KillDecision {
        self.evaluate_at(snapshot, targets, Utc::now())
    }

    /// Evaluate with an explicit timestamp and count the verdict in the kill log.
    pub fn evaluate_at(
        &self,
        snapshot: &PerformanceSnapshot,
        targets: &CampaignTargets,
        now: DateTime<Utc>,
    ) -> KillDecision {
        let decision = self.assess(snapshot, targets, now);
        self.record(&decision);
        decision
    }

    /// Verdict without touching the kill log. Depends only on the snapshot,
    /// the targets and the configuration.
    pub fn assess(
        &self,
        snapshot: &PerformanceSnapshot,
        targets: &CampaignTargets,
        now: DateTime<Utc>,
    ) -> KillDecision {
        match snapshot.lifecycle_state {
            LifecycleState::Learning => Self::hold(snapshot, now, "insufficient data: learning phase"),
            LifecycleState::Paused => Self::hold(snapshot, now, "variant already paused"),
            _ => match self.first_trip(snapshot, targets) {
                Some(trip) => KillDecision {
                    variant_id: snapshot.variant_id,
                    campaign_id: snapshot.campaign_id,
                    should_kill: true,
                    reason: Some(trip.reason),
                    confidence: trip.confidence.clamp(0.0, 1.0),
                    waste_prevented: self.estimate_waste(snapshot),
                    detail: trip.detail,
                    evaluated_at: now,
                },
                None => Self::hold(snapshot, now, "all checks passed"),
            },
        }
    }

    /// Evaluate a whole campaign. Non-actionable variants yield a non-kill verdict.
    pub fn evaluate_all(
        &self,
        snapshots: &[PerformanceSnapshot],
        targets: &CampaignTargets,
    ) -> Vec<KillDecision> {
        let now = Utc::now();
        snapshots
            .iter()
            .map(|s| self.evaluate_at(s, targets, now))
            .collect()
    }

    pub fn get_kill_log(&self, campaign_id: &Uuid) -> KillLog {
        let mut by_reason = HashMap::new();
        for entry in self.kill_counts.iter() {
            let (cid, reason) = entry.key();
            if cid == campaign_id {
                by_reason.insert(reason.as_str().to_string(), *entry.value());
            }
        }
        KillLog {
            campaign_id: *campaign_id,
            total_evaluated: self.total_evaluated.get(campaign_id).map(|v| *v).unwrap_or(0),
            total_killed: by_reason.values().sum(),
            kills_by_reason: by_reason,
            waste_prevented: self.waste_totals.get(campaign_id).map(|v| *v).unwrap_or(0.0),
        }
    }

    fn first_trip(&self, s: &PerformanceSnapshot, targets: &CampaignTargets) -> Option<Trip> {
        let c = &self.config;
        let d = &s.derived;

        if s.impressions >= c.min_impressions && d.ctr < c.ctr_floor {
            return Some(Trip {
                reason: KillReason::LowCtr,
                confidence: Self::confidence(s.impressions as f64, c.min_impressions as f64, d.ctr, c.ctr_floor),
                detail: format!(
                    "CTR {:.4} below floor {:.4} after {} impressions",
                    d.ctr, c.ctr_floor, s.impressions
                ),
            });
        }

        // Zero-conversion variants are handled by the no-conversions check.
        if s.conversions > 0 && s.clicks >= c.min_clicks && d.cvr < c.cvr_floor {
            return Some(Trip {
                reason: KillReason::LowCvr,
                confidence: Self::confidence(s.clicks as f64, c.min_clicks as f64, d.cvr, c.cvr_floor),
                detail: format!(
                    "CVR {:.4} below floor {:.4} after {} clicks",
                    d.cvr, c.cvr_floor, s.clicks
                ),
            });
        }

        let cpa_ceiling = targets.target_cpa * c.cpa_multiple;
        if s.conversions >= c.min_conversions && targets.target_cpa > 0.0 && d.cpa > cpa_ceiling {
            return Some(Trip {
                reason: KillReason::HighCpa,
                confidence: Self::confidence(
                    s.conversions as f64,
                    c.min_conversions as f64,
                    cpa_ceiling,
                    d.cpa,
                ),
                detail: format!(
                    "CPA {:.2} above {:.1}x target ({:.2}) after {} conversions",
                    d.cpa, c.cpa_multiple, targets.target_cpa, s.conversions
                ),
            });
        }

        if s.conversions > 0 && s.spend >= c.min_spend_for_roas && d.roas < c.roas_floor {
            return Some(Trip {
                reason: KillReason::NegativeRoas,
                confidence: Self::confidence(s.spend, c.min_spend_for_roas, d.roas, c.roas_floor),
                detail: format!(
                    "ROAS {:.2} below floor {:.2} after spend {:.2}",
                    d.roas, c.roas_floor, s.spend
                ),
            });
        }

        if s.conversions == 0 && s.spend >= c.min_spend_no_conversions {
            return Some(Trip {
                reason: KillReason::NoConversions,
                confidence: Self::confidence(s.spend, c.min_spend_no_conversions, 0.0, 1.0),
                detail: format!(
                    "no conversions after spend {:.2} over {:.0} hours",
                    s.spend, s.hours_active
                ),
            });
        }

        if let Some(trend) = &s.trend {
            let enough = trend.earlier_spend >= c.min_window_spend && trend.recent_spend >= c.min_window_spend;
            let limit = trend.earlier_roas * (1.0 - c.decline_threshold);
            if enough && trend.earlier_roas > 0.0 && trend.recent_roas < limit {
                let drop = 1.0 - trend.recent_roas / trend.earlier_roas;
                return Some(Trip {
                    reason: KillReason::PerformanceDecline,
                    confidence: 0.5 + 0.5 * drop.min(1.0),
                    detail: format!(
                        "ROAS fell {:.0}% ({:.2} -> {:.2}) between sub-windows",
                        drop * 100.0,
                        trend.earlier_roas,
                        trend.recent_roas
                    ),
                });
            }
        }

        None
    }

    /// Half from how far past the minimum sample we are, half from how far
    /// the observed value sits below its limit.
    fn confidence(sample: f64, min_sample: f64, observed: f64, limit: f64) -> f64 {
        let sample_part = if min_sample > 0.0 {
            (sample / min_sample - 1.0).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let severity = if limit > 0.0 {
            (1.0 - observed / limit).clamp(0.0, 1.0)
        } else {
            0.0
        };
        0.5 + 0.25 * sample_part + 0.25 * severity
    }

    /// Spend the variant would have burned over the waste horizon at its
    /// average hourly rate, capped at its budget.
    fn estimate_waste(&self, s: &PerformanceSnapshot) -> f64 {
        if s.hours_active <= 0.0 {
            return 0.0;
        }
        let projected = s.spend / s.hours_active * self.config.waste_horizon_hours;
        if s.budget > 0.0 {
            projected.min(s.budget)
        } else {
            projected
        }
    }

    fn hold(s: &PerformanceSnapshot, now: DateTime<Utc>, detail: &str) -> KillDecision {
        KillDecision {
            variant_id: s.variant_id,
            campaign_id: s.campaign_id,
            should_kill: false,
            reason: None,
            confidence: 0.0,
            waste_prevented: 0.0,
            detail: detail.to_string(),
            evaluated_at: now,
        }
    }

    fn record(&self, decision: &KillDecision) {
        self.total_evaluated
            .entry(decision.campaign_id)
            .and_modify(|c| *c += 1)
            .or_insert(1);

        if let Some(reason) = decision.reason.filter(|_| decision.should_kill) {
            self.kill_counts
                .entry((decision.campaign_id, reason))
                .and_modify(|c| *c += 1)
                .or_insert(1);
            *self.waste_totals.entry(decision.campaign_id).or_insert(0.0) += decision.waste_prevented;
            metrics::counter!("kill_switch.kills", "reason" => reason.as_str()).increment(1);
        }
    }
}

impl Default for KillSwitchEvaluator {
    fn default() -> Self {
        Self::new(KillSwitchConfig::default())
    }
}
