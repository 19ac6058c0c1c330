//! Cross-campaign learner.
//!
//! Mature campaign learnings are folded into per-segment (industry ×
//! objective) running statistics. Benchmarks move by a data-point weighted
//! running average, so one large campaign counts for more than one small one.
//! Segment confidence only grows as data points accumulate.

use adpilot_core::config::LearnerConfig;
use adpilot_core::error::{PilotError, PilotResult};
use adpilot_core::learning::{
    CampaignLearning, IndustrySegmentInsight, PatternStat, RankedPattern, SegmentBenchmark,
    SegmentKey, SegmentRecommendation,
};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

pub struct CrossCampaignLearner {
    config: LearnerConfig,
    learnings: DashMap<Uuid, Vec<CampaignLearning>>,
    segments: DashMap<SegmentKey, IndustrySegmentInsight>,
}

impl CrossCampaignLearner {
    pub fn new(config: LearnerConfig) -> Self {
        Self {
            config,
            learnings: DashMap::new(),
            segments: DashMap::new(),
        }
    }

    /// `1 − e^(−n / scale)`: zero with no data, approaching one, never falling.
    pub fn segment_confidence(&self, sample_size: u64) -> f64 {
        let scale = self.config.confidence_scale.max(f64::EPSILON);
        1.0 - (-(sample_size as f64) / scale).exp()
    }

    pub fn is_mature(&self, learning: &CampaignLearning) -> bool {
        learning.data_points >= self.config.min_data_points
            || learning.total_spend >= self.config.min_total_spend
    }

    /// Fold a campaign learning into its segment. Immature learnings are
    /// rejected without touching any segment.
    pub fn record(&self, learning: CampaignLearning) -> PilotResult<IndustrySegmentInsight> {
        if learning.industry.trim().is_empty() || learning.objective.trim().is_empty() {
            return Err(PilotError::Validation(
                "industry and objective are required".into(),
            ));
        }
        if !self.is_mature(&learning) {
            metrics::counter!("learner.rejected_immature").increment(1);
            return Err(PilotError::Immature(format!(
                "campaign {} has {} data points and {:.2} spend",
                learning.campaign_id, learning.data_points, learning.total_spend
            )));
        }

        let key = SegmentKey::new(&learning.industry, &learning.objective);
        let insight = {
            let mut entry = self
                .segments
                .entry(key.clone())
                .or_insert_with(|| IndustrySegmentInsight {
                    segment: key.clone(),
                    sample_size: 0,
                    avg_roas: 0.0,
                    avg_ctr: 0.0,
                    avg_cpa: 0.0,
                    hooks: BTreeMap::new(),
                    ctas: BTreeMap::new(),
                    dimension_wins: BTreeMap::new(),
                    confidence: 0.0,
                    updated_at: Utc::now(),
                });
            let segment = &mut *entry;

            let dp = learning.data_points.max(1);
            let weight = dp as f64 / (segment.sample_size + dp) as f64;
            segment.avg_roas += weight * (learning.best_roas - segment.avg_roas);
            segment.avg_ctr += weight * (learning.best_ctr - segment.avg_ctr);
            segment.avg_cpa += weight * (learning.best_cpa - segment.avg_cpa);
            segment.sample_size += dp;

            for hook in &learning.winning_hooks {
                tally(&mut segment.hooks, hook, learning.best_roas);
            }
            for cta in &learning.winning_ctas {
                tally(&mut segment.ctas, cta, learning.best_roas);
            }
            for change in &learning.winning_patterns {
                *segment.dimension_wins.entry(change.dimension).or_insert(0) += 1;
            }

            segment.confidence = self.segment_confidence(segment.sample_size);
            segment.updated_at = Utc::now();
            segment.clone()
        };

        info!(
            industry = %key.industry,
            objective = %key.objective,
            campaign_id = %learning.campaign_id,
            sample_size = insight.sample_size,
            confidence = insight.confidence,
            "Campaign learning recorded"
        );
        self.learnings
            .entry(learning.campaign_id)
            .or_default()
            .push(learning);
        Ok(insight)
    }

    pub fn segment(&self, industry: &str, objective: &str) -> Option<IndustrySegmentInsight> {
        self.segments
            .get(&SegmentKey::new(industry, objective))
            .map(|s| s.clone())
    }

    pub fn learnings_for(&self, campaign_id: &Uuid) -> Vec<CampaignLearning> {
        self.learnings
            .get(campaign_id)
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    /// Benchmarks and ranked patterns for a segment. Unknown segments get the
    /// global aggregate (or configured defaults) with zero confidence.
    pub fn recommend(
        &self,
        industry: &str,
        objective: &str,
        top_k: Option<usize>,
    ) -> SegmentRecommendation {
        let key = SegmentKey::new(industry, objective);
        let k = top_k.unwrap_or(self.config.top_k);

        if let Some(segment) = self.segments.get(&key) {
            return SegmentRecommendation {
                segment: key,
                benchmarks: SegmentBenchmark {
                    roas: segment.avg_roas,
                    ctr: segment.avg_ctr,
                    cpa: segment.avg_cpa,
                    sample_size: segment.sample_size,
                },
                hooks: rank(&segment.hooks, k),
                ctas: rank(&segment.ctas, k),
                confidence: segment.confidence,
                is_fallback: false,
            };
        }

        debug!(industry, objective, "No segment data; using global fallback");
        self.global_fallback(key, k)
    }

    fn global_fallback(&self, key: SegmentKey, k: usize) -> SegmentRecommendation {
        let mut sample_size = 0u64;
        let (mut roas, mut ctr, mut cpa) = (0.0, 0.0, 0.0);
        let mut hooks: BTreeMap<String, PatternStat> = BTreeMap::new();
        let mut ctas: BTreeMap<String, PatternStat> = BTreeMap::new();

        for segment in self.segments.iter() {
            let n = segment.sample_size as f64;
            roas += n * segment.avg_roas;
            ctr += n * segment.avg_ctr;
            cpa += n * segment.avg_cpa;
            sample_size += segment.sample_size;
            merge(&mut hooks, &segment.hooks);
            merge(&mut ctas, &segment.ctas);
        }

        let benchmarks = if sample_size > 0 {
            let n = sample_size as f64;
            SegmentBenchmark {
                roas: roas / n,
                ctr: ctr / n,
                cpa: cpa / n,
                sample_size,
            }
        } else {
            SegmentBenchmark {
                roas: self.config.fallback_roas,
                ctr: self.config.fallback_ctr,
                cpa: self.config.fallback_cpa,
                sample_size: 0,
            }
        };

        SegmentRecommendation {
            segment: key,
            benchmarks,
            hooks: rank(&hooks, k),
            ctas: rank(&ctas, k),
            confidence: 0.0,
            is_fallback: true,
        }
    }

    /// ROAS benchmark and confidence for seeding a new campaign's allocator.
    pub fn prior_for(&self, industry: &str, objective: &str) -> (f64, f64) {
        let rec = self.recommend(industry, objective, Some(0));
        (rec.benchmarks.roas, rec.confidence)
    }
}

impl Default for CrossCampaignLearner {
    fn default() -> Self {
        Self::new(LearnerConfig::default())
    }
}

fn tally(stats: &mut BTreeMap<String, PatternStat>, value: &str, roas: f64) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    let stat = stats.entry(value.to_string()).or_default();
    stat.count += 1;
    stat.total_roas += roas;
}

fn merge(into: &mut BTreeMap<String, PatternStat>, from: &BTreeMap<String, PatternStat>) {
    for (value, stat) in from {
        let entry = into.entry(value.clone()).or_default();
        entry.count += stat.count;
        entry.total_roas += stat.total_roas;
    }
}

/// Highest average ROAS first; ties broken by frequency, then name.
fn rank(stats: &BTreeMap<String, PatternStat>, k: usize) -> Vec<RankedPattern> {
    let mut ranked: Vec<RankedPattern> = stats
        .iter()
        .map(|(value, stat)| RankedPattern {
            value: value.clone(),
            count: stat.count,
            avg_roas: stat.avg_roas(),
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.avg_roas
            .total_cmp(&a.avg_roas)
            .then(b.count.cmp(&a.count))
            .then(a.value.cmp(&b.value))
    });
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::learning::{VariationChange, VariationDimension};

    fn learning(industry: &str, roas: f64, data_points: u64, hooks: &[&str]) -> CampaignLearning {
        CampaignLearning {
            learning_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            industry: industry.to_string(),
            objective: "conversions".to_string(),
            winning_patterns: vec![VariationChange {
                dimension: VariationDimension::Hook,
                value: hooks.first().unwrap_or(&"none").to_string(),
            }],
            failed_patterns: vec![],
            winning_hooks: hooks.iter().map(|h| h.to_string()).collect(),
            winning_ctas: vec!["Shop now".to_string()],
            best_roas: roas,
            best_ctr: 0.02,
            best_cpa: 20.0,
            total_spend: 100.0,
            confidence_score: 0.8,
            data_points,
            extracted_at: Utc::now(),
        }
    }

    #[test]
    fn test_immature_learning_rejected() {
        let learner = CrossCampaignLearner::default();
        let result = learner.record(learning("ecommerce", 3.0, 10, &["Free shipping"]));
        assert!(matches!(result, Err(PilotError::Immature(_))));
        assert!(learner.segment("ecommerce", "conversions").is_none());
    }

    #[test]
    fn test_spend_alone_makes_learning_mature() {
        let learner = CrossCampaignLearner::default();
        let mut l = learning("ecommerce", 3.0, 10, &[]);
        l.total_spend = 800.0;
        assert!(learner.record(l).is_ok());
    }

    #[test]
    fn test_weighted_running_average() {
        let learner = CrossCampaignLearner::default();
        learner.record(learning("ecommerce", 2.0, 100, &[])).unwrap();
        let insight = learner.record(learning("ecommerce", 4.0, 300, &[])).unwrap();
        // (100×2 + 300×4) / 400
        assert!((insight.avg_roas - 3.5).abs() < 1e-9);
        assert_eq!(insight.sample_size, 400);
        assert_eq!(insight.dimension_wins[&VariationDimension::Hook], 2);
    }

    #[test]
    fn test_confidence_never_decreases() {
        let learner = CrossCampaignLearner::default();
        let mut last = 0.0;
        for roas in [1.0, 5.0, 0.5, 2.0, 3.0] {
            let insight = learner.record(learning("saas", roas, 60, &[])).unwrap();
            assert!(insight.confidence >= last);
            assert!(insight.confidence < 1.0);
            last = insight.confidence;
        }
    }

    #[test]
    fn test_segment_key_is_normalized() {
        let learner = CrossCampaignLearner::default();
        learner.record(learning(" Ecommerce ", 2.5, 80, &[])).unwrap();
        let rec = learner.recommend("ecommerce", "CONVERSIONS", None);
        assert!(!rec.is_fallback);
        assert!((rec.benchmarks.roas - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_hooks_ranked_by_roas() {
        let learner = CrossCampaignLearner::default();
        learner.record(learning("ecommerce", 1.5, 80, &["Limited time", "Free shipping"])).unwrap();
        learner.record(learning("ecommerce", 4.0, 80, &["Free shipping"])).unwrap();
        learner.record(learning("ecommerce", 3.0, 80, &["Bundle deal"])).unwrap();

        let rec = learner.recommend("ecommerce", "conversions", Some(2));
        let hooks: Vec<&str> = rec.hooks.iter().map(|h| h.value.as_str()).collect();
        assert_eq!(hooks, vec!["Bundle deal", "Free shipping"]);
        assert_eq!(rec.hooks[1].count, 2);
        assert_eq!(rec.ctas[0].value, "Shop now");
    }

    #[test]
    fn test_unknown_segment_falls_back_with_zero_confidence() {
        let learner = CrossCampaignLearner::default();
        let empty = learner.recommend("fintech", "leads", None);
        assert!(empty.is_fallback);
        assert_eq!(empty.confidence, 0.0);
        assert_eq!(empty.benchmarks.roas, LearnerConfig::default().fallback_roas);

        learner.record(learning("ecommerce", 3.0, 100, &["Free shipping"])).unwrap();
        let global = learner.recommend("fintech", "leads", None);
        assert!(global.is_fallback);
        assert_eq!(global.confidence, 0.0);
        assert!((global.benchmarks.roas - 3.0).abs() < 1e-9);
        assert_eq!(global.hooks[0].value, "Free shipping");
        assert_eq!(learner.prior_for("fintech", "leads"), (3.0, 0.0));
    }

    #[test]
    fn test_learnings_kept_per_campaign() {
        let learner = CrossCampaignLearner::default();
        let l = learning("ecommerce", 2.0, 100, &[]);
        let campaign = l.campaign_id;
        learner.record(l).unwrap();
        assert_eq!(learner.learnings_for(&campaign).len(), 1);
        assert!(learner.learnings_for(&Uuid::new_v4()).is_empty());
    }
}
