//! Bandit budget allocator: posterior sampling with a softmax over samples.
//!
//! Each variant keeps Gaussian sufficient statistics over a reward blended
//! from ROAS and CVR (both normalized by the campaign target). A segment prior
//! from the cross-campaign learner is mixed into the posterior mean as a number
//! of pseudo-observations, so cold-start variants lean on the benchmark and
//! well-observed variants lean on their own data.

use adpilot_core::config::AllocatorConfig;
use adpilot_core::types::{
    safe_div, CampaignTargets, CounterWindow, DerivedMetrics, PerformanceSnapshot,
};
use dashmap::DashMap;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Welford running statistics over a variant's observed rewards.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PosteriorStats {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
}

impl PosteriorStats {
    /// Fold one observation in, returning the new statistics.
    pub fn observe(&self, reward: f64) -> Self {
        let count = self.count + 1;
        let delta = reward - self.mean;
        let mean = self.mean + delta / count as f64;
        let m2 = self.m2 + delta * (reward - mean);
        Self { count, mean, m2 }
    }

    /// Sample variance, once there are at least two observations.
    pub fn variance(&self) -> Option<f64> {
        if self.count >= 2 {
            Some(self.m2 / (self.count - 1) as f64)
        } else {
            None
        }
    }
}

/// Prior belief about a variant's reward, with the learner's confidence in it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RewardPrior {
    pub mean: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BlendedScore {
    pub mean: f64,
    pub std_dev: f64,
    pub own_weight: f64,
}

#[derive(Debug, Clone, Copy)]
struct CachedScore {
    count: u64,
    prior: RewardPrior,
    score: BlendedScore,
}

pub struct BudgetAllocator {
    config: AllocatorConfig,
    /// Arena of per-variant statistics. Entries are replaced wholesale.
    stats: DashMap<Uuid, PosteriorStats>,
    /// Cumulative counters already folded into `stats`.
    observed: DashMap<Uuid, CounterWindow>,
    score_cache: DashMap<Uuid, CachedScore>,
}

impl BudgetAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            stats: DashMap::new(),
            observed: DashMap::new(),
            score_cache: DashMap::new(),
        }
    }

    /// Blended reward for one snapshot. 1.0 means "exactly on target".
    pub fn reward(&self, snapshot: &PerformanceSnapshot, targets: &CampaignTargets) -> f64 {
        self.reward_for(&snapshot.derived, targets)
    }

    fn reward_for(&self, derived: &DerivedMetrics, targets: &CampaignTargets) -> f64 {
        self.config.roas_weight * safe_div(derived.roas, targets.target_roas)
            + self.config.cvr_weight * safe_div(derived.cvr, targets.target_cvr)
    }

    /// Convert a segment ROAS benchmark into a reward-space prior. The CVR
    /// component is assumed to sit on target.
    pub fn prior_from_benchmark(
        &self,
        benchmark_roas: f64,
        confidence: f64,
        targets: &CampaignTargets,
    ) -> RewardPrior {
        RewardPrior {
            mean: self.config.roas_weight * safe_div(benchmark_roas, targets.target_roas)
                + self.config.cvr_weight,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Record a reward observation for a variant and drop its cached scores.
    pub fn observe(&self, variant_id: Uuid, reward: f64) -> PosteriorStats {
        let reward = if reward.is_finite() { reward } else { 0.0 };
        let next = {
            let mut entry = self.stats.entry(variant_id).or_default();
            let next = entry.observe(reward);
            *entry = next;
            next
        };
        self.score_cache.remove(&variant_id);
        next
    }

    /// Observe the traffic an actionable snapshot added since the variant was
    /// last observed. Snapshots carry cumulative counters, so only the delta
    /// is a new sample; a snapshot with no new spend or impressions is skipped.
    /// Learning and paused variants are ignored.
    pub fn observe_snapshot(
        &self,
        snapshot: &PerformanceSnapshot,
        targets: &CampaignTargets,
    ) -> Option<PosteriorStats> {
        if !snapshot.lifecycle_state.is_actionable() {
            return None;
        }
        let totals = CounterWindow {
            impressions: snapshot.impressions,
            clicks: snapshot.clicks,
            conversions: snapshot.conversions,
            spend: snapshot.spend,
            revenue: snapshot.revenue,
        };
        let delta = {
            let mut seen = self.observed.entry(snapshot.variant_id).or_default();
            let delta = counter_delta(&seen, &totals);
            if delta.impressions == 0 && delta.spend <= 0.0 {
                return None;
            }
            *seen = totals;
            delta
        };
        let derived = DerivedMetrics::compute(
            delta.impressions,
            delta.clicks,
            delta.conversions,
            delta.spend,
            delta.revenue,
        );
        Some(self.observe(snapshot.variant_id, self.reward_for(&derived, targets)))
    }

    /// Copy of a variant's current statistics.
    pub fn stats(&self, variant_id: &Uuid) -> PosteriorStats {
        self.stats.get(variant_id).map(|s| *s).unwrap_or_default()
    }

    pub fn blended_score(&self, variant_id: &Uuid, prior: &RewardPrior) -> BlendedScore {
        let stats = self.stats(variant_id);
        if let Some(cached) = self.score_cache.get(variant_id) {
            if cached.count == stats.count && cached.prior == *prior {
                return cached.score;
            }
        }

        let n = stats.count as f64;
        let k = self.config.prior_strength * prior.confidence;
        let mean = if n + k > 0.0 {
            (n * stats.mean + k * prior.mean) / (n + k)
        } else {
            prior.mean
        };
        let variance = stats.variance().unwrap_or(self.config.prior_variance);
        let score = BlendedScore {
            mean,
            std_dev: (variance.max(0.0) / (n + k + 1.0)).sqrt(),
            own_weight: safe_div(n, n + k),
        };

        self.score_cache.insert(
            *variant_id,
            CachedScore {
                count: stats.count,
                prior: *prior,
                score,
            },
        );
        score
    }

    /// Allocation shares for the given variants, summing to 1.
    pub fn allocate(&self, variant_ids: &[Uuid], prior: &RewardPrior) -> HashMap<Uuid, f64> {
        let mut rng = rand::thread_rng();
        self.allocate_with_rng(variant_ids, prior, &mut rng)
    }

    pub fn allocate_with_rng<R: Rng + ?Sized>(
        &self,
        variant_ids: &[Uuid],
        prior: &RewardPrior,
        rng: &mut R,
    ) -> HashMap<Uuid, f64> {
        let samples: Vec<(Uuid, f64)> = variant_ids
            .iter()
            .map(|id| {
                let score = self.blended_score(id, prior);
                (*id, Self::sample(rng, &score))
            })
            .collect();
        softmax(&samples, self.config.temperature)
    }

    fn sample<R: Rng + ?Sized>(rng: &mut R, score: &BlendedScore) -> f64 {
        if score.std_dev <= 0.0 || !score.std_dev.is_finite() {
            return score.mean;
        }
        match Normal::new(score.mean, score.std_dev) {
            Ok(dist) => dist.sample(rng),
            Err(_) => score.mean,
        }
    }

    pub fn cached_scores(&self) -> usize {
        self.score_cache.len()
    }
}

impl Default for BudgetAllocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

/// Counters added between two cumulative readings. A reading below the
/// previous one means the platform reset its counters, so the whole reading
/// counts as new.
fn counter_delta(previous: &CounterWindow, current: &CounterWindow) -> CounterWindow {
    let reset = current.impressions < previous.impressions
        || current.clicks < previous.clicks
        || current.conversions < previous.conversions
        || current.spend < previous.spend
        || current.revenue < previous.revenue;
    if reset {
        return *current;
    }
    CounterWindow {
        impressions: current.impressions - previous.impressions,
        clicks: current.clicks - previous.clicks,
        conversions: current.conversions - previous.conversions,
        spend: current.spend - previous.spend,
        revenue: current.revenue - previous.revenue,
    }
}

/// Temperature softmax. Degenerate inputs fall back to a uniform split.
pub fn softmax(scores: &[(Uuid, f64)], temperature: f64) -> HashMap<Uuid, f64> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let t = if temperature.is_finite() && temperature > 0.0 {
        temperature
    } else {
        1.0
    };

    let max_score = scores.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<(Uuid, f64)> = scores
        .iter()
        .map(|(id, v)| (*id, ((v - max_score) / t).exp()))
        .collect();
    let denom: f64 = weights.iter().map(|(_, w)| w).sum();

    if denom <= 0.0 || !denom.is_finite() {
        let n = scores.len() as f64;
        return scores.iter().map(|(id, _)| (*id, 1.0 / n)).collect();
    }
    weights.into_iter().map(|(id, w)| (id, w / denom)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn neutral_prior() -> RewardPrior {
        RewardPrior {
            mean: 1.0,
            confidence: 0.0,
        }
    }

    #[test]
    fn test_welford_matches_direct_computation() {
        let values = [1.0, 2.0, 4.0, 7.0];
        let stats = values
            .iter()
            .fold(PosteriorStats::default(), |s, v| s.observe(*v));
        assert_eq!(stats.count, 4);
        assert!((stats.mean - 3.5).abs() < 1e-12);
        // sample variance of [1,2,4,7] = 7.0
        assert!((stats.variance().unwrap() - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_shares_sum_to_one() {
        let alloc = BudgetAllocator::default();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            for _ in 0..3 {
                alloc.observe(*id, i as f64 * 0.5);
            }
        }
        let mut rng = StdRng::seed_from_u64(7);
        let shares = alloc.allocate_with_rng(&ids, &neutral_prior(), &mut rng);
        assert_eq!(shares.len(), 5);
        let total: f64 = shares.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(shares.values().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn test_strong_variant_gets_more_budget_on_average() {
        let alloc = BudgetAllocator::default();
        let strong = Uuid::new_v4();
        let weak = Uuid::new_v4();
        for i in 0..20 {
            let jitter = (i % 3) as f64 * 0.05;
            alloc.observe(strong, 2.0 + jitter);
            alloc.observe(weak, 0.4 + jitter);
        }
        let mut rng = StdRng::seed_from_u64(42);
        let mut strong_total = 0.0;
        for _ in 0..50 {
            let shares = alloc.allocate_with_rng(&[strong, weak], &neutral_prior(), &mut rng);
            strong_total += shares[&strong];
        }
        assert!(strong_total / 50.0 > 0.8);
    }

    #[test]
    fn test_softmax_never_collapses_to_one_variant() {
        let shares = softmax(
            &[(Uuid::new_v4(), 1.2), (Uuid::new_v4(), 1.0)],
            0.5,
        );
        assert!(shares.values().all(|s| *s > 0.0 && *s < 1.0));
    }

    #[test]
    fn test_prior_weight_shrinks_with_own_data() {
        let alloc = BudgetAllocator::default();
        let id = Uuid::new_v4();
        let prior = RewardPrior {
            mean: 2.0,
            confidence: 1.0,
        };
        let cold = alloc.blended_score(&id, &prior);
        assert_eq!(cold.own_weight, 0.0);
        assert!((cold.mean - 2.0).abs() < 1e-12);

        for _ in 0..40 {
            alloc.observe(id, 0.5);
        }
        let warm = alloc.blended_score(&id, &prior);
        assert!(warm.own_weight > 0.75);
        assert!(warm.mean < 1.0);
        assert!(warm.std_dev < cold.std_dev);
    }

    #[test]
    fn test_cache_invalidated_on_observation() {
        let alloc = BudgetAllocator::default();
        let id = Uuid::new_v4();
        alloc.observe(id, 1.0);
        let before = alloc.blended_score(&id, &neutral_prior());
        assert_eq!(alloc.cached_scores(), 1);
        assert_eq!(alloc.blended_score(&id, &neutral_prior()), before);

        alloc.observe(id, 3.0);
        assert_eq!(alloc.cached_scores(), 0);
        let after = alloc.blended_score(&id, &neutral_prior());
        assert!(after.mean > before.mean);
    }

    fn targets() -> CampaignTargets {
        CampaignTargets {
            target_roas: 2.0,
            target_cpa: 20.0,
            target_cvr: 0.05,
        }
    }

    fn snapshot(
        variant_id: Uuid,
        impressions: u64,
        clicks: u64,
        conversions: u64,
        spend: f64,
        revenue: f64,
    ) -> PerformanceSnapshot {
        PerformanceSnapshot {
            variant_id,
            campaign_id: Uuid::nil(),
            spend,
            budget: 100.0,
            impressions,
            clicks,
            conversions,
            revenue,
            derived: DerivedMetrics::compute(impressions, clicks, conversions, spend, revenue),
            hours_active: 48.0,
            lifecycle_state: adpilot_core::types::LifecycleState::Stable,
            trend: None,
            computed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_observes_only_new_traffic() {
        let alloc = BudgetAllocator::default();
        let id = Uuid::new_v4();

        // roas 2.0 and cvr 0.05: exactly on target
        let first = alloc
            .observe_snapshot(&snapshot(id, 1000, 100, 5, 100.0, 200.0), &targets())
            .unwrap();
        assert_eq!(first.count, 1);
        assert!((first.mean - 1.0).abs() < 1e-12);

        for _ in 0..168 {
            assert!(alloc
                .observe_snapshot(&snapshot(id, 1000, 100, 5, 100.0, 200.0), &targets())
                .is_none());
        }
        assert_eq!(alloc.stats(&id).count, 1);

        // the next hour adds roas 3.0 at the same cvr: reward 0.7 * 1.5 + 0.3
        let second = alloc
            .observe_snapshot(&snapshot(id, 2000, 200, 10, 200.0, 500.0), &targets())
            .unwrap();
        assert_eq!(second.count, 2);
        assert!((second.mean - 1.175).abs() < 1e-12);
        assert!((second.variance().unwrap() - 0.06125).abs() < 1e-12);
    }

    #[test]
    fn test_counter_reset_counts_as_new_traffic() {
        let alloc = BudgetAllocator::default();
        let id = Uuid::new_v4();
        alloc.observe_snapshot(&snapshot(id, 5000, 500, 25, 500.0, 1000.0), &targets());
        let after_reset = alloc
            .observe_snapshot(&snapshot(id, 1000, 100, 5, 100.0, 200.0), &targets())
            .unwrap();
        assert_eq!(after_reset.count, 2);
        assert!((after_reset.mean - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_paused_snapshot_not_observed() {
        let alloc = BudgetAllocator::default();
        let id = Uuid::new_v4();
        let mut s = snapshot(id, 1000, 100, 5, 100.0, 200.0);
        s.lifecycle_state = adpilot_core::types::LifecycleState::Paused;
        assert!(alloc.observe_snapshot(&s, &targets()).is_none());
        assert_eq!(alloc.stats(&id).count, 0);
    }

    #[test]
    fn test_observation_only_evicts_own_cache_entry() {
        let alloc = BudgetAllocator::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        alloc.observe(a, 1.0);
        alloc.observe(b, 1.0);
        alloc.blended_score(&a, &neutral_prior());
        alloc.blended_score(&b, &neutral_prior());
        assert_eq!(alloc.cached_scores(), 2);
        alloc.observe(a, 2.0);
        assert_eq!(alloc.cached_scores(), 1);
    }

    #[test]
    fn test_empty_allocation() {
        let alloc = BudgetAllocator::default();
        assert!(alloc.allocate(&[], &neutral_prior()).is_empty());
    }
}
