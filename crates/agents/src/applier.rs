//! Pushes computed decisions to the ad platform.
//!
//! Every call carries a request key derived from the cycle and variant, so a
//! retried call is never applied twice. Calls that exhaust their retries land
//! in the stuck queue and are re-attempted or superseded next cycle.

use adpilot_core::config::ExecutorConfig;
use adpilot_core::error::PilotResult;
use adpilot_core::executor::{PlatformAction, PlatformExecutor};
use adpilot_core::store::PerformanceStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::CampaignDecision;

const STUCK_QUEUE_CAPACITY: usize = 1024;

/// Budget changes smaller than a cent are not sent.
const MIN_BUDGET_CHANGE: f64 = 0.01;

// ─── Retry ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl From<&ExecutorConfig> for RetryPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (0-indexed), capped at `max_backoff_ms`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped_ms as u64)
    }
}

// ─── Stuck queue ────────────────────────────────────────────────────────

/// A platform call that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckAction {
    pub request_key: String,
    pub campaign_id: Uuid,
    pub action: PlatformAction,
    pub attempts: u32,
    pub last_error: String,
    pub stuck_at: DateTime<Utc>,
}

impl StuckAction {
    pub fn variant_id(&self) -> Uuid {
        action_variant(&self.action)
    }
}

pub struct StuckQueue {
    records: Mutex<VecDeque<StuckAction>>,
    max_size: usize,
    total_enqueued: AtomicU64,
    total_superseded: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckQueueMetrics {
    pub depth: usize,
    pub total_enqueued: u64,
    pub total_superseded: u64,
}

impl StuckQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
            total_enqueued: AtomicU64::new(0),
            total_superseded: AtomicU64::new(0),
        }
    }

    /// Enqueue a stuck action, evicting the oldest when full.
    pub fn enqueue(&self, action: StuckAction) {
        let mut queue = self.records.lock();
        if queue.len() >= self.max_size {
            if let Some(evicted) = queue.pop_front() {
                warn!(request_key = %evicted.request_key, "Stuck queue full, dropping oldest action");
            }
        }
        queue.push_back(action);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("executor.stuck_depth").set(queue.len() as f64);
    }

    /// Take every queued action, oldest first.
    pub fn drain(&self) -> Vec<StuckAction> {
        let mut queue = self.records.lock();
        metrics::gauge!("executor.stuck_depth").set(0.0);
        queue.drain(..).collect()
    }

    pub fn peek(&self, limit: usize) -> Vec<StuckAction> {
        self.records.lock().iter().take(limit).cloned().collect()
    }

    pub fn depth(&self) -> usize {
        self.records.lock().len()
    }

    fn mark_superseded(&self) {
        self.total_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> StuckQueueMetrics {
        StuckQueueMetrics {
            depth: self.depth(),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_superseded: self.total_superseded.load(Ordering::Relaxed),
        }
    }
}

// ─── Applier ────────────────────────────────────────────────────────────

/// Outcome of applying one campaign's decisions, or of one stuck-queue pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub unchanged: usize,
    pub stuck: usize,
    pub superseded: usize,
    pub errors: Vec<String>,
}

impl ApplyReport {
    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.stuck += other.stuck;
        self.superseded += other.superseded;
        self.errors.extend(other.errors);
    }
}

pub fn request_key(cycle_id: Uuid, action: &PlatformAction) -> String {
    match action {
        PlatformAction::SetBudget { variant_id, .. } => format!("{cycle_id}:{variant_id}:budget"),
        PlatformAction::Pause { variant_id } => format!("{cycle_id}:{variant_id}:pause"),
    }
}

fn action_variant(action: &PlatformAction) -> Uuid {
    match action {
        PlatformAction::SetBudget { variant_id, .. } | PlatformAction::Pause { variant_id } => {
            *variant_id
        }
    }
}

fn action_label(action: &PlatformAction) -> &'static str {
    match action {
        PlatformAction::SetBudget { .. } => "set_budget",
        PlatformAction::Pause { .. } => "pause",
    }
}

pub struct ActionApplier {
    executor: Arc<dyn PlatformExecutor>,
    store: Arc<PerformanceStore>,
    policy: RetryPolicy,
    stuck: StuckQueue,
}

impl ActionApplier {
    pub fn new(
        executor: Arc<dyn PlatformExecutor>,
        store: Arc<PerformanceStore>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            executor,
            store,
            policy: RetryPolicy::from(config),
            stuck: StuckQueue::new(STUCK_QUEUE_CAPACITY),
        }
    }

    pub fn stuck_queue(&self) -> &StuckQueue {
        &self.stuck
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    /// Issue one call, retrying with backoff. Returns the attempts made, or
    /// the attempts and last error once retries are exhausted.
    pub async fn apply(&self, request_key: &str, action: &PlatformAction) -> Result<u32, (u32, String)> {
        let mut attempt = 0;
        loop {
            match self.call(request_key, action).await {
                Ok(()) => {
                    self.reflect(action);
                    metrics::counter!("executor.actions", "action" => action_label(action), "outcome" => "applied")
                        .increment(1);
                    return Ok(attempt + 1);
                }
                Err(e) if attempt < self.policy.max_retries => {
                    let backoff = self.policy.backoff_for_attempt(attempt);
                    debug!(
                        request_key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Platform call failed, retrying"
                    );
                    metrics::counter!("executor.retries").increment(1);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(request_key, attempts = attempt + 1, error = %e, "Platform call exhausted retries");
                    metrics::counter!("executor.actions", "action" => action_label(action), "outcome" => "stuck")
                        .increment(1);
                    return Err((attempt + 1, e.to_string()));
                }
            }
        }
    }

    async fn call(&self, request_key: &str, action: &PlatformAction) -> PilotResult<()> {
        match action {
            PlatformAction::SetBudget { variant_id, amount } => {
                self.executor.set_budget(request_key, *variant_id, *amount).await
            }
            PlatformAction::Pause { variant_id } => self.executor.pause(request_key, *variant_id).await,
        }
    }

    /// Mirror an applied call into the local counters.
    fn reflect(&self, action: &PlatformAction) {
        match action {
            PlatformAction::SetBudget { variant_id, amount } => self.store.set_budget(variant_id, *amount),
            PlatformAction::Pause { variant_id } => self.store.mark_paused(variant_id),
        }
    }

    async fn apply_or_park(
        &self,
        campaign_id: Uuid,
        request_key: String,
        action: PlatformAction,
        report: &mut ApplyReport,
    ) {
        match self.apply(&request_key, &action).await {
            Ok(_) => report.applied += 1,
            Err((attempts, last_error)) => {
                report.stuck += 1;
                report.errors.push(format!("{request_key}: {last_error}"));
                self.stuck.enqueue(StuckAction {
                    request_key,
                    campaign_id,
                    action,
                    attempts,
                    last_error,
                    stuck_at: Utc::now(),
                });
            }
        }
    }

    /// Apply one campaign's decisions: pauses first, then budget changes.
    /// A failed call never stops the rest of the batch.
    pub async fn apply_campaign(&self, cycle_id: Uuid, decision: &CampaignDecision) -> ApplyReport {
        let mut report = ApplyReport::default();

        for kill in &decision.kills {
            let action = PlatformAction::Pause {
                variant_id: kill.variant_id,
            };
            let key = request_key(cycle_id, &action);
            self.apply_or_park(decision.campaign_id, key, action, &mut report).await;
        }

        for rec in &decision.plan.recommendations {
            if rec.change_amount.abs() < MIN_BUDGET_CHANGE {
                report.unchanged += 1;
                continue;
            }
            let action = PlatformAction::SetBudget {
                variant_id: rec.variant_id,
                amount: rec.recommended_budget,
            };
            let key = request_key(cycle_id, &action);
            self.apply_or_park(decision.campaign_id, key, action, &mut report).await;
        }

        report
    }

    /// Re-attempt stuck actions under their original request keys. An action
    /// is superseded when this cycle decided something new for its variant,
    /// or when the variant has since been paused.
    pub async fn retry_stuck(&self, fresh: &HashSet<Uuid>) -> ApplyReport {
        let mut report = ApplyReport::default();
        for stuck in self.stuck.drain() {
            let variant_id = stuck.variant_id();
            let paused = self
                .store
                .counters(&variant_id)
                .map(|c| c.paused)
                .unwrap_or(false);
            if fresh.contains(&variant_id) || paused {
                debug!(request_key = %stuck.request_key, "Stuck action superseded");
                self.stuck.mark_superseded();
                report.superseded += 1;
                continue;
            }

            match self.apply(&stuck.request_key, &stuck.action).await {
                Ok(_) => report.applied += 1,
                Err((attempts, last_error)) => {
                    report.stuck += 1;
                    report.errors.push(format!("{}: {}", stuck.request_key, last_error));
                    self.stuck.enqueue(StuckAction {
                        attempts: stuck.attempts + attempts,
                        last_error,
                        ..stuck
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::executor::InMemoryExecutor;
    use adpilot_core::types::{
        BudgetCategory, BudgetRecommendation, CampaignTargets, KillDecision, KillReason,
        VariantCounters,
    };
    use adpilot_decisioning::OptimizationPlan;

    fn fast_config(max_retries: u32) -> ExecutorConfig {
        ExecutorConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..ExecutorConfig::default()
        }
    }

    fn setup(max_retries: u32) -> (Arc<InMemoryExecutor>, Arc<PerformanceStore>, ActionApplier, Uuid, Uuid) {
        let executor = Arc::new(InMemoryExecutor::new());
        let store = Arc::new(PerformanceStore::new());
        let campaign = Uuid::new_v4();
        store.register_campaign(
            campaign,
            "c",
            "retail",
            "sales",
            CampaignTargets {
                target_roas: 2.0,
                target_cpa: 25.0,
                target_cvr: 0.02,
            },
        );
        let variant = Uuid::new_v4();
        store
            .upsert_counters(VariantCounters::new(campaign, variant, 100.0))
            .unwrap();
        let applier = ActionApplier::new(executor.clone(), store.clone(), &fast_config(max_retries));
        (executor, store, applier, campaign, variant)
    }

    fn decision(campaign: Uuid, variant: Uuid, budget: f64, kill: bool) -> CampaignDecision {
        let kills = if kill {
            vec![KillDecision {
                variant_id: variant,
                campaign_id: campaign,
                should_kill: true,
                reason: Some(KillReason::NoConversions),
                confidence: 0.9,
                waste_prevented: 40.0,
                detail: "no conversions".into(),
                evaluated_at: Utc::now(),
            }]
        } else {
            vec![]
        };
        let recommendations = if kill {
            vec![]
        } else {
            vec![BudgetRecommendation {
                variant_id: variant,
                campaign_id: campaign,
                current_budget: 100.0,
                recommended_budget: budget,
                change_amount: budget - 100.0,
                change_percent: budget - 100.0,
                category: BudgetCategory::Winner,
                reason: "winner".into(),
                confidence: 0.9,
                priority: BudgetCategory::Winner.priority(),
            }]
        };
        CampaignDecision {
            campaign_id: campaign,
            kills,
            plan: OptimizationPlan {
                campaign_id: campaign,
                recommendations,
                skipped: vec![],
                total_current: 100.0,
                total_recommended: budget,
            },
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(6), Duration::from_millis(1_000));
    }

    #[test]
    fn test_stuck_queue_evicts_oldest() {
        let queue = StuckQueue::new(2);
        for i in 0..3 {
            queue.enqueue(StuckAction {
                request_key: format!("k{i}"),
                campaign_id: Uuid::new_v4(),
                action: PlatformAction::Pause {
                    variant_id: Uuid::new_v4(),
                },
                attempts: 1,
                last_error: "boom".into(),
                stuck_at: Utc::now(),
            });
        }
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.peek(1)[0].request_key, "k1");
        assert_eq!(queue.metrics().total_enqueued, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let (executor, store, applier, campaign, variant) = setup(3);
        executor.fail_next(2);
        let report = applier
            .apply_campaign(Uuid::new_v4(), &decision(campaign, variant, 125.0, false))
            .await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.stuck, 0);
        assert_eq!(executor.applied_count(), 1);
        assert_eq!(store.counters(&variant).unwrap().budget, 125.0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_park_action() {
        let (executor, store, applier, campaign, variant) = setup(1);
        executor.fail_next(5);
        let cycle = Uuid::new_v4();
        let report = applier
            .apply_campaign(cycle, &decision(campaign, variant, 125.0, false))
            .await;
        assert_eq!(report.stuck, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(applier.stuck_queue().depth(), 1);
        assert_eq!(store.counters(&variant).unwrap().budget, 100.0);

        let stuck = applier.stuck_queue().peek(1).remove(0);
        assert_eq!(stuck.attempts, 2);
        assert_eq!(stuck.request_key, format!("{cycle}:{variant}:budget"));
    }

    #[tokio::test]
    async fn test_stuck_action_reattempted_next_cycle() {
        let (executor, store, applier, campaign, variant) = setup(0);
        executor.fail_next(1);
        applier
            .apply_campaign(Uuid::new_v4(), &decision(campaign, variant, 125.0, false))
            .await;
        assert_eq!(applier.stuck_queue().depth(), 1);

        let report = applier.retry_stuck(&HashSet::new()).await;
        assert_eq!(report.applied, 1);
        assert_eq!(applier.stuck_queue().depth(), 0);
        assert_eq!(store.counters(&variant).unwrap().budget, 125.0);
    }

    #[tokio::test]
    async fn test_stuck_action_superseded_by_fresh_decision() {
        let (executor, _store, applier, campaign, variant) = setup(0);
        executor.fail_next(1);
        applier
            .apply_campaign(Uuid::new_v4(), &decision(campaign, variant, 125.0, false))
            .await;

        let fresh: HashSet<Uuid> = [variant].into_iter().collect();
        let report = applier.retry_stuck(&fresh).await;
        assert_eq!(report.superseded, 1);
        assert_eq!(executor.applied_count(), 0);
        assert_eq!(applier.stuck_queue().metrics().total_superseded, 1);
    }

    #[tokio::test]
    async fn test_pause_reflected_in_store() {
        let (executor, store, applier, campaign, variant) = setup(0);
        let report = applier
            .apply_campaign(Uuid::new_v4(), &decision(campaign, variant, 0.0, true))
            .await;
        assert_eq!(report.applied, 1);
        assert!(store.counters(&variant).unwrap().paused);
        assert_eq!(
            executor.applied(),
            vec![PlatformAction::Pause { variant_id: variant }]
        );
    }

    #[tokio::test]
    async fn test_sub_cent_changes_not_sent() {
        let (executor, _store, applier, campaign, variant) = setup(0);
        let report = applier
            .apply_campaign(Uuid::new_v4(), &decision(campaign, variant, 100.0, false))
            .await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(executor.applied_count(), 0);
    }
}
