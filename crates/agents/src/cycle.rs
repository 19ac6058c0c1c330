//! Scheduled decision cycle.
//!
//! Each run decides every registered campaign, re-attempts stuck platform
//! calls that this run did not supersede, then applies the new decisions with
//! bounded concurrency. A campaign that fails is reported and skipped.

use adpilot_core::config::CycleConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::applier::{ActionApplier, ApplyReport};
use crate::engine::{CampaignDecision, DecisionEngine};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignOutcome {
    pub campaign_id: Uuid,
    pub kills: usize,
    pub recommendations: usize,
    pub skipped: usize,
    pub apply: ApplyReport,
    pub error: Option<String>,
}

impl CampaignOutcome {
    fn failed(campaign_id: Uuid, error: String) -> Self {
        Self {
            campaign_id,
            kills: 0,
            recommendations: 0,
            skipped: 0,
            apply: ApplyReport::default(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub campaigns: Vec<CampaignOutcome>,
    pub stuck_retry: ApplyReport,
}

impl CycleReport {
    pub fn failed_campaigns(&self) -> usize {
        self.campaigns.iter().filter(|c| c.error.is_some()).count()
    }

    pub fn total_applied(&self) -> usize {
        self.stuck_retry.applied + self.campaigns.iter().map(|c| c.apply.applied).sum::<usize>()
    }

    pub fn total_stuck(&self) -> usize {
        self.stuck_retry.stuck + self.campaigns.iter().map(|c| c.apply.stuck).sum::<usize>()
    }
}

pub struct DecisionCycle {
    engine: Arc<DecisionEngine>,
    applier: Arc<ActionApplier>,
    config: CycleConfig,
}

impl DecisionCycle {
    pub fn new(engine: Arc<DecisionEngine>, applier: Arc<ActionApplier>, config: CycleConfig) -> Self {
        Self {
            engine,
            applier,
            config,
        }
    }

    pub async fn run_once(&self) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timer = Instant::now();

        let mut campaigns = Vec::new();
        let mut decisions = Vec::new();
        for campaign_id in self.engine.store().campaign_ids() {
            match self.engine.decide_campaign(&campaign_id) {
                Ok(decision) => decisions.push(decision),
                Err(e) => {
                    warn!(cycle_id = %cycle_id, campaign_id = %campaign_id, error = %e, "Campaign decision failed");
                    campaigns.push(CampaignOutcome::failed(campaign_id, e.to_string()));
                }
            }
        }

        let fresh: HashSet<Uuid> = decisions
            .iter()
            .flat_map(|d| {
                d.kills
                    .iter()
                    .map(|k| k.variant_id)
                    .chain(d.plan.recommendations.iter().map(|r| r.variant_id))
            })
            .collect();
        let stuck_retry = self.applier.retry_stuck(&fresh).await;

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_campaigns.max(1)));
        let mut tasks: JoinSet<CampaignOutcome> = JoinSet::new();
        for decision in decisions {
            let applier = self.applier.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                apply_decision(&applier, cycle_id, decision).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => campaigns.push(outcome),
                Err(e) => error!(cycle_id = %cycle_id, error = %e, "Campaign apply task panicked"),
            }
        }

        let report = CycleReport {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            campaigns,
            stuck_retry,
        };

        metrics::counter!("cycle.runs").increment(1);
        metrics::histogram!("cycle.duration_seconds").record(timer.elapsed().as_secs_f64());
        info!(
            cycle_id = %cycle_id,
            campaigns = report.campaigns.len(),
            failed = report.failed_campaigns(),
            applied = report.total_applied(),
            stuck = report.total_stuck(),
            superseded = report.stuck_retry.superseded,
            "Decision cycle complete"
        );
        report
    }

    /// Run on the configured interval until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "Decision cycle started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Decision cycle stopped");
        })
    }
}

async fn apply_decision(applier: &ActionApplier, cycle_id: Uuid, decision: CampaignDecision) -> CampaignOutcome {
    let apply = applier.apply_campaign(cycle_id, &decision).await;
    CampaignOutcome {
        campaign_id: decision.campaign_id,
        kills: decision.kills.len(),
        recommendations: decision.plan.recommendations.len(),
        skipped: decision.plan.skipped.len(),
        apply,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewCampaign;
    use adpilot_core::config::AppConfig;
    use adpilot_core::executor::{InMemoryExecutor, PlatformAction};
    use adpilot_core::types::VariantCounters;

    fn setup() -> (Arc<DecisionEngine>, Arc<InMemoryExecutor>, DecisionCycle) {
        let mut config = AppConfig::default();
        config.executor.initial_backoff_ms = 1;
        config.executor.max_backoff_ms = 1;
        let engine = Arc::new(DecisionEngine::new(config.clone()));
        let executor = Arc::new(InMemoryExecutor::new());
        let applier = Arc::new(ActionApplier::new(
            executor.clone(),
            engine.store().clone(),
            &config.executor,
        ));
        let cycle = DecisionCycle::new(engine.clone(), applier, config.cycle);
        (engine, executor, cycle)
    }

    fn campaign(engine: &DecisionEngine) -> Uuid {
        engine
            .register_campaign(NewCampaign {
                campaign_id: None,
                name: "Spring".into(),
                industry: "travel".into(),
                objective: "bookings".into(),
                target_roas: Some(2.0),
                target_cpa: None,
                target_cvr: None,
            })
            .unwrap()
            .campaign_id
    }

    #[tokio::test]
    async fn test_empty_cycle() {
        let (_engine, executor, cycle) = setup();
        let report = cycle.run_once().await;
        assert!(report.campaigns.is_empty());
        assert_eq!(executor.applied_count(), 0);
    }

    #[tokio::test]
    async fn test_dud_variant_paused_once() {
        let (engine, executor, cycle) = setup();
        let cid = campaign(&engine);
        let dud = Uuid::new_v4();
        let mut c = VariantCounters::new(cid, dud, 80.0);
        c.impressions = 12_000;
        c.clicks = 240;
        c.spend = 120.0;
        c.hours_active = 72.0;
        engine.sync_counters(c).unwrap();

        let first = cycle.run_once().await;
        assert_eq!(first.campaigns.len(), 1);
        assert_eq!(first.campaigns[0].kills, 1);
        assert_eq!(executor.applied(), vec![PlatformAction::Pause { variant_id: dud }]);

        // paused variants are neither killed nor budgeted again
        let second = cycle.run_once().await;
        assert_eq!(second.campaigns[0].kills, 0);
        assert_eq!(second.campaigns[0].recommendations, 0);
        assert_eq!(executor.applied_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_apply_surfaces_in_report() {
        let (engine, executor, cycle) = setup();
        let cid = campaign(&engine);
        let mut c = VariantCounters::new(cid, Uuid::new_v4(), 80.0);
        c.impressions = 12_000;
        c.clicks = 240;
        c.spend = 120.0;
        c.hours_active = 72.0;
        engine.sync_counters(c).unwrap();

        executor.fail_next(100);
        let report = cycle.run_once().await;
        assert_eq!(report.total_stuck(), 1);
        assert_eq!(report.failed_campaigns(), 0);
        assert!(report.campaigns[0].apply.errors[0].contains(":pause"));
    }
}
