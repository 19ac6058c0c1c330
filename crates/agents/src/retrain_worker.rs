//! Event-driven side of the learning loop: watches live accuracy, queues
//! retrain jobs when the triggers fire and runs them off the async runtime.

use adpilot_core::learning::RetrainJob;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::DecisionEngine;

#[derive(Debug, Default)]
pub struct RetrainTick {
    pub rollbacks: Vec<RetrainJob>,
    pub queued: Vec<RetrainJob>,
    pub finished: Vec<RetrainJob>,
}

pub struct RetrainWorker {
    engine: Arc<DecisionEngine>,
    interval: Duration,
}

impl RetrainWorker {
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        let interval = Duration::from_secs(engine.config().retrain.check_interval_secs.max(1));
        Self { engine, interval }
    }

    /// One pass: roll back regressed models, queue jobs for models whose
    /// triggers fire, then run everything pending.
    pub async fn tick(&self) -> RetrainTick {
        let pipeline = self.engine.retrain_pipeline().clone();
        let mut tick = RetrainTick::default();

        for model_type in self.engine.model_types() {
            if let Some(job) = pipeline.check_regression(&model_type) {
                tick.rollbacks.push(job);
                continue;
            }
            let decision = pipeline.should_retrain(&model_type);
            match decision.trigger {
                Some(trigger) if decision.should_retrain => {
                    info!(model_type = %model_type, reason = %decision.reason, "Retrain triggered");
                    tick.queued.push(pipeline.trigger(&model_type, trigger));
                }
                _ => debug!(model_type = %model_type, reason = %decision.reason, "No retrain"),
            }
        }

        for job in pipeline.pending_jobs() {
            let pipeline = pipeline.clone();
            let job_id = job.job_id;
            match tokio::task::spawn_blocking(move || pipeline.run(job_id)).await {
                Ok(Ok(finished)) => tick.finished.push(finished),
                Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "Retrain job could not run"),
                Err(e) => error!(job_id = %job_id, error = %e, "Retrain task panicked"),
            }
        }
        tick
    }

    /// Tick on the check interval, or immediately when a retrain is requested.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = self.interval.as_secs(), "Retrain worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.engine.retrain_requested() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let tick = self.tick().await;
                if !tick.finished.is_empty() || !tick.rollbacks.is_empty() {
                    info!(
                        finished = tick.finished.len(),
                        rollbacks = tick.rollbacks.len(),
                        "Retrain pass complete"
                    );
                }
            }
            info!("Retrain worker stopped");
        })
    }
}
