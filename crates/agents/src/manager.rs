//! Agent manager: spawns and supervises the background tasks of one node,
//! namely the feedback worker, the decision cycle and the retrain worker.

use crate::applier::ActionApplier;
use crate::cycle::DecisionCycle;
use crate::engine::DecisionEngine;
use crate::retrain_worker::RetrainWorker;
use adpilot_core::executor::PlatformExecutor;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct AgentManager {
    engine: Arc<DecisionEngine>,
    applier: Arc<ActionApplier>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl AgentManager {
    pub fn new(engine: Arc<DecisionEngine>, executor: Arc<dyn PlatformExecutor>) -> Self {
        let applier = Arc::new(ActionApplier::new(
            executor,
            engine.store().clone(),
            &engine.config().executor,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            applier,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn only the feedback worker, so accepted conversions are drained
    /// when the scheduled loops are not running.
    pub fn start_feedback(&mut self) -> anyhow::Result<()> {
        let receiver = self
            .engine
            .take_feedback_receiver()
            .ok_or_else(|| anyhow::anyhow!("feedback worker already started"))?;
        self.handles.push(self.engine.feedback().spawn_worker(receiver));
        info!(node = %self.engine.config().node_id, "Feedback worker started");
        Ok(())
    }

    /// Spawn every background task.
    pub fn start(&mut self) -> anyhow::Result<()> {
        self.start_feedback()?;

        let cycle = Arc::new(DecisionCycle::new(
            self.engine.clone(),
            self.applier.clone(),
            self.engine.config().cycle.clone(),
        ));
        self.handles.push(cycle.spawn(self.shutdown.subscribe()));

        let retrain = Arc::new(RetrainWorker::new(self.engine.clone()));
        self.handles.push(retrain.spawn(self.shutdown.subscribe()));

        info!(
            count = self.handles.len(),
            node = %self.engine.config().node_id,
            executor = self.applier.executor_name(),
            "All agents started"
        );
        Ok(())
    }

    pub fn applier(&self) -> Arc<ActionApplier> {
        self.applier.clone()
    }

    /// Signal the scheduled tasks to stop. The feedback worker is aborted,
    /// since the engine keeps its queue open for the life of the process.
    pub fn shutdown(&mut self) {
        info!("Stopping agents");
        let _ = self.shutdown.send(true);
        if let Some(feedback) = self.handles.first() {
            feedback.abort();
        }
    }

    /// Wait for all tasks to complete.
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Agent task panicked"),
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }
}
