pub mod applier;
pub mod cycle;
pub mod engine;
pub mod manager;
pub mod retrain_worker;

pub use applier::{ActionApplier, ApplyReport, RetryPolicy, StuckQueue};
pub use cycle::{CycleReport, DecisionCycle};
pub use engine::{CampaignDecision, DecisionEngine, NewCampaign, PredictionRequest};
pub use manager::AgentManager;
pub use retrain_worker::RetrainWorker;
