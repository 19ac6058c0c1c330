//! Learning loop: prediction accuracy, model retraining and cross-campaign
//! pattern transfer.

pub mod accuracy;
pub mod cross_campaign;
pub mod model;
pub mod retrain;

pub use accuracy::PredictionAccuracyTracker;
pub use cross_campaign::CrossCampaignLearner;
pub use model::{CalibrationModel, ModelRegistry, ModelVersion};
pub use retrain::{RetrainDecision, RetrainPipeline};
