use thiserror::Error;
use uuid::Uuid;

pub type PilotResult<T> = Result<T, PilotError>;

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Prediction {0} already resolved")]
    AlreadyResolved(Uuid),

    #[error("Campaign learning below maturity threshold: {0}")]
    Immature(String),

    #[error("Platform executor error: {0}")]
    Executor(String),

    #[error("Retrain error: {0}")]
    Retrain(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PilotError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
