//! Platform executor contract: the only two operations this core needs from
//! an ad platform. Every call carries a request key so retries are idempotent.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

use crate::error::{PilotError, PilotResult};

#[async_trait]
pub trait PlatformExecutor: Send + Sync {
    async fn set_budget(&self, request_key: &str, variant_id: Uuid, amount: f64) -> PilotResult<()>;

    async fn pause(&self, request_key: &str, variant_id: Uuid) -> PilotResult<()>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlatformAction {
    SetBudget { variant_id: Uuid, amount: f64 },
    Pause { variant_id: Uuid },
}

/// Executor that records actions in memory. Used for dry-run mode and tests.
/// Repeated request keys are acknowledged without being applied twice.
#[derive(Default)]
pub struct InMemoryExecutor {
    applied: DashMap<String, PlatformAction>,
    failures_remaining: AtomicU32,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<PlatformAction> {
        self.applied.iter().map(|e| e.value().clone()).collect()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    fn check_failure(&self) -> PilotResult<()> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PilotError::Executor("injected transient failure".into()));
        }
        Ok(())
    }

    fn apply(&self, request_key: &str, action: PlatformAction) {
        if self.applied.contains_key(request_key) {
            tracing::debug!(request_key, "duplicate request key, already applied");
            return;
        }
        self.applied.insert(request_key.to_string(), action);
    }
}

#[async_trait]
impl PlatformExecutor for InMemoryExecutor {
    async fn set_budget(&self, request_key: &str, variant_id: Uuid, amount: f64) -> PilotResult<()> {
        self.check_failure()?;
        self.apply(request_key, PlatformAction::SetBudget { variant_id, amount });
        Ok(())
    }

    async fn pause(&self, request_key: &str, variant_id: Uuid) -> PilotResult<()> {
        self.check_failure()?;
        self.apply(request_key, PlatformAction::Pause { variant_id });
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}
