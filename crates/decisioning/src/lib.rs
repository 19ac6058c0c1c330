//! Decision engine internals: metrics aggregation, kill switch, bandit
//! budget allocation and bounded budget optimization.

pub mod aggregator;
pub mod allocator;
pub mod kill_switch;
pub mod optimizer;

pub use aggregator::MetricsAggregator;
pub use allocator::{BudgetAllocator, PosteriorStats, RewardPrior};
pub use kill_switch::KillSwitchEvaluator;
pub use optimizer::{BudgetOptimizer, OptimizationPlan};
