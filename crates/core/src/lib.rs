pub mod config;
pub mod error;
pub mod executor;
pub mod learning;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{PilotError, PilotResult};
pub use executor::{InMemoryExecutor, PlatformExecutor};
pub use store::PerformanceStore;
