//! Conversion feedback: attribution of incoming events and the ingest queue
//! that folds them into live counters and resolves pending predictions.

pub mod attribution;
pub mod ingest;

pub use attribution::{attribute, Attribution, AttributionSource};
pub use ingest::{FeedbackIngestor, IngestAck, ProcessOutcome};
