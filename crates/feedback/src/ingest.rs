//! Conversion ingest with a non-blocking acknowledgement path.
//!
//! `ingest` only dedupes and enqueues. A background worker drains the queue,
//! attributes each event, folds it into the performance store and resolves
//! predictions that were waiting on this creative's outcome.

use crate::attribution::attribute;
use adpilot_core::config::FeedbackConfig;
use adpilot_core::error::{PilotError, PilotResult};
use adpilot_core::learning::MetricType;
use adpilot_core::store::PerformanceStore;
use adpilot_core::types::{ConversionEvent, DerivedMetrics, VariantCounters};
use adpilot_learning::PredictionAccuracyTracker;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVICTION_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestAck {
    Accepted,
    Duplicate,
    /// Queue full; the event was not recorded and may be redelivered.
    Backpressure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Applied {
        campaign_id: Uuid,
        creative_id: Uuid,
        resolved_predictions: usize,
    },
    Unattributed,
    Rejected {
        reason: String,
    },
}

pub struct FeedbackIngestor {
    config: FeedbackConfig,
    store: Arc<PerformanceStore>,
    tracker: Arc<PredictionAccuracyTracker>,
    /// event_id -> first seen
    seen: DashMap<String, DateTime<Utc>>,
    sender: mpsc::Sender<ConversionEvent>,
}

impl FeedbackIngestor {
    /// Build the ingestor and the receiving end of its queue. Hand the
    /// receiver to [`FeedbackIngestor::spawn_worker`].
    pub fn new(
        config: FeedbackConfig,
        store: Arc<PerformanceStore>,
        tracker: Arc<PredictionAccuracyTracker>,
    ) -> (Self, mpsc::Receiver<ConversionEvent>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        (
            Self {
                config,
                store,
                tracker,
                seen: DashMap::new(),
                sender,
            },
            receiver,
        )
    }

    /// Dedupe and enqueue. Never waits on downstream processing.
    pub fn ingest(&self, event: ConversionEvent) -> PilotResult<IngestAck> {
        if event.event_id.trim().is_empty() {
            return Err(PilotError::Validation("event_id must not be empty".into()));
        }
        if !event.value.is_finite() || event.value < 0.0 {
            return Err(PilotError::Validation(format!(
                "conversion value {} must be a non-negative number",
                event.value
            )));
        }

        // Marked seen only once queued; the entry guard spans the send.
        let event_id = event.event_id.clone();
        match self.seen.entry(event_id.clone()) {
            Entry::Occupied(_) => {
                metrics::counter!("feedback.duplicates").increment(1);
                debug!(event_id = %event_id, "Duplicate conversion ignored");
                Ok(IngestAck::Duplicate)
            }
            Entry::Vacant(slot) => match self.sender.try_send(event) {
                Ok(()) => {
                    slot.insert(Utc::now());
                    metrics::counter!("feedback.accepted").increment(1);
                    Ok(IngestAck::Accepted)
                }
                Err(e) => {
                    metrics::counter!("feedback.backpressure").increment(1);
                    warn!(event_id = %event_id, error = %e, "Conversion queue full");
                    Ok(IngestAck::Backpressure)
                }
            },
        }
    }

    pub fn process(&self, event: &ConversionEvent) -> ProcessOutcome {
        self.process_at(event, Utc::now())
    }

    pub fn process_at(&self, event: &ConversionEvent, now: DateTime<Utc>) -> ProcessOutcome {
        let Some(attribution) = attribute(event) else {
            metrics::counter!("feedback.unattributed").increment(1);
            warn!(
                event_id = %event.event_id,
                event_name = %event.event_name,
                "Conversion could not be attributed; dropped"
            );
            return ProcessOutcome::Unattributed;
        };

        let counters = match self.store.record_conversion(
            &attribution.campaign_id,
            &attribution.creative_id,
            event.value,
        ) {
            Ok(c) => c,
            Err(e) => {
                metrics::counter!("feedback.rejected").increment(1);
                warn!(event_id = %event.event_id, error = %e, "Conversion rejected");
                return ProcessOutcome::Rejected {
                    reason: e.to_string(),
                };
            }
        };

        let mut resolved = 0;
        for pending in self
            .tracker
            .pending_for(attribution.campaign_id, attribution.creative_id, now)
        {
            let actual = metric_actual(&counters, pending.metric_type);
            match self.tracker.record_actual_at(pending.prediction_id, actual, now) {
                Ok(_) => resolved += 1,
                // a concurrent event got there first
                Err(PilotError::AlreadyResolved(_)) => {}
                Err(e) => warn!(prediction_id = %pending.prediction_id, error = %e, "Failed to resolve prediction"),
            }
        }

        metrics::counter!("feedback.processed").increment(1);
        debug!(
            event_id = %event.event_id,
            campaign_id = %attribution.campaign_id,
            creative_id = %attribution.creative_id,
            source = ?attribution.source,
            resolved,
            "Conversion applied"
        );
        ProcessOutcome::Applied {
            campaign_id: attribution.campaign_id,
            creative_id: attribution.creative_id,
            resolved_predictions: resolved,
        }
    }

    /// Forget event ids older than the retention window.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(self.config.dedupe_retention_hours);
        let before = self.seen.len();
        self.seen.retain(|_, first_seen| *first_seen >= cutoff);
        before.saturating_sub(self.seen.len())
    }

    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Drain the queue until every sender is gone.
    pub fn spawn_worker(
        self: &Arc<Self>,
        mut receiver: mpsc::Receiver<ConversionEvent>,
    ) -> JoinHandle<()> {
        let ingestor = Arc::clone(self);
        tokio::spawn(async move {
            let mut eviction = tokio::time::interval(EVICTION_INTERVAL);
            info!("Feedback worker started");
            loop {
                tokio::select! {
                    event = receiver.recv() => match event {
                        Some(event) => {
                            ingestor.process(&event);
                        }
                        None => break,
                    },
                    _ = eviction.tick() => {
                        let evicted = ingestor.evict_expired(Utc::now());
                        if evicted > 0 {
                            debug!(evicted, "Evicted expired conversion ids");
                        }
                    }
                }
            }
            info!("Feedback worker stopped");
        })
    }
}

/// Current realized value of a metric from a variant's counters.
pub fn metric_actual(counters: &VariantCounters, metric: MetricType) -> f64 {
    let derived = DerivedMetrics::compute(
        counters.impressions,
        counters.clicks,
        counters.conversions,
        counters.spend,
        counters.revenue,
    );
    match metric {
        MetricType::Ctr => derived.ctr,
        MetricType::Cvr => derived.cvr,
        MetricType::Cpa => derived.cpa,
        MetricType::Roas => derived.roas,
        MetricType::Conversions => counters.conversions as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::config::AccuracyConfig;
    use adpilot_core::learning::NewPrediction;
    use adpilot_core::types::CampaignTargets;
    use std::collections::HashMap;

    struct Fixture {
        store: Arc<PerformanceStore>,
        tracker: Arc<PredictionAccuracyTracker>,
        campaign_id: Uuid,
        variant_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(PerformanceStore::new());
        let tracker = Arc::new(PredictionAccuracyTracker::new(AccuracyConfig::default(), 0));
        let campaign_id = Uuid::new_v4();
        let variant_id = Uuid::new_v4();
        store.register_campaign(
            campaign_id,
            "Spring sale",
            "ecommerce",
            "conversions",
            CampaignTargets {
                target_roas: 2.0,
                target_cpa: 25.0,
                target_cvr: 0.02,
            },
        );
        let mut counters = VariantCounters::new(campaign_id, variant_id, 100.0);
        counters.impressions = 10_000;
        counters.clicks = 300;
        counters.conversions = 10;
        counters.spend = 200.0;
        counters.revenue = 400.0;
        store.upsert_counters(counters).unwrap();
        Fixture {
            store,
            tracker,
            campaign_id,
            variant_id,
        }
    }

    fn conversion(f: &Fixture, event_id: &str) -> ConversionEvent {
        ConversionEvent {
            event_id: event_id.to_string(),
            event_name: "Purchase".into(),
            event_time: Utc::now(),
            campaign_id: Some(f.campaign_id),
            creative_id: Some(f.variant_id),
            value: 50.0,
            currency: "USD".into(),
            source_url: None,
            custom_data: HashMap::new(),
        }
    }

    #[test]
    fn test_redelivered_event_counted_once() {
        let f = fixture();
        let (ingestor, mut rx) =
            FeedbackIngestor::new(FeedbackConfig::default(), f.store.clone(), f.tracker.clone());

        let event = conversion(&f, "evt-123");
        assert_eq!(ingestor.ingest(event.clone()).unwrap(), IngestAck::Accepted);
        assert_eq!(ingestor.ingest(event.clone()).unwrap(), IngestAck::Duplicate);
        assert_eq!(ingestor.ingest(event).unwrap(), IngestAck::Duplicate);

        let mut processed = 0;
        while let Ok(queued) = rx.try_recv() {
            ingestor.process(&queued);
            processed += 1;
        }
        assert_eq!(processed, 1);
        let counters = f.store.counters(&f.variant_id).unwrap();
        assert_eq!(counters.conversions, 11);
        assert!((counters.revenue - 450.0).abs() < 1e-9);
    }

    #[test]
    fn test_full_queue_allows_redelivery() {
        let f = fixture();
        let config = FeedbackConfig {
            queue_capacity: 1,
            ..FeedbackConfig::default()
        };
        let (ingestor, mut rx) = FeedbackIngestor::new(config, f.store.clone(), f.tracker.clone());

        assert_eq!(ingestor.ingest(conversion(&f, "a")).unwrap(), IngestAck::Accepted);
        assert_eq!(ingestor.ingest(conversion(&f, "b")).unwrap(), IngestAck::Backpressure);
        assert_eq!(ingestor.queue_depth(), 1);

        rx.try_recv().unwrap();
        assert_eq!(ingestor.ingest(conversion(&f, "b")).unwrap(), IngestAck::Accepted);
    }

    #[test]
    fn test_concurrent_redelivery_under_backpressure_never_duplicate() {
        let f = fixture();
        let config = FeedbackConfig {
            queue_capacity: 1,
            ..FeedbackConfig::default()
        };
        let (ingestor, mut rx) = FeedbackIngestor::new(config, f.store.clone(), f.tracker.clone());
        assert_eq!(ingestor.ingest(conversion(&f, "a")).unwrap(), IngestAck::Accepted);

        let acks: Vec<IngestAck> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let ingestor = &ingestor;
                    let event = conversion(&f, "b");
                    scope.spawn(move || {
                        (0..50)
                            .map(|_| ingestor.ingest(event.clone()).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        assert!(acks.iter().all(|a| *a == IngestAck::Backpressure));

        rx.try_recv().unwrap();
        assert_eq!(ingestor.ingest(conversion(&f, "b")).unwrap(), IngestAck::Accepted);
        assert_eq!(ingestor.ingest(conversion(&f, "b")).unwrap(), IngestAck::Duplicate);
    }

    #[test]
    fn test_invalid_events_rejected() {
        let f = fixture();
        let (ingestor, _rx) =
            FeedbackIngestor::new(FeedbackConfig::default(), f.store.clone(), f.tracker.clone());
        assert!(ingestor.ingest(conversion(&f, " ")).is_err());
        let mut negative = conversion(&f, "neg");
        negative.value = -5.0;
        assert!(ingestor.ingest(negative).is_err());
    }

    #[test]
    fn test_unattributed_and_unknown_variant() {
        let f = fixture();
        let (ingestor, _rx) =
            FeedbackIngestor::new(FeedbackConfig::default(), f.store.clone(), f.tracker.clone());

        let mut anonymous = conversion(&f, "x");
        anonymous.campaign_id = None;
        anonymous.creative_id = None;
        assert_eq!(ingestor.process(&anonymous), ProcessOutcome::Unattributed);

        let mut stray = conversion(&f, "y");
        stray.creative_id = Some(Uuid::new_v4());
        assert!(matches!(
            ingestor.process(&stray),
            ProcessOutcome::Rejected { .. }
        ));
        assert_eq!(f.store.counters(&f.variant_id).unwrap().conversions, 10);
    }

    #[test]
    fn test_process_resolves_due_predictions() {
        let f = fixture();
        let (ingestor, _rx) =
            FeedbackIngestor::new(FeedbackConfig::default(), f.store.clone(), f.tracker.clone());
        let now = Utc::now();

        let predict = |metric: MetricType, value: f64, resolve_after: DateTime<Utc>| {
            f.tracker
                .record_prediction_at(
                    NewPrediction {
                        model_type: "conversions".into(),
                        model_version: 1,
                        predicted_value: value,
                        raw_value: None,
                        confidence: 0.7,
                        metric_type: metric,
                        campaign_id: f.campaign_id,
                        creative_id: f.variant_id,
                        resolve_after: Some(resolve_after),
                    },
                    now - Duration::hours(30),
                )
                .unwrap()
        };
        let due = predict(MetricType::Conversions, 11.0, now - Duration::hours(1));
        let roas = predict(MetricType::Roas, 2.0, now - Duration::hours(1));
        let later = predict(MetricType::Conversions, 11.0, now + Duration::hours(6));

        let outcome = ingestor.process_at(&conversion(&f, "evt-9"), now);
        assert!(matches!(
            outcome,
            ProcessOutcome::Applied {
                resolved_predictions: 2,
                ..
            }
        ));

        let due = f.tracker.prediction(&due.prediction_id).unwrap();
        assert_eq!(due.actual_value, Some(11.0));
        assert_eq!(due.is_accurate, Some(true));
        // 450 revenue over 200 spend
        let roas = f.tracker.prediction(&roas.prediction_id).unwrap();
        assert!((roas.actual_value.unwrap() - 2.25).abs() < 1e-9);
        assert!(!f.tracker.prediction(&later.prediction_id).unwrap().is_resolved());
    }

    #[test]
    fn test_evict_expired_ids() {
        let f = fixture();
        let (ingestor, _rx) =
            FeedbackIngestor::new(FeedbackConfig::default(), f.store.clone(), f.tracker.clone());
        ingestor.ingest(conversion(&f, "old")).unwrap();
        assert_eq!(ingestor.evict_expired(Utc::now()), 0);
        assert_eq!(ingestor.evict_expired(Utc::now() + Duration::hours(200)), 1);
        // forgotten ids are accepted again
        assert_eq!(
            ingestor.ingest(conversion(&f, "old")).unwrap(),
            IngestAck::Accepted
        );
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let f = fixture();
        let (ingestor, rx) =
            FeedbackIngestor::new(FeedbackConfig::default(), f.store.clone(), f.tracker.clone());
        let ingestor = Arc::new(ingestor);
        let worker = ingestor.spawn_worker(rx);

        for i in 0..5 {
            ingestor.ingest(conversion(&f, &format!("evt-{i}"))).unwrap();
        }
        for _ in 0..100 {
            if f.store.counters(&f.variant_id).unwrap().conversions == 15 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(f.store.counters(&f.variant_id).unwrap().conversions, 15);
        worker.abort();
    }
}
