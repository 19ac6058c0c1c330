use adpilot_agents::{ActionApplier, DecisionCycle, DecisionEngine, NewCampaign, PredictionRequest};
use adpilot_core::config::AppConfig;
use adpilot_core::executor::{InMemoryExecutor, PlatformAction};
use adpilot_core::learning::MetricType;
use adpilot_core::types::{ConversionEvent, VariantCounters};
use adpilot_feedback::IngestAck;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    engine: Arc<DecisionEngine>,
    executor: Arc<InMemoryExecutor>,
    cycle: DecisionCycle,
    campaign_id: Uuid,
}

fn harness() -> Harness {
    let mut config = AppConfig::default();
    config.executor.initial_backoff_ms = 1;
    config.executor.max_backoff_ms = 1;
    config.feedback.resolution_delay_hours = 0;

    let engine = Arc::new(DecisionEngine::new(config.clone()));
    let executor = Arc::new(InMemoryExecutor::new());
    let applier = Arc::new(ActionApplier::new(
        executor.clone(),
        engine.store().clone(),
        &config.executor,
    ));
    let cycle = DecisionCycle::new(engine.clone(), applier, config.cycle.clone());
    let campaign_id = engine
        .register_campaign(NewCampaign {
            campaign_id: None,
            name: "Holiday push".into(),
            industry: "ecommerce".into(),
            objective: "purchases".into(),
            target_roas: Some(2.0),
            target_cpa: Some(25.0),
            target_cvr: None,
        })
        .unwrap()
        .campaign_id;

    Harness {
        engine,
        executor,
        cycle,
        campaign_id,
    }
}

fn sync(h: &Harness, budget: f64, spend: f64, revenue: f64, conversions: u64, hours: f64) -> Uuid {
    let variant_id = Uuid::new_v4();
    let mut c = VariantCounters::new(h.campaign_id, variant_id, budget);
    c.impressions = 25_000;
    c.clicks = 500;
    c.conversions = conversions;
    c.spend = spend;
    c.revenue = revenue;
    c.hours_active = hours;
    h.engine.sync_counters(c).unwrap();
    variant_id
}

fn purchase(event_id: &str, campaign_id: Uuid, creative_id: Uuid, value: f64) -> ConversionEvent {
    ConversionEvent {
        event_id: event_id.into(),
        event_name: "Purchase".into(),
        event_time: Utc::now(),
        campaign_id: None,
        creative_id: None,
        value,
        currency: "USD".into(),
        source_url: Some(format!(
            "https://shop.example.com/thanks?utm_campaign={campaign_id}&utm_content={creative_id}"
        )),
        custom_data: HashMap::new(),
    }
}

#[tokio::test]
async fn test_cycle_pauses_dud_and_scales_winner() {
    let h = harness();
    let dud = sync(&h, 80.0, 120.0, 0.0, 0, 72.0);
    let winner = sync(&h, 100.0, 142.0, 908.8, 20, 72.0);
    let learning = sync(&h, 40.0, 20.0, 0.0, 0, 6.0);

    let report = h.cycle.run_once().await;
    assert_eq!(report.failed_campaigns(), 0);
    assert_eq!(report.total_stuck(), 0);

    let applied = h.executor.applied();
    assert!(applied.contains(&PlatformAction::Pause { variant_id: dud }));

    let scaled = applied
        .iter()
        .find_map(|a| match a {
            PlatformAction::SetBudget { variant_id, amount } if *variant_id == winner => Some(*amount),
            _ => None,
        })
        .unwrap();
    assert!(scaled > 100.0);
    assert!(scaled <= 130.0);
    assert_eq!(h.engine.store().counters(&winner).unwrap().budget, scaled);

    let touched_learning = applied.iter().any(|a| match a {
        PlatformAction::SetBudget { variant_id, .. } | PlatformAction::Pause { variant_id } => {
            *variant_id == learning
        }
    });
    assert!(!touched_learning);
    assert_eq!(h.engine.store().counters(&learning).unwrap().budget, 40.0);

    let log = h.engine.kill_log(&h.campaign_id);
    assert_eq!(log.total_killed, 1);
    assert_eq!(log.kills_by_reason.get("no_conversions"), Some(&1));
}

#[tokio::test]
async fn test_stuck_pause_retried_next_cycle() {
    let h = harness();
    let dud = sync(&h, 80.0, 120.0, 0.0, 0, 72.0);

    h.executor.fail_next(5);
    let first = h.cycle.run_once().await;
    assert_eq!(first.total_stuck(), 1);
    assert!(!h.engine.store().counters(&dud).unwrap().paused);

    // the kill switch fires again, so the fresh pause supersedes the stuck one
    let second = h.cycle.run_once().await;
    assert_eq!(second.stuck_retry.superseded, 1);
    assert_eq!(second.total_applied(), 1);
    assert!(h.engine.store().counters(&dud).unwrap().paused);
    assert_eq!(h.executor.applied_count(), 1);
}

#[tokio::test]
async fn test_feedback_updates_counters_and_resolves_predictions() {
    let h = harness();
    let variant = sync(&h, 100.0, 142.0, 284.0, 10, 72.0);

    let prediction = h
        .engine
        .predict(PredictionRequest {
            model_type: "conversions".into(),
            metric_type: MetricType::Conversions,
            raw_value: 11.0,
            confidence: 0.8,
            campaign_id: h.campaign_id,
            creative_id: variant,
        })
        .unwrap();

    let receiver = h.engine.take_feedback_receiver().unwrap();
    let worker = h.engine.feedback().spawn_worker(receiver);

    let event = purchase("order-1001", h.campaign_id, variant, 42.0);
    assert_eq!(h.engine.ingest_conversion(event.clone()).unwrap(), IngestAck::Accepted);
    let mut redelivered = event;
    redelivered.value = 9_999.0;
    assert_eq!(h.engine.ingest_conversion(redelivered).unwrap(), IngestAck::Duplicate);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let resolved = h
            .engine
            .tracker()
            .prediction(&prediction.prediction_id)
            .map(|p| p.is_resolved())
            .unwrap_or(false);
        if resolved || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.abort();

    let counters = h.engine.store().counters(&variant).unwrap();
    assert_eq!(counters.conversions, 11);
    assert!((counters.revenue - 326.0).abs() < 1e-9);

    let resolved = h.engine.tracker().prediction(&prediction.prediction_id).unwrap();
    assert_eq!(resolved.actual_value, Some(11.0));
    assert_eq!(resolved.is_accurate, Some(true));

    let report = h.engine.get_accuracy_report(
        "conversions",
        adpilot_core::learning::TimeWindow {
            start: Utc::now() - ChronoDuration::hours(1),
            end: Utc::now() + ChronoDuration::hours(1),
        },
    );
    assert_eq!(report.resolved_predictions, 1);
    assert!(report.insufficient_data);
}
