//! Prediction accuracy tracking.
//!
//! Predictions are recorded when a model makes them and joined with the
//! realized value once feedback arrives. Reports are derived on demand from
//! the resolved records in a time window; nothing aggregate is stored.

use adpilot_core::config::{AccuracyConfig, ToleranceBands};
use adpilot_core::error::{PilotError, PilotResult};
use adpilot_core::learning::{
    AccuracyReport, AccuracyTrend, MetricType, NewPrediction, PredictionRecord, TimeWindow,
};
use adpilot_core::types::safe_div;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// Error figures for one prediction against its realized value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub error: f64,
    pub error_percent: f64,
    pub is_accurate: bool,
}

/// Score a prediction. A zero actual yields 0% error when the prediction was
/// also zero and 100% otherwise.
pub fn score(metric: MetricType, predicted: f64, actual: f64, bands: &ToleranceBands) -> Scored {
    let error = predicted - actual;
    let error_percent = if actual == 0.0 {
        if predicted == 0.0 {
            0.0
        } else {
            1.0
        }
    } else {
        (error / actual).abs()
    };
    Scored {
        error,
        error_percent,
        is_accurate: error_percent <= metric.tolerance(bands),
    }
}

/// Fraction of resolved records flagged accurate.
pub fn accuracy_rate(records: &[PredictionRecord]) -> f64 {
    let resolved = records.iter().filter(|r| r.is_resolved()).count();
    let accurate = records
        .iter()
        .filter(|r| r.is_accurate == Some(true))
        .count();
    safe_div(accurate as f64, resolved as f64)
}

pub struct PredictionAccuracyTracker {
    config: AccuracyConfig,
    resolution_delay: Duration,
    records: DashMap<Uuid, PredictionRecord>,
    /// model_type -> prediction ids, in insertion order
    by_model: DashMap<String, Vec<Uuid>>,
    /// (campaign_id, creative_id) -> prediction ids
    by_target: DashMap<(Uuid, Uuid), Vec<Uuid>>,
}

impl PredictionAccuracyTracker {
    pub fn new(config: AccuracyConfig, resolution_delay_hours: i64) -> Self {
        Self {
            config,
            resolution_delay: Duration::hours(resolution_delay_hours.max(0)),
            records: DashMap::new(),
            by_model: DashMap::new(),
            by_target: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AccuracyConfig {
        &self.config
    }

    pub fn record_prediction(&self, prediction: NewPrediction) -> PilotResult<PredictionRecord> {
        self.record_prediction_at(prediction, Utc::now())
    }

    pub fn record_prediction_at(
        &self,
        prediction: NewPrediction,
        now: DateTime<Utc>,
    ) -> PilotResult<PredictionRecord> {
        if prediction.model_type.trim().is_empty() {
            return Err(PilotError::Validation("model_type must not be empty".into()));
        }
        if !prediction.predicted_value.is_finite() {
            return Err(PilotError::Validation("predicted_value must be finite".into()));
        }
        if !(0.0..=1.0).contains(&prediction.confidence) {
            return Err(PilotError::Validation(format!(
                "confidence {} outside [0, 1]",
                prediction.confidence
            )));
        }

        let record = PredictionRecord {
            prediction_id: Uuid::new_v4(),
            model_type: prediction.model_type,
            model_version: prediction.model_version,
            predicted_value: prediction.predicted_value,
            raw_value: prediction.raw_value.unwrap_or(prediction.predicted_value),
            confidence: prediction.confidence,
            metric_type: prediction.metric_type,
            campaign_id: prediction.campaign_id,
            creative_id: prediction.creative_id,
            actual_value: None,
            error: None,
            error_percent: None,
            is_accurate: None,
            created_at: now,
            resolve_after: prediction
                .resolve_after
                .unwrap_or(now + self.resolution_delay),
            resolved_at: None,
        };

        let id = record.prediction_id;
        self.by_model
            .entry(record.model_type.clone())
            .or_default()
            .push(id);
        self.by_target
            .entry((record.campaign_id, record.creative_id))
            .or_default()
            .push(id);
        metrics::counter!("accuracy.predictions_recorded", "model_type" => record.model_type.clone())
            .increment(1);
        self.records.insert(id, record.clone());
        Ok(record)
    }

    pub fn record_actual(&self, prediction_id: Uuid, actual: f64) -> PilotResult<PredictionRecord> {
        self.record_actual_at(prediction_id, actual, Utc::now())
    }

    /// Resolve a prediction. A record resolves exactly once; the entry guard
    /// makes the check-and-set atomic.
    pub fn record_actual_at(
        &self,
        prediction_id: Uuid,
        actual: f64,
        now: DateTime<Utc>,
    ) -> PilotResult<PredictionRecord> {
        if !actual.is_finite() {
            return Err(PilotError::Validation("actual value must be finite".into()));
        }
        let mut record = self
            .records
            .get_mut(&prediction_id)
            .ok_or_else(|| PilotError::not_found("prediction", prediction_id))?;
        if record.is_resolved() {
            return Err(PilotError::AlreadyResolved(prediction_id));
        }

        let scored = score(
            record.metric_type,
            record.predicted_value,
            actual,
            &self.config.tolerances,
        );
        record.actual_value = Some(actual);
        record.error = Some(scored.error);
        record.error_percent = Some(scored.error_percent);
        record.is_accurate = Some(scored.is_accurate);
        record.resolved_at = Some(now);

        metrics::counter!("accuracy.predictions_resolved", "model_type" => record.model_type.clone())
            .increment(1);
        debug!(
            prediction_id = %prediction_id,
            model_type = %record.model_type,
            error_percent = scored.error_percent,
            accurate = scored.is_accurate,
            "Prediction resolved"
        );
        Ok(record.clone())
    }

    pub fn prediction(&self, prediction_id: &Uuid) -> Option<PredictionRecord> {
        self.records.get(prediction_id).map(|r| r.clone())
    }

    /// Unresolved predictions for a creative whose resolution delay has passed.
    pub fn pending_for(
        &self,
        campaign_id: Uuid,
        creative_id: Uuid,
        now: DateTime<Utc>,
    ) -> Vec<PredictionRecord> {
        let ids = match self.by_target.get(&(campaign_id, creative_id)) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.records.get(id).map(|r| r.clone()))
            .filter(|r| !r.is_resolved() && r.resolve_after <= now)
            .collect()
    }

    fn records_for(&self, model_type: &str) -> Vec<PredictionRecord> {
        let ids = match self.by_model.get(model_type) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.records.get(id).map(|r| r.clone()))
            .collect()
    }

    /// All resolved predictions for a model type, in creation order.
    pub fn resolved_for(&self, model_type: &str) -> Vec<PredictionRecord> {
        let mut resolved: Vec<PredictionRecord> = self
            .records_for(model_type)
            .into_iter()
            .filter(|r| r.is_resolved())
            .collect();
        resolved.sort_by_key(|r| r.created_at);
        resolved
    }

    /// Resolved predictions served by one model version since `since`.
    pub fn resolved_since(
        &self,
        model_type: &str,
        model_version: u32,
        since: DateTime<Utc>,
    ) -> Vec<PredictionRecord> {
        self.resolved_for(model_type)
            .into_iter()
            .filter(|r| r.model_version == model_version && r.created_at >= since)
            .collect()
    }

    pub fn model_types(&self) -> Vec<String> {
        self.by_model.iter().map(|e| e.key().clone()).collect()
    }

    pub fn resolved_count(&self, model_type: &str) -> usize {
        self.records_for(model_type)
            .iter()
            .filter(|r| r.is_resolved())
            .count()
    }

    pub fn get_accuracy_report(&self, model_type: &str, window: TimeWindow) -> AccuracyReport {
        let in_window: Vec<PredictionRecord> = self
            .records_for(model_type)
            .into_iter()
            .filter(|r| window.contains(r.created_at))
            .collect();
        let mut resolved: Vec<&PredictionRecord> =
            in_window.iter().filter(|r| r.is_resolved()).collect();
        resolved.sort_by_key(|r| r.created_at);

        let n = resolved.len();
        let accurate = resolved
            .iter()
            .filter(|r| r.is_accurate == Some(true))
            .count();
        let accuracy = safe_div(accurate as f64, n as f64);
        let abs_errors: Vec<f64> = resolved
            .iter()
            .map(|r| r.error.unwrap_or(0.0).abs())
            .collect();
        let mae = safe_div(abs_errors.iter().sum(), n as f64);
        let mape = safe_div(
            resolved
                .iter()
                .map(|r| r.error_percent.unwrap_or(0.0))
                .sum(),
            n as f64,
        );
        let rmse = safe_div(abs_errors.iter().map(|e| e * e).sum(), n as f64).sqrt();

        let insufficient = n < self.config.min_report_samples;
        let trend = if insufficient {
            AccuracyTrend::Stable
        } else {
            self.trend(&resolved)
        };
        let needs_retraining = !insufficient
            && (accuracy < self.config.accuracy_threshold || trend == AccuracyTrend::Declining);
        let confidence_adjustment = if insufficient {
            1.0
        } else {
            safe_div(accuracy, self.config.accuracy_threshold).clamp(0.5, 1.0)
        };

        AccuracyReport {
            model_type: model_type.to_string(),
            model_version: in_window.iter().map(|r| r.model_version).max(),
            window,
            total_predictions: in_window.len(),
            resolved_predictions: n,
            accurate_predictions: accurate,
            accuracy_rate: accuracy,
            mae,
            mape,
            rmse,
            trend,
            needs_retraining,
            confidence_adjustment,
            insufficient_data: insufficient,
        }
    }

    /// Compare the later half of the window against the earlier half.
    fn trend(&self, resolved: &[&PredictionRecord]) -> AccuracyTrend {
        let mid = resolved.len() / 2;
        let (earlier, later) = resolved.split_at(mid);
        if earlier.len() < self.config.min_trend_samples || later.len() < self.config.min_trend_samples {
            return AccuracyTrend::Stable;
        }
        let rate = |half: &[&PredictionRecord]| {
            let hits = half.iter().filter(|r| r.is_accurate == Some(true)).count();
            safe_div(hits as f64, half.len() as f64)
        };
        let delta = rate(later) - rate(earlier);
        if delta > self.config.trend_delta {
            AccuracyTrend::Improving
        } else if delta < -self.config.trend_delta {
            AccuracyTrend::Declining
        } else {
            AccuracyTrend::Stable
        }
    }
}

impl Default for PredictionAccuracyTracker {
    fn default() -> Self {
        Self::new(AccuracyConfig::default(), 0)
    }
}
