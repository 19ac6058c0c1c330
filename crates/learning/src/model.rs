//! Versioned calibration models and the registry that serves them.
//!
//! Each model type carries a linear calibration applied to the upstream raw
//! prediction. Versions are appended to a bounded log and a pointer selects
//! the one in production. Promotion and rollback only move that pointer, so
//! readers always see a complete version.

use adpilot_core::error::{PilotError, PilotResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// `calibrated = intercept + slope × raw`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CalibrationModel {
    pub intercept: f64,
    pub slope: f64,
}

impl CalibrationModel {
    pub fn identity() -> Self {
        Self {
            intercept: 0.0,
            slope: 1.0,
        }
    }

    pub fn apply(&self, raw: f64) -> f64 {
        self.intercept + self.slope * raw
    }

    /// Weighted least squares over `(raw, actual, weight)` samples. With no
    /// spread in `raw` the slope is pinned to 1 and only the offset is fit.
    pub fn fit_weighted(samples: &[(f64, f64, f64)]) -> PilotResult<Self> {
        let total_weight: f64 = samples.iter().map(|(_, _, w)| w).sum();
        if samples.is_empty() || total_weight <= 0.0 || !total_weight.is_finite() {
            return Err(PilotError::Retrain("no weighted samples to fit".into()));
        }

        let mean_x = samples.iter().map(|(x, _, w)| w * x).sum::<f64>() / total_weight;
        let mean_y = samples.iter().map(|(_, y, w)| w * y).sum::<f64>() / total_weight;
        let sxx: f64 = samples
            .iter()
            .map(|(x, _, w)| w * (x - mean_x) * (x - mean_x))
            .sum();
        let sxy: f64 = samples
            .iter()
            .map(|(x, y, w)| w * (x - mean_x) * (y - mean_y))
            .sum();

        let model = if sxx.abs() < 1e-12 {
            Self {
                intercept: mean_y - mean_x,
                slope: 1.0,
            }
        } else {
            let slope = sxy / sxx;
            Self {
                intercept: mean_y - slope * mean_x,
                slope,
            }
        };

        if model.intercept.is_finite() && model.slope.is_finite() {
            Ok(model)
        } else {
            Err(PilotError::Retrain("fit produced non-finite coefficients".into()))
        }
    }
}

impl Default for CalibrationModel {
    fn default() -> Self {
        Self::identity()
    }
}

/// An immutable trained model version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelVersion {
    pub model_type: String,
    pub version: u32,
    pub calibration: CalibrationModel,
    /// Version that was in production when this one was promoted.
    pub parent_version: Option<u32>,
    pub training_samples: usize,
    pub validation_accuracy: Option<f64>,
    pub trained_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Lineage {
    versions: Vec<Arc<ModelVersion>>,
    current: usize,
    /// When the current pointer last moved.
    activated_at: DateTime<Utc>,
}

impl Lineage {
    fn seed(model_type: &str) -> Self {
        let now = Utc::now();
        Self {
            versions: vec![Arc::new(ModelVersion {
                model_type: model_type.to_string(),
                version: 1,
                calibration: CalibrationModel::identity(),
                parent_version: None,
                training_samples: 0,
                validation_accuracy: None,
                trained_at: now,
            })],
            current: 0,
            activated_at: now,
        }
    }

    fn position(&self, version: u32) -> Option<usize> {
        self.versions.iter().position(|v| v.version == version)
    }
}

/// Production pointer plus bounded version history for every model type.
pub struct ModelRegistry {
    max_versions: usize,
    lineages: DashMap<String, Arc<RwLock<Lineage>>>,
}

impl ModelRegistry {
    pub fn new(max_versions: usize) -> Self {
        Self {
            max_versions: max_versions.max(2),
            lineages: DashMap::new(),
        }
    }

    fn lineage(&self, model_type: &str) -> Arc<RwLock<Lineage>> {
        self.lineages
            .entry(model_type.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Lineage::seed(model_type))))
            .clone()
    }

    /// The version currently in production. Unknown model types start at an
    /// identity version 1.
    pub fn current(&self, model_type: &str) -> Arc<ModelVersion> {
        let lineage = self.lineage(model_type);
        let guard = lineage.read();
        guard.versions[guard.current].clone()
    }

    /// When the production pointer last moved for this model type.
    pub fn activated_at(&self, model_type: &str) -> DateTime<Utc> {
        self.lineage(model_type).read().activated_at
    }

    /// Calibrate a raw prediction with the production version.
    pub fn predict(&self, model_type: &str, raw: f64) -> (u32, f64) {
        let current = self.current(model_type);
        (current.version, current.calibration.apply(raw))
    }

    pub fn versions(&self, model_type: &str) -> Vec<Arc<ModelVersion>> {
        self.lineage(model_type).read().versions.clone()
    }

    pub fn model_types(&self) -> Vec<String> {
        self.lineages.iter().map(|e| e.key().clone()).collect()
    }

    /// Append a new version and point production at it.
    pub fn promote(
        &self,
        model_type: &str,
        calibration: CalibrationModel,
        training_samples: usize,
        validation_accuracy: f64,
    ) -> Arc<ModelVersion> {
        let lineage = self.lineage(model_type);
        let mut guard = lineage.write();
        let guard = &mut *guard;

        let parent = guard.versions[guard.current].version;
        let next = guard
            .versions
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1;
        let version = Arc::new(ModelVersion {
            model_type: model_type.to_string(),
            version: next,
            calibration,
            parent_version: Some(parent),
            training_samples,
            validation_accuracy: Some(validation_accuracy),
            trained_at: Utc::now(),
        });
        guard.versions.push(version.clone());
        guard.current = guard.versions.len() - 1;
        guard.activated_at = Utc::now();

        // Trim history, never dropping the current version or its parent.
        while guard.versions.len() > self.max_versions {
            let current_version = guard.versions[guard.current].version;
            let drop_at = guard
                .versions
                .iter()
                .position(|v| v.version != current_version && v.version != parent);
            match drop_at {
                Some(idx) => {
                    guard.versions.remove(idx);
                    if idx < guard.current {
                        guard.current -= 1;
                    }
                }
                None => break,
            }
        }

        info!(model_type, version = next, parent, "Model version promoted");
        metrics::counter!("models.promotions", "model_type" => model_type.to_string()).increment(1);
        version
    }

    /// Move production back to the current version's parent. Returns the
    /// restored version, or `None` when there is nothing to roll back to.
    pub fn rollback(&self, model_type: &str) -> Option<Arc<ModelVersion>> {
        let lineage = self.lineage(model_type);
        let mut guard = lineage.write();
        let guard = &mut *guard;

        let from = guard.versions[guard.current].clone();
        let parent = from.parent_version?;
        let idx = guard.position(parent)?;
        guard.current = idx;
        guard.activated_at = Utc::now();

        let restored = guard.versions[idx].clone();
        info!(
            model_type,
            from = from.version,
            to = restored.version,
            "Model version rolled back"
        );
        metrics::counter!("models.rollbacks", "model_type" => model_type.to_string()).increment(1);
        Some(restored)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(10)
    }
}
