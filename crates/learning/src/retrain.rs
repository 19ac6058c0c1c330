//! Retrain pipeline: decides when a model type needs a new version, trains
//! a challenger on resolved predictions and promotes it only when it beats
//! the production version on the same held-out slice.

use crate::accuracy::{accuracy_rate, score, PredictionAccuracyTracker};
use crate::model::{CalibrationModel, ModelRegistry};
use adpilot_core::config::RetrainConfig;
use adpilot_core::error::{PilotError, PilotResult};
use adpilot_core::learning::{
    AccuracyTrend, PredictionRecord, RetrainJob, RetrainOutcome, RetrainStatus, RetrainTrigger,
    TimeWindow,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of a retrain check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrainDecision {
    pub model_type: String,
    pub should_retrain: bool,
    pub trigger: Option<RetrainTrigger>,
    pub reason: String,
    pub resolved_samples: usize,
    pub unseen_samples: usize,
    pub accuracy_rate: f64,
}

/// Where the last retrain attempt left off.
#[derive(Debug, Clone, Copy)]
struct Watermark {
    at: DateTime<Utc>,
    resolved: usize,
}

struct Evaluation {
    challenger: CalibrationModel,
    training_samples: usize,
    validation_samples: usize,
    old_accuracy: f64,
    new_accuracy: f64,
}

pub struct RetrainPipeline {
    config: RetrainConfig,
    tracker: Arc<PredictionAccuracyTracker>,
    registry: Arc<ModelRegistry>,
    jobs: DashMap<Uuid, RetrainJob>,
    /// model_type -> the one pending or running job
    active: DashMap<String, Uuid>,
    watermarks: DashMap<String, Watermark>,
}

impl RetrainPipeline {
    pub fn new(
        config: RetrainConfig,
        tracker: Arc<PredictionAccuracyTracker>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            config,
            tracker,
            registry,
            jobs: DashMap::new(),
            active: DashMap::new(),
            watermarks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn should_retrain(&self, model_type: &str) -> RetrainDecision {
        self.should_retrain_at(model_type, Utc::now())
    }

    /// Gates run in order: an active job, the cooldown, then enough unseen
    /// samples. Only then are the triggers checked, first match wins.
    pub fn should_retrain_at(&self, model_type: &str, now: DateTime<Utc>) -> RetrainDecision {
        let resolved = self.tracker.resolved_count(model_type);
        let watermark = self.watermarks.get(model_type).map(|w| *w);
        let unseen = resolved.saturating_sub(watermark.map(|w| w.resolved).unwrap_or(0));

        let report = self.tracker.get_accuracy_report(
            model_type,
            TimeWindow {
                start: now - Duration::hours(self.config.schedule_interval_hours),
                end: now,
            },
        );

        let decide = |trigger: Option<RetrainTrigger>, reason: String| RetrainDecision {
            model_type: model_type.to_string(),
            should_retrain: trigger.is_some(),
            trigger,
            reason,
            resolved_samples: resolved,
            unseen_samples: unseen,
            accuracy_rate: report.accuracy_rate,
        };

        if self.active.contains_key(model_type) {
            return decide(None, "retrain already in progress".into());
        }
        if let Some(w) = watermark {
            let ready_at = w.at + Duration::hours(self.config.cooldown_hours);
            if now < ready_at {
                return decide(None, format!("cooling down until {ready_at}"));
            }
        }
        if unseen < self.config.min_new_samples {
            return decide(
                None,
                format!(
                    "{unseen} new samples since last retrain, need {}",
                    self.config.min_new_samples
                ),
            );
        }

        let threshold = self.tracker.config().accuracy_threshold;
        if !report.insufficient_data
            && report.resolved_predictions >= self.config.min_samples
            && report.accuracy_rate < threshold
        {
            return decide(
                Some(RetrainTrigger::AccuracyDrop),
                format!(
                    "accuracy {:.3} below threshold {threshold:.3} over {} samples",
                    report.accuracy_rate, report.resolved_predictions
                ),
            );
        }
        if !report.insufficient_data && report.trend == AccuracyTrend::Declining {
            return decide(
                Some(RetrainTrigger::DriftDetected),
                "accuracy trend declining".into(),
            );
        }
        if unseen >= self.config.data_threshold {
            return decide(
                Some(RetrainTrigger::DataThreshold),
                format!("{unseen} new samples reached data threshold"),
            );
        }
        let since = watermark
            .map(|w| w.at)
            .unwrap_or_else(|| self.registry.current(model_type).trained_at);
        if now - since >= Duration::hours(self.config.schedule_interval_hours) {
            return decide(
                Some(RetrainTrigger::Scheduled),
                "scheduled retrain interval elapsed".into(),
            );
        }
        decide(None, "no trigger condition met".into())
    }

    /// Create a pending job, or return the one already active for this model type.
    pub fn trigger(&self, model_type: &str, trigger: RetrainTrigger) -> RetrainJob {
        match self.active.entry(model_type.to_string()) {
            Entry::Occupied(mut existing) => {
                if let Some(job) = self.jobs.get(existing.get()) {
                    return job.clone();
                }
                // index pointed at a vanished job; replace it
                let job = RetrainJob::pending(model_type, trigger);
                self.jobs.insert(job.job_id, job.clone());
                existing.insert(job.job_id);
                job
            }
            Entry::Vacant(slot) => {
                let job = RetrainJob::pending(model_type, trigger);
                self.jobs.insert(job.job_id, job.clone());
                slot.insert(job.job_id);
                info!(model_type, job_id = %job.job_id, trigger = ?trigger, "Retrain job queued");
                job
            }
        }
    }

    pub fn run(&self, job_id: Uuid) -> PilotResult<RetrainJob> {
        self.run_at(job_id, Utc::now())
    }

    /// Train, validate and maybe promote. Blocking; callers on an async
    /// runtime should move this onto a blocking thread.
    pub fn run_at(&self, job_id: Uuid, now: DateTime<Utc>) -> PilotResult<RetrainJob> {
        let model_type = {
            let mut job = self
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| PilotError::not_found("retrain job", job_id))?;
            if job.status != RetrainStatus::Pending {
                return Err(PilotError::Retrain(format!(
                    "job {job_id} is {:?}, expected pending",
                    job.status
                )));
            }
            job.status = RetrainStatus::Running;
            job.started_at = Some(now);
            job.model_type.clone()
        };

        let resolved_at_start = self.tracker.resolved_count(&model_type);
        let result = self.evaluate_challenger(&model_type, now);

        let finished = {
            let mut job = self
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| PilotError::not_found("retrain job", job_id))?;
            job.finished_at = Some(Utc::now());
            match result {
                Ok(eval) => {
                    let improvement = eval.new_accuracy - eval.old_accuracy;
                    job.training_samples = eval.training_samples;
                    job.validation_samples = eval.validation_samples;
                    job.old_accuracy = Some(eval.old_accuracy);
                    job.new_accuracy = Some(eval.new_accuracy);
                    job.improvement = Some(improvement);
                    if improvement >= self.config.min_improvement {
                        let version = self.registry.promote(
                            &model_type,
                            eval.challenger,
                            eval.training_samples,
                            eval.new_accuracy,
                        );
                        job.status = RetrainStatus::Completed;
                        job.outcome = Some(RetrainOutcome::Promoted);
                        job.model_version = Some(version.version);
                    } else {
                        job.status = RetrainStatus::Failed;
                        job.error = Some(format!(
                            "insufficient improvement: {improvement:+.3} < {:.3}",
                            self.config.min_improvement
                        ));
                    }
                }
                Err(reason) => {
                    job.status = RetrainStatus::Failed;
                    job.error = Some(reason);
                }
            }
            job.clone()
        };

        self.active.remove_if(&model_type, |_, id| *id == job_id);
        self.watermarks.insert(
            model_type.clone(),
            Watermark {
                at: now,
                resolved: resolved_at_start,
            },
        );

        match finished.outcome {
            Some(_) => info!(
                model_type = %model_type,
                job_id = %job_id,
                version = ?finished.model_version,
                old_accuracy = ?finished.old_accuracy,
                new_accuracy = ?finished.new_accuracy,
                "Retrain promoted challenger"
            ),
            None => warn!(
                model_type = %model_type,
                job_id = %job_id,
                error = ?finished.error,
                "Retrain finished without promotion"
            ),
        }
        metrics::counter!("retrain.jobs", "status" => format!("{:?}", finished.status)).increment(1);
        Ok(finished)
    }

    fn evaluate_challenger(&self, model_type: &str, now: DateTime<Utc>) -> Result<Evaluation, String> {
        let mut records = self.tracker.resolved_for(model_type);
        records.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at));
        records.truncate(self.config.max_samples);

        if records.len() < self.config.min_training_samples {
            return Err(format!(
                "insufficient data: {} resolved predictions, need {}",
                records.len(),
                self.config.min_training_samples
            ));
        }

        // Every k-th record is held out; stable across runs for the same data.
        let stride = (1.0 / self.config.validation_fraction.clamp(0.05, 0.5)).round() as usize;
        let (validation, training): (Vec<(usize, &PredictionRecord)>, Vec<(usize, &PredictionRecord)>) =
            records.iter().enumerate().partition(|(i, _)| i % stride == 0);
        let validation: Vec<&PredictionRecord> = validation.into_iter().map(|(_, r)| r).collect();

        let half_life = self.config.recency_half_life_days.max(f64::EPSILON);
        let samples: Vec<(f64, f64, f64)> = training
            .iter()
            .filter_map(|(_, r)| {
                let actual = r.actual_value?;
                let age_days = (now - r.created_at).num_seconds().max(0) as f64 / 86_400.0;
                Some((r.raw_value, actual, 0.5f64.powf(age_days / half_life)))
            })
            .collect();

        let challenger = CalibrationModel::fit_weighted(&samples).map_err(|e| e.to_string())?;
        let champion = self.registry.current(model_type);

        Ok(Evaluation {
            challenger,
            training_samples: samples.len(),
            validation_samples: validation.len(),
            old_accuracy: self.validation_accuracy(&champion.calibration, &validation),
            new_accuracy: self.validation_accuracy(&challenger, &validation),
        })
    }

    fn validation_accuracy(&self, model: &CalibrationModel, validation: &[&PredictionRecord]) -> f64 {
        let bands = &self.tracker.config().tolerances;
        let scored: Vec<bool> = validation
            .iter()
            .filter_map(|r| {
                let actual = r.actual_value?;
                Some(score(r.metric_type, model.apply(r.raw_value), actual, bands).is_accurate)
            })
            .collect();
        if scored.is_empty() {
            return 0.0;
        }
        scored.iter().filter(|hit| **hit).count() as f64 / scored.len() as f64
    }

    pub fn check_regression(&self, model_type: &str) -> Option<RetrainJob> {
        self.check_regression_at(model_type, Utc::now())
    }

    /// Roll production back to the parent version when live accuracy of the
    /// current version has fallen below the rollback threshold.
    pub fn check_regression_at(&self, model_type: &str, now: DateTime<Utc>) -> Option<RetrainJob> {
        let current = self.registry.current(model_type);
        current.parent_version?;

        let live = self.tracker.resolved_since(
            model_type,
            current.version,
            self.registry.activated_at(model_type),
        );
        if live.len() < self.config.min_rollback_samples {
            return None;
        }
        let live_accuracy = accuracy_rate(&live);
        if live_accuracy >= self.config.rollback_threshold {
            return None;
        }

        let restored = self.registry.rollback(model_type)?;
        let mut job = RetrainJob::pending(model_type, RetrainTrigger::AccuracyDrop);
        job.status = RetrainStatus::Completed;
        job.outcome = Some(RetrainOutcome::RolledBack);
        job.validation_samples = live.len();
        job.old_accuracy = Some(live_accuracy);
        job.new_accuracy = restored.validation_accuracy;
        job.model_version = Some(restored.version);
        job.started_at = Some(now);
        job.finished_at = Some(now);
        self.jobs.insert(job.job_id, job.clone());

        warn!(
            model_type,
            from = current.version,
            to = restored.version,
            live_accuracy,
            "Live accuracy regressed; rolled back"
        );
        metrics::counter!("retrain.jobs", "status" => "RolledBack").increment(1);
        Some(job)
    }

    pub fn job(&self, job_id: &Uuid) -> Option<RetrainJob> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    /// Jobs waiting to run, oldest first.
    pub fn pending_jobs(&self) -> Vec<RetrainJob> {
        let mut pending: Vec<RetrainJob> = self
            .jobs
            .iter()
            .filter(|j| j.status == RetrainStatus::Pending)
            .map(|j| j.clone())
            .collect();
        pending.sort_by_key(|j| j.created_at);
        pending
    }

    /// Jobs for a model type, newest first.
    pub fn jobs(&self, model_type: &str) -> Vec<RetrainJob> {
        let mut jobs: Vec<RetrainJob> = self
            .jobs
            .iter()
            .filter(|j| j.model_type == model_type)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }
}
