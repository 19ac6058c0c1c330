//! Live performance counters and campaign registry, keyed for concurrent access.
//!
//! The decision cycle reads from here; the platform sync path and feedback
//! ingestion write to disjoint fields of the same entries.

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{PilotError, PilotResult};
use crate::types::{CampaignProfile, CampaignTargets, VariantCounters};

pub struct PerformanceStore {
    campaigns: DashMap<Uuid, CampaignProfile>,
    counters: DashMap<Uuid, VariantCounters>,
    /// campaign_id -> variant ids
    campaign_variants: DashMap<Uuid, Vec<Uuid>>,
}

impl PerformanceStore {
    pub fn new() -> Self {
        Self {
            campaigns: DashMap::new(),
            counters: DashMap::new(),
            campaign_variants: DashMap::new(),
        }
    }

    pub fn register_campaign(
        &self,
        campaign_id: Uuid,
        name: &str,
        industry: &str,
        objective: &str,
        targets: CampaignTargets,
    ) -> CampaignProfile {
        let profile = CampaignProfile {
            campaign_id,
            name: name.to_string(),
            industry: industry.to_string(),
            objective: objective.to_string(),
            targets,
            created_at: Utc::now(),
        };
        self.campaigns.insert(campaign_id, profile.clone());
        self.campaign_variants.entry(campaign_id).or_default();
        profile
    }

    pub fn campaign(&self, campaign_id: &Uuid) -> Option<CampaignProfile> {
        self.campaigns.get(campaign_id).map(|c| c.clone())
    }

    pub fn campaign_ids(&self) -> Vec<Uuid> {
        self.campaigns.iter().map(|c| *c.key()).collect()
    }

    /// Replace a variant's platform counters. Conversions and revenue already
    /// folded in from feedback are kept when the platform reports less.
    pub fn upsert_counters(&self, counters: VariantCounters) -> PilotResult<()> {
        if !self.campaigns.contains_key(&counters.campaign_id) {
            return Err(PilotError::not_found("campaign", counters.campaign_id));
        }
        let variant_id = counters.variant_id;
        let campaign_id = counters.campaign_id;
        self.counters
            .entry(variant_id)
            .and_modify(|existing| {
                let conversions = existing.conversions.max(counters.conversions);
                let revenue = existing.revenue.max(counters.revenue);
                *existing = counters.clone();
                existing.conversions = conversions;
                existing.revenue = revenue;
            })
            .or_insert_with(|| counters.clone());

        let mut variants = self.campaign_variants.entry(campaign_id).or_default();
        if !variants.contains(&variant_id) {
            variants.push(variant_id);
        }
        Ok(())
    }

    /// Fold one attributed conversion into a variant's counters.
    pub fn record_conversion(
        &self,
        campaign_id: &Uuid,
        variant_id: &Uuid,
        value: f64,
    ) -> PilotResult<VariantCounters> {
        let mut entry = self
            .counters
            .get_mut(variant_id)
            .ok_or_else(|| PilotError::not_found("variant", variant_id))?;
        if entry.campaign_id != *campaign_id {
            return Err(PilotError::Validation(format!(
                "variant {} does not belong to campaign {}",
                variant_id, campaign_id
            )));
        }
        entry.conversions += 1;
        entry.revenue += value.max(0.0);
        if let Some(recent) = entry.recent.as_mut() {
            recent.conversions += 1;
            recent.revenue += value.max(0.0);
        }
        Ok(entry.clone())
    }

    pub fn set_budget(&self, variant_id: &Uuid, budget: f64) {
        if let Some(mut entry) = self.counters.get_mut(variant_id) {
            entry.budget = budget;
        }
    }

    pub fn mark_paused(&self, variant_id: &Uuid) {
        if let Some(mut entry) = self.counters.get_mut(variant_id) {
            entry.paused = true;
        }
    }

    pub fn counters(&self, variant_id: &Uuid) -> Option<VariantCounters> {
        self.counters.get(variant_id).map(|c| c.clone())
    }

    /// Snapshot of every variant's counters in a campaign.
    pub fn campaign_counters(&self, campaign_id: &Uuid) -> Vec<VariantCounters> {
        let ids = self
            .campaign_variants
            .get(campaign_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.counters.get(id).map(|c| c.clone()))
            .collect()
    }
}

impl Default for PerformanceStore {
    fn default() -> Self {
        Self::new()
    }
}
