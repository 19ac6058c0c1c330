//! Resolve which campaign and creative a conversion belongs to.
//!
//! Each id is looked up independently: explicit fields on the event first,
//! then `custom_data`, then tracking parameters on the source URL.

use adpilot_core::types::ConversionEvent;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

const CAMPAIGN_KEYS: [&str; 3] = ["campaign_id", "utm_campaign", "cid"];
const CREATIVE_KEYS: [&str; 3] = ["creative_id", "utm_content", "crid"];

/// Where the weaker of the two ids came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AttributionSource {
    Explicit,
    CustomData,
    SourceUrl,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attribution {
    pub campaign_id: Uuid,
    pub creative_id: Uuid,
    pub source: AttributionSource,
}

pub fn attribute(event: &ConversionEvent) -> Option<Attribution> {
    let url_params: Vec<(String, String)> = event
        .source_url
        .as_deref()
        .and_then(|raw| Url::parse(raw).ok())
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default();

    let (campaign_id, campaign_src) =
        resolve(event.campaign_id, event, &url_params, &CAMPAIGN_KEYS)?;
    let (creative_id, creative_src) =
        resolve(event.creative_id, event, &url_params, &CREATIVE_KEYS)?;

    Some(Attribution {
        campaign_id,
        creative_id,
        source: campaign_src.max(creative_src),
    })
}

fn resolve(
    explicit: Option<Uuid>,
    event: &ConversionEvent,
    url_params: &[(String, String)],
    keys: &[&str],
) -> Option<(Uuid, AttributionSource)> {
    if let Some(id) = explicit {
        return Some((id, AttributionSource::Explicit));
    }
    let from_custom = keys
        .iter()
        .filter_map(|k| event.custom_data.get(*k))
        .find_map(|v| Uuid::parse_str(v.trim()).ok());
    if let Some(id) = from_custom {
        return Some((id, AttributionSource::CustomData));
    }
    keys.iter()
        .filter_map(|k| url_params.iter().find(|(name, _)| name.as_str() == *k))
        .find_map(|(_, v)| Uuid::parse_str(v.trim()).ok())
        .map(|id| (id, AttributionSource::SourceUrl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn event() -> ConversionEvent {
        ConversionEvent {
            event_id: "evt-1".into(),
            event_name: "Purchase".into(),
            event_time: Utc::now(),
            campaign_id: None,
            creative_id: None,
            value: 49.0,
            currency: "USD".into(),
            source_url: None,
            custom_data: HashMap::new(),
        }
    }

    #[test]
    fn test_explicit_ids_win() {
        let (campaign, creative) = (Uuid::new_v4(), Uuid::new_v4());
        let mut e = event();
        e.campaign_id = Some(campaign);
        e.creative_id = Some(creative);
        e.custom_data.insert("campaign_id".into(), Uuid::new_v4().to_string());

        let a = attribute(&e).unwrap();
        assert_eq!(a.campaign_id, campaign);
        assert_eq!(a.creative_id, creative);
        assert_eq!(a.source, AttributionSource::Explicit);
    }

    #[test]
    fn test_custom_data_then_url() {
        let (campaign, creative) = (Uuid::new_v4(), Uuid::new_v4());
        let mut e = event();
        e.custom_data.insert("utm_campaign".into(), campaign.to_string());
        e.source_url = Some(format!(
            "https://shop.example.com/checkout?utm_source=meta&utm_content={creative}"
        ));

        let a = attribute(&e).unwrap();
        assert_eq!(a.campaign_id, campaign);
        assert_eq!(a.creative_id, creative);
        assert_eq!(a.source, AttributionSource::SourceUrl);
    }

    #[test]
    fn test_short_url_params() {
        let (campaign, creative) = (Uuid::new_v4(), Uuid::new_v4());
        let mut e = event();
        e.source_url = Some(format!("https://x.example/?cid={campaign}&crid={creative}"));
        let a = attribute(&e).unwrap();
        assert_eq!((a.campaign_id, a.creative_id), (campaign, creative));
    }

    #[test]
    fn test_unattributable_events() {
        assert!(attribute(&event()).is_none());

        let mut missing_creative = event();
        missing_creative.campaign_id = Some(Uuid::new_v4());
        assert!(attribute(&missing_creative).is_none());

        let mut garbage = event();
        garbage.source_url = Some("not a url".into());
        garbage.custom_data.insert("campaign_id".into(), "summer-sale".into());
        assert!(attribute(&garbage).is_none());
    }
}
