use crate::cluster::{decode_object, ApiClient, WatchEventType, CLAIMS_PATH};
use crate::error::Result;
use crate::provisioner::Provisioner;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use remora_core::keys;
use remora_core::OptionsMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CLAIM_PENDING: &str = "Pending";
pub const CLAIM_BOUND: &str = "Bound";
pub const CLAIM_LOST: &str = "Lost";

const INFORMER_BACKOFF: Duration = Duration::from_secs(5);

pub fn claim_phase(claim: &PersistentVolumeClaim) -> &str {
    claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

pub fn claim_name(claim: &PersistentVolumeClaim) -> &str {
    claim.metadata.name.as_deref().unwrap_or("")
}

pub fn claim_uid(claim: &PersistentVolumeClaim) -> &str {
    claim.metadata.uid.as_deref().unwrap_or("")
}

pub fn claim_namespace(claim: &PersistentVolumeClaim) -> &str {
    match claim.metadata.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => namespace,
        _ => "default",
    }
}

/// Cache key of a claim: `<namespace>/<name>`.
pub fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!("{}/{}", claim_namespace(claim), claim_name(claim))
}

/// The storage class a claim selects. The spec field wins; the
/// legacy beta annotation is honoured for clusters that still write
/// it.
pub fn claim_class_name(claim: &PersistentVolumeClaim) -> String {
    if let Some(name) = claim.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()) {
        if !name.is_empty() {
            return name.to_string();
        }
    }
    claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(keys::BETA_STORAGE_CLASS))
        .cloned()
        .unwrap_or_default()
}

pub fn claim_match_labels(claim: &PersistentVolumeClaim) -> BTreeMap<String, String> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .and_then(|s| s.match_labels.clone())
        .unwrap_or_default()
}

/// The override keys a class allows, from its comma-separated
/// `allowOverrides` parameter.
pub(crate) fn class_overrides(params: &BTreeMap<String, String>) -> Vec<String> {
    params
        .get(keys::ALLOW_OVERRIDES)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Apply per-claim annotation overrides onto an option map. An
/// annotation wins when its key carries the instance prefix and ends
/// in the allowed override key (`<prefix><key>` or `<...>/<key>`,
/// matched case-insensitively).
pub(crate) fn claim_override_options(
    claim: &PersistentVolumeClaim,
    overrides: &[String],
    options: &mut OptionsMap,
    name_prefix: &str,
) {
    debug!("handling claim override options for {}", name_prefix);
    let Some(annotations) = claim.metadata.annotations.as_ref() else {
        return;
    };
    let prefix = name_prefix.to_lowercase();
    for override_key in overrides {
        let target = override_key.to_lowercase();
        for (key, value) in annotations {
            let key = key.to_lowercase();
            if !key.starts_with(&prefix) {
                continue;
            }
            if key != format!("{}{}", prefix, target) && !key.ends_with(&format!("/{}", target)) {
                continue;
            }
            if let Some(existing) = options.get(override_key.as_str()) {
                info!(
                    "key {} exists with value {}, overriding with claim annotation {}",
                    override_key, existing, value
                );
            }
            options.insert(override_key.clone(), value.clone().into());
        }
    }
}

/// Watch claims: keep the claim cache current and hand every event
/// to the provisioner. Re-lists with back-off whenever the stream
/// ends.
pub(crate) async fn run_claim_informer(
    api: Arc<ApiClient>,
    provisioner: Arc<Provisioner>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            return;
        }
        if let Err(e) = sync_and_watch(&api, &provisioner, &token).await {
            warn!("claim informer failed: {}", e);
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(INFORMER_BACKOFF) => {}
        }
    }
}

async fn sync_and_watch(
    api: &ApiClient,
    provisioner: &Arc<Provisioner>,
    token: &CancellationToken,
) -> Result<()> {
    let (items, resource_version) = api.list(CLAIMS_PATH).await?;
    for item in items {
        let Some(claim) = decode_object::<PersistentVolumeClaim>(item) else {
            continue;
        };
        provisioner.claim_store().insert(&claim_key(&claim), claim.clone());
        Arc::clone(provisioner)
            .observe_claim(WatchEventType::Added, claim)
            .await;
    }

    let mut watch = api.start_watch(CLAIMS_PATH, &resource_version).await?;
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            event = watch.next_event() => event?,
        };
        let Some((event_type, object)) = event else {
            return Ok(());
        };
        let Some(claim) = decode_object::<PersistentVolumeClaim>(object) else {
            continue;
        };
        debug!(
            "claim event {:?}: {} phase={}",
            event_type,
            claim_key(&claim),
            claim_phase(&claim)
        );
        match event_type {
            WatchEventType::Added | WatchEventType::Modified => {
                provisioner
                    .claim_store()
                    .insert(&claim_key(&claim), claim.clone());
            }
            WatchEventType::Deleted => {
                provisioner.claim_store().remove(&claim_key(&claim));
            }
            WatchEventType::Error => continue,
        }
        Arc::clone(provisioner).observe_claim(event_type, claim).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use remora_core::OptionValue;

    fn claim_with_class(field: Option<&str>, annotation: Option<&str>) -> PersistentVolumeClaim {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("c1".to_string());
        if let Some(value) = annotation {
            claim.metadata.annotations = Some(
                [(keys::BETA_STORAGE_CLASS.to_string(), value.to_string())]
                    .into_iter()
                    .collect(),
            );
        }
        claim.spec = Some(PersistentVolumeClaimSpec {
            storage_class_name: field.map(str::to_string),
            ..Default::default()
        });
        claim
    }

    #[test]
    fn test_class_name_field_wins_over_annotation() {
        let claim = claim_with_class(Some("gold"), Some("legacy"));
        assert_eq!(claim_class_name(&claim), "gold");
    }

    #[test]
    fn test_class_name_falls_back_to_annotation() {
        let claim = claim_with_class(None, Some("legacy"));
        assert_eq!(claim_class_name(&claim), "legacy");

        let claim = claim_with_class(Some(""), Some("legacy"));
        assert_eq!(claim_class_name(&claim), "legacy");
    }

    #[test]
    fn test_claim_namespace_defaults() {
        let claim = PersistentVolumeClaim::default();
        assert_eq!(claim_namespace(&claim), "default");

        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.namespace = Some("ns1".to_string());
        assert_eq!(claim_namespace(&claim), "ns1");
    }

    #[test]
    fn test_claim_match_labels() {
        let mut claim = PersistentVolumeClaim::default();
        assert!(claim_match_labels(&claim).is_empty());

        claim.spec = Some(PersistentVolumeClaimSpec {
            selector: Some(LabelSelector {
                match_labels: Some(
                    [("tier".to_string(), "gold".to_string())].into_iter().collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(claim_match_labels(&claim).get("tier").unwrap(), "gold");
    }

    #[test]
    fn test_class_overrides_parsing() {
        let mut params = BTreeMap::new();
        assert!(class_overrides(&params).is_empty());

        params.insert(
            keys::ALLOW_OVERRIDES.to_string(),
            "size, description,,  perfPolicy".to_string(),
        );
        assert_eq!(
            class_overrides(&params),
            vec!["size", "description", "perfPolicy"]
        );
    }

    #[test]
    fn test_override_annotation_wins() {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.annotations = Some(
            [
                ("dory/description".to_string(), "fast".to_string()),
                ("dory/unrelated".to_string(), "x".to_string()),
            ]
            .into_iter()
            .collect(),
        );

        let mut options = OptionsMap::new();
        options.insert("description".to_string(), "slow".into());
        claim_override_options(
            &claim,
            &["description".to_string()],
            &mut options,
            "dory/",
        );
        assert_eq!(options["description"], OptionValue::from("fast"));
        assert!(!options.contains_key("unrelated"));
    }

    #[test]
    fn test_override_matches_driver_qualified_annotation() {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.annotations = Some(
            [("dory/flex/description".to_string(), "fast".to_string())]
                .into_iter()
                .collect(),
        );

        let mut options = OptionsMap::new();
        claim_override_options(
            &claim,
            &["description".to_string()],
            &mut options,
            "dory/",
        );
        assert_eq!(options["description"], OptionValue::from("fast"));
    }

    #[test]
    fn test_override_ignores_foreign_prefix() {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.annotations = Some(
            [("other/description".to_string(), "fast".to_string())]
                .into_iter()
                .collect(),
        );

        let mut options = OptionsMap::new();
        claim_override_options(
            &claim,
            &["description".to_string()],
            &mut options,
            "dory/",
        );
        assert!(options.is_empty());
    }
}
