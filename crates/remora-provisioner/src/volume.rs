use crate::claim::{claim_class_name, claim_match_labels, claim_namespace, claim_uid};
use crate::class::{class_name, class_reclaim_policy};
use crate::cluster::{decode_object, ApiClient, Store, WatchEventType, VOLUMES_PATH};
use crate::error::{ProvisionerError, Result};
use crate::events::claim_reference;
use crate::provisioner::Provisioner;
use k8s_openapi::api::core::v1::{
    FlexPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec,
};
use k8s_openapi::api::storage::v1::StorageClass;
use remora_core::keys;
use remora_core::OptionsMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use crate::class::RECLAIM_DELETE;

pub const VOLUME_BOUND: &str = "Bound";
pub const VOLUME_RELEASED: &str = "Released";

const INFORMER_BACKOFF: Duration = Duration::from_secs(5);

pub fn volume_name(volume: &PersistentVolume) -> &str {
    volume.metadata.name.as_deref().unwrap_or("")
}

pub fn volume_uid(volume: &PersistentVolume) -> &str {
    volume.metadata.uid.as_deref().unwrap_or("")
}

pub fn volume_phase(volume: &PersistentVolume) -> &str {
    volume
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

pub fn volume_reclaim_policy(volume: &PersistentVolume) -> &str {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        .unwrap_or("")
}

/// The provisioner annotation stamped on volumes we created.
pub fn volume_provisioned_by(volume: &PersistentVolume) -> Option<&str> {
    volume
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(keys::PROVISIONED_BY))
        .map(String::as_str)
}

/// Pick the volume name for a claim: the per-claim annotation first,
/// then the claim's generate-name, then `<class>-<claim-uid>`. The
/// namespace prefixes the first two so names stay unique across
/// namespaces.
pub fn best_volume_name(
    claim: &PersistentVolumeClaim,
    class: &StorageClass,
    docker_vol_annotation: &str,
) -> String {
    if let Some(annotation) = claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(docker_vol_annotation))
    {
        if !annotation.is_empty() {
            return format!("{}-{}", claim_namespace(claim), annotation);
        }
    }
    if let Some(generate_name) = claim.metadata.generate_name.as_deref() {
        if !generate_name.is_empty() {
            return format!("{}-{}", claim_namespace(claim), generate_name);
        }
    }
    format!("{}-{}", class_name(class), claim_uid(claim))
}

/// Resolve a clone-source claim to the name of its bound volume.
pub(crate) fn volume_name_from_claim_name(
    claims: &Store<PersistentVolumeClaim>,
    namespace: &str,
    claim_name: &str,
) -> Result<String> {
    debug!("resolving clone source {}/{}", namespace, claim_name);
    let claim = claims
        .get(&format!("{}/{}", namespace, claim_name))
        .ok_or_else(|| ProvisionerError::ClaimNotFound {
            namespace: namespace.to_string(),
            name: claim_name.to_string(),
        })?;
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.clone())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ProvisionerError::NoVolumeForClaim {
            namespace: namespace.to_string(),
            name: claim_name.to_string(),
        })
}

/// Build the plugin option map from class parameters.
///
/// Parameters copy over as strings, except: `cloneOfPVC` resolves to
/// a `cloneOf` volume name, and any parameter named in
/// `list_of_options` follows the claim's translated size when one
/// was requested. A positive size with no matching parameter adds a
/// plain `size` option.
pub(crate) fn docker_options(
    params: &BTreeMap<String, String>,
    claim_size: i64,
    list_of_options: &[String],
    namespace: &str,
    claims: &Store<PersistentVolumeClaim>,
) -> Result<OptionsMap> {
    let mut options = OptionsMap::new();
    let mut found_size_key = false;
    for (key, value) in params {
        if key == keys::CLONE_OF_PVC {
            let source_volume = volume_name_from_claim_name(claims, namespace, value)?;
            debug!("setting {} to {}", keys::CLONE_OF, source_volume);
            options.insert(keys::CLONE_OF.to_string(), source_volume.into());
            continue;
        }
        options.insert(key.clone(), value.clone().into());
        debug!("storage class option {}:{}", key, value);
        if claim_size > 0 && list_of_options.iter().any(|option| option == key) {
            found_size_key = true;
            info!(
                "storage class option {} matched a storage resource option, overriding value to {}",
                key, claim_size
            );
            options.insert(key.clone(), claim_size.into());
        }
    }
    if claim_size > 0 && !found_size_key {
        debug!("storage class does not carry a size key, adding the claim size");
        options.insert("size".to_string(), claim_size.into());
    }
    Ok(options)
}

/// Merge configured defaults under the computed options: a default
/// never replaces a value that is already present.
pub(crate) fn set_default_docker_options(options: &mut OptionsMap, defaults: &OptionsMap) {
    for (key, value) in defaults {
        if !options.contains_key(key) {
            info!("setting the plugin option {}:{}", key, value);
            options.insert(key.clone(), value.clone());
        }
    }
}

/// Build the cluster volume object for a provisioned claim. The
/// claim-ref ties the volume to the originating claim so the cluster
/// binds them together.
pub fn new_persistent_volume(
    pv_name: &str,
    params: &BTreeMap<String, String>,
    claim: &PersistentVolumeClaim,
    class: &StorageClass,
    docker_vol_annotation: &str,
) -> PersistentVolume {
    let claim_class = claim_class_name(claim);
    let mut annotations = BTreeMap::new();
    annotations.insert(keys::BETA_STORAGE_CLASS.to_string(), claim_class.clone());
    annotations.insert(keys::PROVISIONED_BY.to_string(), class.provisioner.clone());
    annotations.insert(docker_vol_annotation.to_string(), pv_name.to_string());

    let capacity = claim
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get("storage").cloned())
        .map(|quantity| {
            let mut capacity = BTreeMap::new();
            capacity.insert("storage".to_string(), quantity);
            capacity
        });

    let labels = claim_match_labels(claim);

    let mut volume = PersistentVolume::default();
    volume.metadata.name = Some(pv_name.to_string());
    volume.metadata.annotations = Some(annotations);
    if !labels.is_empty() {
        volume.metadata.labels = Some(labels);
    }
    volume.spec = Some(PersistentVolumeSpec {
        access_modes: claim.spec.as_ref().and_then(|s| s.access_modes.clone()),
        capacity,
        claim_ref: Some(claim_reference(claim)),
        persistent_volume_reclaim_policy: Some(class_reclaim_policy(class).to_string()),
        storage_class_name: (!claim_class.is_empty()).then_some(claim_class),
        flex_volume: Some(FlexPersistentVolumeSource {
            driver: class.provisioner.clone(),
            options: Some(params.clone()),
            ..Default::default()
        }),
        ..Default::default()
    });
    volume
}

/// Watch volumes: updates flow to parked monitors; released volumes
/// we provisioned dispatch delete chains.
pub(crate) async fn run_volume_informer(
    api: Arc<ApiClient>,
    provisioner: Arc<Provisioner>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            return;
        }
        if let Err(e) = sync_and_watch(&api, &provisioner, &token).await {
            warn!("volume informer failed: {}", e);
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
    let (items, resource_version) = api.list(VOLUMES_PATH).await?;
    for item in items {
        let Some(volume) = decode_object::<PersistentVolume>(item) else {
            continue;
        };
        Arc::clone(provisioner)
            .observe_volume(WatchEventType::Added, volume)
            .await;
    }

    let mut watch = api.start_watch(VOLUMES_PATH, &resource_version).await?;
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            event = watch.next_event() => event?,
        };
        let Some((event_type, object)) = event else {
            return Ok(());
        };
        let Some(volume) = decode_object::<PersistentVolume>(object) else {
            continue;
        };
        debug!(
            "volume event {:?}: {} phase={}",
            event_type,
            volume_name(&volume),
            volume_phase(&volume)
        );
        Arc::clone(provisioner).observe_volume(event_type, volume).await;
    }
}
