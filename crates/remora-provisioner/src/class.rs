use crate::cluster::{ApiClient, WatchEventType, BETA_CLASSES_PATH, CLASSES_PATH};
use crate::error::{ProvisionerError, Result};
use crate::provisioner::Provisioner;
use k8s_openapi::api::storage::v1::StorageClass;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const INFORMER_BACKOFF: Duration = Duration::from_secs(5);

pub const RECLAIM_DELETE: &str = "Delete";

pub fn class_name(class: &StorageClass) -> &str {
    class.metadata.name.as_deref().unwrap_or("")
}

/// Reclaim policy a class assigns to its volumes; absent means
/// delete.
pub fn class_reclaim_policy(class: &StorageClass) -> &str {
    match class.reclaim_policy.as_deref() {
        Some(policy) if !policy.is_empty() => policy,
        _ => RECLAIM_DELETE,
    }
}

/// Normalise a raw class object to the single in-memory shape.
///
/// Classes arrive in two schema versions (v1 and the legacy beta);
/// both carry the same fields this system reads, so normalisation
/// drops the version discriminators and decodes the rest.
pub fn normalize_class(mut value: serde_json::Value) -> Result<StorageClass> {
    if let Some(object) = value.as_object_mut() {
        object.remove("apiVersion");
        object.remove("kind");
    }
    serde_json::from_value(value)
        .map_err(|e| ProvisionerError::cluster(format!("failed to decode storage class: {}", e)))
}

/// Watch storage classes into the class cache. Nothing dispatches
/// from here; classes only gate and parameterise claim handling.
pub(crate) async fn run_class_informer(
    api: Arc<ApiClient>,
    provisioner: Arc<Provisioner>,
    use_beta_endpoint: bool,
    token: CancellationToken,
) {
    let path = if use_beta_endpoint {
        BETA_CLASSES_PATH
    } else {
        CLASSES_PATH
    };
    loop {
        if token.is_cancelled() {
            return;
        }
        if let Err(e) = sync_and_watch(&api, &provisioner, path, &token).await {
            warn!("class informer failed: {}", e);
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
    path: &str,
    token: &CancellationToken,
) -> Result<()> {
    let (items, resource_version) = api.list(path).await?;
    for item in items {
        match normalize_class(item) {
            Ok(class) => provisioner
                .class_store()
                .insert(class_name(&class), class.clone()),
            Err(e) => warn!("skipping storage class: {}", e),
        }
    }

    let mut watch = api.start_watch(path, &resource_version).await?;
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            event = watch.next_event() => event?,
        };
        let Some((event_type, object)) = event else {
            return Ok(());
        };
        let class = match normalize_class(object) {
            Ok(class) => class,
            Err(e) => {
                warn!("skipping storage class event: {}", e);
                continue;
            }
        };
        debug!("class event {:?}: {}", event_type, class_name(&class));
        match event_type {
            WatchEventType::Added | WatchEventType::Modified => {
                provisioner
                    .class_store()
                    .insert(class_name(&class), class.clone());
            }
            WatchEventType::Deleted => provisioner.class_store().remove(class_name(&class)),
            WatchEventType::Error => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_v1_class() {
        let class = normalize_class(serde_json::json!({
            "apiVersion": "storage.k8s.io/v1",
            "kind": "StorageClass",
            "metadata": {"name": "gold"},
            "provisioner": "dory/flex",
            "parameters": {"size": "10"},
            "reclaimPolicy": "Delete"
        }))
        .unwrap();
        assert_eq!(class_name(&class), "gold");
        assert_eq!(class.provisioner, "dory/flex");
        assert_eq!(class.parameters.unwrap()["size"], "10");
    }

    #[test]
    fn test_normalize_legacy_beta_class() {
        let class = normalize_class(serde_json::json!({
            "apiVersion": "storage.k8s.io/v1beta1",
            "kind": "StorageClass",
            "metadata": {"name": "old-gold"},
            "provisioner": "dory/flex"
        }))
        .unwrap();
        assert_eq!(class_name(&class), "old-gold");
        assert_eq!(class.provisioner, "dory/flex");
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_class(serde_json::json!({"metadata": 4})).is_err());
    }

    #[test]
    fn test_reclaim_policy_defaults_to_delete() {
        let class = StorageClass::default();
        assert_eq!(class_reclaim_policy(&class), RECLAIM_DELETE);

        let mut class = StorageClass::default();
        class.reclaim_policy = Some("Retain".to_string());
        assert_eq!(class_reclaim_policy(&class), "Retain");
    }
}
