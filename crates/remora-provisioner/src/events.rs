use crate::cluster::ClusterClient;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::api::core::v1::ObjectReference;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const REASON_PROVISION_STORAGE: &str = "ProvisionStorage";
pub const REASON_PROVISION_GET_CLIENT: &str = "ProvisionVolumeGetClient";
pub const REASON_DELETE_VOLUME: &str = "DeleteVolume";
pub const REASON_DELETE_GET_CLIENT: &str = "DeleteVolumeGetClient";
pub const REASON_MONITOR_BIND: &str = "MonitorBind";

/// Severity of a recorded cluster event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Publishes normal and warning events tagged to claims, volumes, or
/// classes. Recording is best-effort: failures are logged, never
/// propagated into the chains that emit them.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn event(
        &self,
        reference: ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

pub fn claim_reference(claim: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        kind: Some("PersistentVolumeClaim".to_string()),
        api_version: Some("v1".to_string()),
        name: claim.metadata.name.clone(),
        namespace: claim.metadata.namespace.clone(),
        uid: claim.metadata.uid.clone(),
        resource_version: claim.metadata.resource_version.clone(),
        ..Default::default()
    }
}

pub fn volume_reference(volume: &PersistentVolume) -> ObjectReference {
    ObjectReference {
        kind: Some("PersistentVolume".to_string()),
        api_version: Some("v1".to_string()),
        name: volume.metadata.name.clone(),
        uid: volume.metadata.uid.clone(),
        resource_version: volume.metadata.resource_version.clone(),
        ..Default::default()
    }
}

pub fn class_reference(class: &StorageClass) -> ObjectReference {
    ObjectReference {
        kind: Some("StorageClass".to_string()),
        api_version: Some("storage.k8s.io/v1".to_string()),
        name: class.metadata.name.clone(),
        uid: class.metadata.uid.clone(),
        resource_version: class.metadata.resource_version.clone(),
        ..Default::default()
    }
}

/// Recorder that posts events through the cluster API.
pub struct ClusterEventRecorder {
    cluster: Arc<dyn ClusterClient>,
    component: String,
}

impl ClusterEventRecorder {
    /// `component` identifies this instance in the event source,
    /// conventionally `<provisioner-name>-<instance-uuid>`.
    pub fn new(cluster: Arc<dyn ClusterClient>, component: impl Into<String>) -> Self {
        Self {
            cluster,
            component: component.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for ClusterEventRecorder {
    async fn event(
        &self,
        reference: ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let now = Time(Utc::now());
        let target_name = reference.name.clone().unwrap_or_default();
        let namespace = reference
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", target_name, Uuid::new_v4().simple())),
                namespace: Some(namespace),
                ..Default::default()
            },
            involved_object: reference,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some(event_type.as_str().to_string()),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                ..Default::default()
            }),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = self.cluster.create_event(&event).await {
            warn!(
                "failed to record {} event ({}) for {}: {}",
                event_type.as_str(),
                reason,
                target_name,
                e
            );
        }
    }
}

/// An event captured by [`MemoryRecorder`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub reference: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// In-memory recorder for tests.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn event(
        &self,
        reference: ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events.lock().await.push(RecordedEvent {
            reference,
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_reference_fields() {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("c1".to_string());
        claim.metadata.namespace = Some("ns1".to_string());
        claim.metadata.uid = Some("uid-1".to_string());

        let reference = claim_reference(&claim);
        assert_eq!(reference.kind.as_deref(), Some("PersistentVolumeClaim"));
        assert_eq!(reference.name.as_deref(), Some("c1"));
        assert_eq!(reference.namespace.as_deref(), Some("ns1"));
        assert_eq!(reference.uid.as_deref(), Some("uid-1"));
    }

    #[tokio::test]
    async fn test_memory_recorder_filters_by_reason() {
        let recorder = MemoryRecorder::new();
        recorder
            .event(
                ObjectReference::default(),
                EventType::Normal,
                REASON_PROVISION_STORAGE,
                "started",
            )
            .await;
        recorder
            .event(
                ObjectReference::default(),
                EventType::Warning,
                REASON_MONITOR_BIND,
                "timed out",
            )
            .await;

        assert_eq!(recorder.events().await.len(), 2);
        let warnings = recorder.events_with_reason(REASON_MONITOR_BIND).await;
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].event_type, EventType::Warning);
    }
}
