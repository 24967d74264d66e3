use crate::chain::{ChainOutputs, Runner};
use crate::claim::{claim_name, claim_phase, claim_uid, CLAIM_BOUND, CLAIM_LOST};
use crate::error::{ProvisionerError, Result};
use crate::events::{claim_reference, volume_reference, EventRecorder, EventType, REASON_MONITOR_BIND};
use crate::mailbox::{MailboxRegistry, UpdateMessage};
use crate::steps::{StepOutput, STEP_CREATE_CLUSTER_VOLUME, STEP_MONITOR_BIND};
use crate::volume::{volume_name, volume_phase, VOLUME_BOUND, VOLUME_RELEASED};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// How long one attempt waits for the bind to settle. The owning
/// chain's retry loops the whole wait, so the effective ceiling is
/// `(retries + 1)` times this.
pub const MAX_WAIT_FOR_BIND: Duration = Duration::from_secs(30);

/// Chain step that parks on the claim's mailbox until the cluster
/// links claim and volume, or the wait times out.
///
/// On entry it registers the mailbox a second time under the created
/// volume's identifier so volume-stream events reach it too. A
/// timeout or a lost claim fails the chain, which rolls back the
/// volumes created before it; a volume bound elsewhere succeeds with
/// a warning because rolling back a volume that is bound to
/// something would strand the binder.
pub(crate) struct MonitorBind {
    claim: PersistentVolumeClaim,
    outputs: Arc<ChainOutputs<StepOutput>>,
    receiver: mpsc::Receiver<UpdateMessage>,
    registry: Arc<MailboxRegistry>,
    recorder: Arc<dyn EventRecorder>,
    bind_timeout: Duration,
    volume: Option<PersistentVolume>,
}

impl MonitorBind {
    pub fn new(
        claim: PersistentVolumeClaim,
        outputs: Arc<ChainOutputs<StepOutput>>,
        receiver: mpsc::Receiver<UpdateMessage>,
        registry: Arc<MailboxRegistry>,
        recorder: Arc<dyn EventRecorder>,
        bind_timeout: Duration,
    ) -> Self {
        Self {
            claim,
            outputs,
            receiver,
            registry,
            recorder,
            bind_timeout,
            volume: None,
        }
    }

    async fn process_claim_message(
        &self,
        claim: PersistentVolumeClaim,
    ) -> Result<Option<StepOutput>> {
        debug!(
            "claim {} updated ({}). status is now {}",
            claim_name(&claim),
            claim_uid(&claim),
            claim_phase(&claim)
        );
        match claim_phase(&claim) {
            CLAIM_BOUND => {
                let ours = self.volume.as_ref().map(volume_name).unwrap_or("");
                let bound = claim
                    .spec
                    .as_ref()
                    .and_then(|s| s.volume_name.as_deref())
                    .unwrap_or("");
                if bound != ours {
                    let message = format!(
                        "claim {} was satisfied by {}, the volume provisioned was {}",
                        claim_name(&claim),
                        bound,
                        ours
                    );
                    self.recorder
                        .event(
                            claim_reference(&claim),
                            EventType::Warning,
                            REASON_MONITOR_BIND,
                            &message,
                        )
                        .await;
                    // fail so rollback removes our stranded volume
                    return Err(ProvisionerError::BindMismatch { message });
                }
                debug!("claim {} was satisfied by volume {}", claim_name(&claim), bound);
                Ok(Some(StepOutput::Name(bound.to_string())))
            }
            CLAIM_LOST => {
                let message = format!(
                    "claim {} was lost, reverting volume create ({})",
                    claim_name(&claim),
                    claim_uid(&claim)
                );
                error!("{}", message);
                self.recorder
                    .event(
                        claim_reference(&self.claim),
                        EventType::Warning,
                        REASON_MONITOR_BIND,
                        &message,
                    )
                    .await;
                Err(ProvisionerError::ClaimLost {
                    claim: claim_name(&claim).to_string(),
                    uid: claim_uid(&claim).to_string(),
                })
            }
            _ => Ok(None),
        }
    }

    async fn process_volume_message(
        &self,
        volume: PersistentVolume,
    ) -> Result<Option<StepOutput>> {
        debug!(
            "volume {} updated. status is now {}",
            volume_name(&volume),
            volume_phase(&volume)
        );
        match volume_phase(&volume) {
            VOLUME_BOUND => {
                let bound_claim = volume.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
                let bound_uid = bound_claim.and_then(|r| r.uid.as_deref()).unwrap_or("");
                if bound_uid != claim_uid(&self.claim) {
                    let message = format!(
                        "volume {} satisfied claim {} ({}), expecting {}",
                        volume_name(&volume),
                        bound_claim.and_then(|r| r.name.as_deref()).unwrap_or(""),
                        bound_uid,
                        claim_name(&self.claim)
                    );
                    error!("{}", message);
                    self.recorder
                        .event(
                            volume_reference(&volume),
                            EventType::Warning,
                            REASON_MONITOR_BIND,
                            &message,
                        )
                        .await;
                    // the volume is bound to something; succeeding
                    // here keeps the caller from rolling it back
                    return Ok(Some(StepOutput::Name(volume_name(&volume).to_string())));
                }
                info!(
                    "volume {} satisfied claim {} ({})",
                    volume_name(&volume),
                    claim_name(&self.claim),
                    bound_uid
                );
                Ok(Some(StepOutput::Name(volume_name(&volume).to_string())))
            }
            VOLUME_RELEASED => {
                info!(
                    "volume {} has been released (waiting for {})",
                    volume_name(&volume),
                    claim_uid(&self.claim)
                );
                // the normal delete workflow cleans this up
                Ok(Some(StepOutput::Name(volume_name(&volume).to_string())))
            }
            _ => Ok(None),
        }
    }

    async fn process_timeout(&self) -> ProvisionerError {
        let message = format!(
            "claim {} timed out waiting for bind status, reverting volume create ({})",
            claim_name(&self.claim),
            claim_uid(&self.claim)
        );
        error!("{}", message);
        self.recorder
            .event(
                claim_reference(&self.claim),
                EventType::Warning,
                REASON_MONITOR_BIND,
                &message,
            )
            .await;
        ProvisionerError::BindTimeout {
            claim: claim_name(&self.claim).to_string(),
            uid: claim_uid(&self.claim).to_string(),
        }
    }
}

#[async_trait]
impl Runner<StepOutput> for MonitorBind {
    fn name(&self) -> &str {
        STEP_MONITOR_BIND
    }

    async fn run(&mut self) -> Result<StepOutput> {
        let volume = self
            .outputs
            .get(STEP_CREATE_CLUSTER_VOLUME)
            .and_then(StepOutput::into_volume)
            .ok_or(ProvisionerError::MissingChainOutput {
                name: STEP_CREATE_CLUSTER_VOLUME.to_string(),
            })?;

        // route volume-stream events into the same mailbox
        let volume_id = volume.metadata.uid.clone().unwrap_or_default();
        if !volume_id.is_empty() {
            self.registry.alias(claim_uid(&self.claim), &volume_id);
        }
        self.volume = Some(volume);

        loop {
            // the timer restarts on every await, including across
            // chain retry attempts
            let message = tokio::time::timeout(self.bind_timeout, self.receiver.recv()).await;
            let decision = match message {
                Err(_) => return Err(self.process_timeout().await),
                Ok(None) => {
                    return Err(ProvisionerError::internal(
                        "mailbox closed while waiting for bind",
                    ))
                }
                Ok(Some(UpdateMessage::Claim(claim))) => self.process_claim_message(*claim).await?,
                Ok(Some(UpdateMessage::Volume(volume))) => {
                    self.process_volume_message(*volume).await?
                }
            };
            if let Some(output) = decision {
                return Ok(output);
            }
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}
