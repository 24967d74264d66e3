use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Number of updates a mailbox buffers before senders start dropping.
pub const MAILBOX_CAPACITY: usize = 1024;

/// A claim or volume update routed to a parked bind monitor.
#[derive(Debug, Clone)]
pub enum UpdateMessage {
    Claim(Box<PersistentVolumeClaim>),
    Volume(Box<PersistentVolume>),
}

/// Registry of per-identifier mailboxes.
///
/// One mailbox serves one provision chain but is reachable under two
/// keys: the claim identifier from the start, and the volume
/// identifier once the cluster volume exists. The second key holds a
/// clone of the same sender, so removal of both keys drops every
/// sender and the receiver observes close.
///
/// Sends never block: a full or missing mailbox drops the update.
#[derive(Default)]
pub struct MailboxRegistry {
    inner: Mutex<HashMap<String, mpsc::Sender<UpdateMessage>>>,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mailbox under `id` and hand back the receiving end.
    /// Returns `None` when the id is already tracked, which callers
    /// use to detect a chain already in flight.
    pub fn register(&self, id: &str) -> Option<mpsc::Receiver<UpdateMessage>> {
        let mut inner = self.inner.lock();
        if inner.contains_key(id) {
            return None;
        }
        debug!("mailbox: creating {}", id);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        inner.insert(id.to_string(), tx);
        Some(rx)
    }

    /// Register the mailbox already tracked under `existing_id` a
    /// second time under `new_id`. Returns false when the original
    /// is gone (the chain already finished).
    pub fn alias(&self, existing_id: &str, new_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(tx) = inner.get(existing_id).cloned() else {
            return false;
        };
        if inner.contains_key(new_id) {
            return true;
        }
        debug!("mailbox: adding {} as alias of {}", new_id, existing_id);
        inner.insert(new_id.to_string(), tx);
        true
    }

    /// Deliver an update without blocking. Updates for untracked ids
    /// and updates that find the mailbox full are dropped; a mailbox
    /// whose receiver is gone is removed in the same critical
    /// section.
    pub fn send(&self, id: &str, message: UpdateMessage) {
        let mut inner = self.inner.lock();
        let Some(tx) = inner.get(id) else {
            debug!("mailbox: skipping {}, not in map", id);
            return;
        };
        match tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("mailbox: dropping update for {}, mailbox full", id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("mailbox: dropping update for {}, mailbox closed", id);
                inner.remove(id);
            }
        }
    }

    /// Remove every given id, dropping the senders under one lock
    /// section. Once the last sender is gone the parked receiver
    /// observes close; later sends for these ids drop silently.
    pub fn remove(&self, ids: &[&str]) {
        let mut inner = self.inner.lock();
        for id in ids {
            if !id.is_empty() && inner.remove(*id).is_some() {
                debug!("mailbox: removed {}", id);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// Number of ids currently tracked (aliases count separately).
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_message(name: &str) -> UpdateMessage {
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some(name.to_string());
        UpdateMessage::Claim(Box::new(claim))
    }

    #[tokio::test]
    async fn test_register_is_exclusive_per_id() {
        let registry = MailboxRegistry::new();
        assert!(registry.register("uid-1").is_some());
        assert!(registry.register("uid-1").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_send_reaches_receiver_in_order() {
        let registry = MailboxRegistry::new();
        let mut rx = registry.register("uid-1").unwrap();

        registry.send("uid-1", claim_message("first"));
        registry.send("uid-1", claim_message("second"));

        for expected in ["first", "second"] {
            match rx.recv().await.unwrap() {
                UpdateMessage::Claim(claim) => {
                    assert_eq!(claim.metadata.name.as_deref(), Some(expected));
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_alias_routes_to_same_receiver() {
        let registry = MailboxRegistry::new();
        let mut rx = registry.register("claim-uid").unwrap();
        assert!(registry.alias("claim-uid", "vol-uid"));

        registry.send("vol-uid", claim_message("via-alias"));
        assert!(rx.recv().await.is_some());

        // aliasing a missing id reports failure
        assert!(!registry.alias("ghost", "other"));
    }

    #[tokio::test]
    async fn test_send_to_unknown_id_drops_silently() {
        let registry = MailboxRegistry::new();
        registry.send("ghost", claim_message("dropped"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_excess() {
        let registry = MailboxRegistry::new();
        let mut rx = registry.register("uid-1").unwrap();

        for _ in 0..(MAILBOX_CAPACITY + 10) {
            registry.send("uid-1", claim_message("m"));
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, MAILBOX_CAPACITY);
    }

    #[tokio::test]
    async fn test_remove_closes_receiver_under_both_keys() {
        let registry = MailboxRegistry::new();
        let mut rx = registry.register("claim-uid").unwrap();
        registry.alias("claim-uid", "vol-uid");

        registry.remove(&["claim-uid", "vol-uid"]);
        assert!(registry.is_empty());

        // all senders dropped: receiver observes close
        assert!(rx.recv().await.is_none());

        // later sends are silent no-ops
        registry.send("claim-uid", claim_message("late"));
        registry.send("vol-uid", claim_message("late"));
    }
}
