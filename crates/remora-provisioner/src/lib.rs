//! Claim-driven provisioning controller.
//!
//! Watches the cluster's claims, volumes, and storage classes, and
//! drives a docker volume plugin to back the claims it owns: a
//! pending claim of one of our classes starts a provision chain
//! (create plugin volume, create cluster volume, monitor the bind);
//! a released volume we provisioned starts a delete chain. Chains
//! retry each step and roll back what they created on failure, and a
//! cooperative throttle bounds how many run at once.

pub mod chain;
pub mod claim;
pub mod class;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod mailbox;
pub mod mock;
pub mod monitor;
pub mod provisioner;
pub mod steps;
pub mod throttle;
pub mod volume;

pub use chain::{Chain, ChainOutputs, Runner};
pub use cluster::{ApiClient, ClusterClient, ServerVersion, Store, WatchEventType};
pub use config::{DriverConfig, JsonConfig};
pub use error::{ProvisionerError, Result};
pub use events::{
    ClusterEventRecorder, EventRecorder, EventType, MemoryRecorder, RecordedEvent,
};
pub use mailbox::{MailboxRegistry, UpdateMessage, MAILBOX_CAPACITY};
pub use mock::MockClusterClient;
pub use provisioner::{ConfigDriverFactory, DriverFactory, Provisioner, ProvisionerConfig};
pub use steps::StepOutput;
pub use throttle::{Throttle, ThrottleGuard};
