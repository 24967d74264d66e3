//! Client for docker volume plugins.
//!
//! Speaks the volume-driver protocol over a local unix socket:
//! typed create/update/list/get/mount/unmount/remove operations with
//! the plugin's `Err` field promoted to real errors. Named V2
//! plugins are resolved to their socket through the container
//! runtime's plugin catalog.

pub mod catalog;
pub mod client;
pub mod error;
pub mod mock;
mod transport;

pub use catalog::{DockerClient, Plugin};
pub use client::{DockerVolume, DockerVolumePlugin, Options, PluginCapabilities, VolumeDriver};
pub use error::{DockervolError, Result};
pub use mock::MockVolumeDriver;
