//! Shared data types for the remora dynamic provisioner.
//!
//! Holds the dynamic option-value model that crosses the plugin
//! socket, the capacity quantity parsing used for plugin sizing, and
//! the annotation/option key constants shared by the provisioner and
//! the plugin client.

pub mod keys;
pub mod options;
pub mod quantity;

pub use options::{OptionValue, OptionsMap};
pub use quantity::{claim_request_bytes, parse_quantity, size_for_factor};
