//! Pterodactyl panel integration: wire types, HTTP client, and the
//! provisioning flow that places ordered servers onto nodes.

pub mod client;
pub mod provision;
pub mod types;

pub use client::{PanelClient, PanelError, ALLOWED_POWER_SIGNALS};
pub use provision::{ProvisionError, Provisioner};
