//! Provision LXC containers on a Proxmox VE cluster and run post-creation
//! steps inside them over SSH, with optional Tailscale enrollment.

pub mod budget;
pub mod config;
pub mod error;
pub mod models;
pub mod overlay;
pub mod provision;
pub mod proxmox;
pub mod shell;
pub mod teardown;
pub mod tunnel;

pub use budget::OperationBudget;
pub use error::{Error, Result};
