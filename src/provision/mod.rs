pub mod allocator;
mod orchestrator;
pub mod selector;
pub mod steps;

pub use orchestrator::{CreatedContainer, Orchestrator, OrchestratorSettings};
pub use steps::{ProvisioningPlan, ScriptConfig, TailscalePlan};
