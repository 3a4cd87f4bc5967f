pub mod container;
pub mod node;
pub mod outcome;
pub mod overlay;

pub use container::{
    ContainerSpec, ContainerSummary, DeviceRequest, FeatureFlags, MountRequest, NetworkConfig,
    OverlayRequest, ProvisioningStep,
};
pub use node::{NodeInfo, NodeInventory};
pub use outcome::{
    ExecutionResult, FailedStage, LifecycleOutcome, OutcomeTag, ProvisionState, StepOutcome,
};
pub use overlay::{Confidence, MatchCandidate, OverlayIdentity};
