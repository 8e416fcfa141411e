pub mod action;
pub mod deployment;

pub use action::{
    ActionInstruction, ActionOutcome, DeploymentAction, ResourceAction,
    DEFAULT_DEPLOYMENT_ACTION_ID,
};
pub use deployment::{
    ComputeSpec, DeploymentRecord, DeploymentSpec, DeploymentStatus, DeploymentType,
};
