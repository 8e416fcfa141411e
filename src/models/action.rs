use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::deployment::DeploymentRecord;
use crate::error::{DeployError, Result};

/// Action id returned by the deploy preview.
pub const DEFAULT_DEPLOYMENT_ACTION_ID: &str = "default";

const ACCESS_PREFIX: &str = "access-";

/// Lifecycle action on an existing deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentAction {
    Start,
    Stop,
    Restart,
    /// Open the given endpoint. The endpoint is stored without slashes.
    Access { endpoint: String },
}

impl DeploymentAction {
    pub fn access(endpoint: &str) -> Self {
        DeploymentAction::Access {
            endpoint: endpoint.replace('/', ""),
        }
    }

    pub fn id(&self) -> String {
        match self {
            DeploymentAction::Start => "start".to_string(),
            DeploymentAction::Stop => "stop".to_string(),
            DeploymentAction::Restart => "restart".to_string(),
            DeploymentAction::Access { endpoint } => format!("{ACCESS_PREFIX}{endpoint}"),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            DeploymentAction::Start => "Start".to_string(),
            DeploymentAction::Stop => "Stop".to_string(),
            DeploymentAction::Restart => "Restart".to_string(),
            DeploymentAction::Access { endpoint } => format!("Endpoint: {endpoint}"),
        }
    }
}

impl fmt::Display for DeploymentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl FromStr for DeploymentAction {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(DeploymentAction::Start),
            "stop" => Ok(DeploymentAction::Stop),
            "restart" => Ok(DeploymentAction::Restart),
            other => match other.strip_prefix(ACCESS_PREFIX) {
                Some(endpoint) if !endpoint.is_empty() => Ok(DeploymentAction::Access {
                    endpoint: endpoint.to_string(),
                }),
                _ => Err(DeployError::validation(format!(
                    "Unknown action id '{}'.",
                    other
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActionInstruction {
    NewTab { url: String },
}

/// An action offered to the caller. Computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAction {
    pub action_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<ActionInstruction>,
}

impl ResourceAction {
    pub fn default_deploy() -> Self {
        Self {
            action_id: DEFAULT_DEPLOYMENT_ACTION_ID.to_string(),
            display_name: DEFAULT_DEPLOYMENT_ACTION_ID.to_string(),
            instructions: Vec::new(),
        }
    }
}

impl From<&DeploymentAction> for ResourceAction {
    fn from(action: &DeploymentAction) -> Self {
        Self {
            action_id: action.id(),
            display_name: action.display_name(),
            instructions: Vec::new(),
        }
    }
}

/// Result of executing an action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Record(Box<DeploymentRecord>),
    Redirect { url: String },
}
