//! Action state machine.

use crate::error::{DeployError, Result};
use crate::models::{DeploymentAction, DeploymentRecord};

/// Actions offered for a record. Stopped records can only be started,
/// all others can be stopped, restarted and accessed through each declared
/// endpoint.
pub fn available_actions(record: &DeploymentRecord) -> Vec<DeploymentAction> {
    if record.status.is_stopped() {
        return vec![DeploymentAction::Start];
    }

    let mut actions = vec![DeploymentAction::Stop, DeploymentAction::Restart];
    for endpoint in &record.spec.endpoints {
        let action = DeploymentAction::access(endpoint);
        if !actions.contains(&action) {
            actions.push(action);
        }
    }
    actions
}

/// Rejects actions not offered for the record's current state.
pub fn ensure_allowed(record: &DeploymentRecord, action: &DeploymentAction) -> Result<()> {
    if available_actions(record).contains(action) {
        return Ok(());
    }
    Err(DeployError::validation(format!(
        "Action '{}' is not available for '{}' in state '{}'.",
        action, record.id, record.status
    )))
}

/// Declared endpoint an access action refers to.
pub fn access_endpoint<'a>(record: &'a DeploymentRecord, endpoint: &str) -> Option<&'a str> {
    record
        .spec
        .endpoints
        .iter()
        .map(String::as_str)
        .find(|declared| declared.replace('/', "") == endpoint)
}
