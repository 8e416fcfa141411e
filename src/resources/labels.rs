//! Labels attached to native resources.
//!
//! Selection labels identify the owner of a resource. The deployment spec
//! itself is stored next to them as a versioned JSON document so that a
//! record can be rebuilt from the live resource alone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};
use crate::models::{DeploymentSpec, DeploymentType};

pub const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    DeploymentName,
    DeploymentType,
    Description,
    DisplayName,
    Endpoints,
    Icon,
    Namespace,
    MinLifetime,
    ProjectName,
    Requirements,
    VolumePath,
    CreatedBy,
    Spec,
    SchemaVersion,
}

impl Label {
    const ALL: [Label; 14] = [
        Label::DeploymentName,
        Label::DeploymentType,
        Label::Description,
        Label::DisplayName,
        Label::Endpoints,
        Label::Icon,
        Label::Namespace,
        Label::MinLifetime,
        Label::ProjectName,
        Label::Requirements,
        Label::VolumePath,
        Label::CreatedBy,
        Label::Spec,
        Label::SchemaVersion,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            Label::DeploymentName => "deploymentName",
            Label::DeploymentType => "deploymentType",
            Label::Description => "description",
            Label::DisplayName => "displayName",
            Label::Endpoints => "endpoints",
            Label::Icon => "icon",
            Label::Namespace => "namespace",
            Label::MinLifetime => "minLifetime",
            Label::ProjectName => "projectName",
            Label::Requirements => "requirements",
            Label::VolumePath => "volumePath",
            Label::CreatedBy => "createdBy",
            Label::Spec => "spec",
            Label::SchemaVersion => "schemaVersion",
        }
    }

    pub fn key(&self, system_namespace: &str) -> String {
        format!("{}.{}", system_namespace, self.suffix())
    }
}

/// Labels shared by every resource of a project and deployment type.
pub fn selection_labels(
    system_namespace: &str,
    project_id: &str,
    deployment_type: DeploymentType,
) -> BTreeMap<String, String> {
    let mut labels = project_labels(system_namespace, project_id);
    labels.insert(
        Label::DeploymentType.key(system_namespace),
        deployment_type.to_string(),
    );
    labels
}

pub fn project_labels(system_namespace: &str, project_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            Label::Namespace.key(system_namespace),
            system_namespace.to_string(),
        ),
        (Label::ProjectName.key(system_namespace), project_id.to_string()),
    ])
}

pub fn deployment_labels(
    system_namespace: &str,
    project_id: &str,
    deployment_id: &str,
    deployment_type: DeploymentType,
) -> BTreeMap<String, String> {
    let mut labels = selection_labels(system_namespace, project_id, deployment_type);
    labels.insert(
        Label::DeploymentName.key(system_namespace),
        deployment_id.to_string(),
    );
    labels
}

/// `key=value` selector string as understood by both backends.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Removes keys reserved for system labels from user metadata.
pub fn clean_labels(
    system_namespace: &str,
    metadata: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let reserved: Vec<String> = Label::ALL.iter().map(|l| l.key(system_namespace)).collect();
    metadata
        .iter()
        .filter(|(key, _)| !reserved.contains(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[derive(Serialize, Deserialize)]
struct EncodedSpec {
    deployment_type: DeploymentType,
    #[serde(default)]
    created_by: Option<String>,
    spec: DeploymentSpec,
}

/// Encodes a spec into the metadata map of a resource. User metadata comes
/// first so that system keys always win.
pub fn encode_spec(
    system_namespace: &str,
    deployment_type: DeploymentType,
    spec: &DeploymentSpec,
    created_by: Option<&str>,
) -> Result<BTreeMap<String, String>> {
    let mut spec = spec.clone();
    spec.metadata = clean_labels(system_namespace, &spec.metadata);

    let mut labels = spec.metadata.clone();
    let ns = system_namespace;

    if let Some(display_name) = &spec.display_name {
        labels.insert(Label::DisplayName.key(ns), display_name.clone());
    }
    if let Some(description) = &spec.description {
        labels.insert(Label::Description.key(ns), description.clone());
    }
    if !spec.endpoints.is_empty() {
        labels.insert(Label::Endpoints.key(ns), spec.endpoints.join(","));
    }
    if !spec.requirements.is_empty() {
        labels.insert(Label::Requirements.key(ns), spec.requirements.join(","));
    }
    if let Some(volume_path) = spec.compute.volume() {
        labels.insert(Label::VolumePath.key(ns), volume_path.to_string());
    }
    if let Some(user) = created_by {
        labels.insert(Label::CreatedBy.key(ns), user.to_string());
    }
    labels.insert(
        Label::MinLifetime.key(ns),
        spec.compute.min_lifetime_seconds.to_string(),
    );
    labels.insert(Label::DeploymentType.key(ns), deployment_type.to_string());

    let encoded = EncodedSpec {
        deployment_type,
        created_by: created_by.map(str::to_string),
        spec,
    };
    labels.insert(Label::Spec.key(ns), serde_json::to_string(&encoded)?);
    labels.insert(Label::SchemaVersion.key(ns), SCHEMA_VERSION.to_string());
    Ok(labels)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSpec {
    pub deployment_type: DeploymentType,
    pub created_by: Option<String>,
    pub spec: DeploymentSpec,
}

/// Rebuilds the spec stored by [`encode_spec`]. Unknown schema versions are
/// rejected instead of guessed.
pub fn decode_spec(
    system_namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Result<DecodedSpec> {
    let version = labels
        .get(&Label::SchemaVersion.key(system_namespace))
        .ok_or_else(|| DeployError::validation("Resource carries no spec schema version."))?;
    if version != SCHEMA_VERSION {
        return Err(DeployError::validation(format!(
            "Unsupported spec schema version '{}'.",
            version
        )));
    }

    let raw = labels
        .get(&Label::Spec.key(system_namespace))
        .ok_or_else(|| DeployError::validation("Resource carries no encoded spec."))?;
    let encoded: EncodedSpec = serde_json::from_str(raw)?;

    Ok(DecodedSpec {
        deployment_type: encoded.deployment_type,
        created_by: encoded.created_by,
        spec: encoded.spec,
    })
}
