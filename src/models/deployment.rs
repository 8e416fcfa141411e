use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentType {
    Service,
    Job,
    Extension,
    CoreBackend,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Service => "service",
            DeploymentType::Job => "job",
            DeploymentType::Extension => "extension",
            DeploymentType::CoreBackend => "core-backend",
        }
    }

    /// Jobs run to completion, everything else is long-running.
    pub fn is_job(&self) -> bool {
        matches!(self, DeploymentType::Job)
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentType {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "service" => Ok(DeploymentType::Service),
            "job" => Ok(DeploymentType::Job),
            "extension" => Ok(DeploymentType::Extension),
            "core-backend" => Ok(DeploymentType::CoreBackend),
            other => Err(DeployError::validation(format!(
                "Unknown deployment type '{}'.",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Terminating,
    Stopped,
    Unknown,
}

impl DeploymentStatus {
    pub fn is_stopped(&self) -> bool {
        matches!(self, DeploymentStatus::Stopped)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Terminating => "terminating",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_gpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_volume_size_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_container_size_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
    #[serde(default)]
    pub min_lifetime_seconds: u64,
}

impl ComputeSpec {
    pub fn replicas(&self) -> u32 {
        self.max_replicas.unwrap_or(1)
    }

    /// Volume path, if a non-empty one was declared.
    pub fn volume(&self) -> Option<&str> {
        self.volume_path.as_deref().filter(|p| !p.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        fn ordered<T: PartialOrd + fmt::Display>(
            name: &str,
            min: Option<T>,
            max: Option<T>,
        ) -> Result<()> {
            if let (Some(min), Some(max)) = (min, max) {
                if max < min {
                    return Err(DeployError::validation(format!(
                        "max_{name} ({max}) must not be smaller than min_{name} ({min})."
                    )));
                }
            }
            Ok(())
        }

        ordered("cpus", self.min_cpus, self.max_cpus)?;
        ordered("memory_mb", self.min_memory_mb, self.max_memory_mb)?;
        ordered("gpus", self.min_gpus, self.max_gpus)?;

        for (name, value) in [("min_cpus", self.min_cpus), ("max_cpus", self.max_cpus)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(DeployError::validation(format!(
                        "{name} must be a non-negative number."
                    )));
                }
            }
        }

        if self.max_replicas == Some(0) {
            return Err(DeployError::validation("max_replicas must be at least 1."));
        }
        Ok(())
    }
}

/// Caller input describing a workload. Never modified after submission,
/// except through an explicit update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub container_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub compute: ComputeSpec,
    /// Persist the deployment without starting it.
    #[serde(default)]
    pub is_stopped: bool,
    /// Remove the volume when the deployment is stopped.
    #[serde(default)]
    pub clear_volume_on_stop: bool,
}

impl DeploymentSpec {
    pub fn new(container_image: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            container_image: container_image.into(),
            display_name: Some(display_name.into()),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> Result<&str> {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(DeployError::validation(
                "A display name is required to deploy a workload.",
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.container_image.trim().is_empty() {
            return Err(DeployError::validation("A container image is required."));
        }
        self.display_name()?;
        self.compute.validate()?;
        crate::resources::endpoints::parse_endpoints(&self.endpoints)?;
        Ok(())
    }
}

/// A deployment as known to the reconciliation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    #[serde(default)]
    pub internal_id: Option<String>,
    pub deployment_type: DeploymentType,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_access_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_access_user: Option<String>,
    #[serde(flatten)]
    pub spec: DeploymentSpec,
}

impl DeploymentRecord {
    pub fn new(id: impl Into<String>, deployment_type: DeploymentType, spec: DeploymentSpec) -> Self {
        Self {
            id: id.into(),
            internal_id: None,
            deployment_type,
            status: DeploymentStatus::Pending,
            started_at: None,
            stopped_at: None,
            last_access_time: None,
            last_access_user: None,
            spec,
        }
    }

    /// Presentation of a record whose live resource is gone.
    pub fn mark_stopped(&mut self) {
        self.status = DeploymentStatus::Stopped;
        self.internal_id = None;
    }
}
