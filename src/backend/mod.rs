//! Orchestration backends: one contract, two implementations.

pub mod cluster;
pub mod docker;
pub mod kubernetes;
pub mod network;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::auth::TokenIssuer;
use crate::config::{BackendKind, Settings};
use crate::error::Result;
use crate::models::{DeploymentRecord, DeploymentSpec, DeploymentType};
use crate::resources::capacity::{check_minimums, Capacity};

pub use self::cluster::{ClusterApi, KubeClusterApi};
pub use self::docker::DockerBackend;
pub use self::kubernetes::KubernetesBackend;

/// Returned instead of an error whenever logs cannot be read.
pub const NO_LOGS_MESSAGE: &str = "No logs available.";

#[derive(Debug, Clone)]
pub struct DeployRequest<'a> {
    pub deployment_id: &'a str,
    pub deployment_type: DeploymentType,
    pub spec: &'a DeploymentSpec,
    /// Block until the workload is ready.
    pub wait: bool,
    pub user_id: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub tail_lines: Option<u32>,
    pub since: Option<DateTime<Utc>>,
}

/// Translates deployments into native resources. Implementations own no
/// persistent state; every call reads the live state from the backend.
#[async_trait]
pub trait OrchestrationBackend: Send + Sync {
    async fn list(
        &self,
        project_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<Vec<DeploymentRecord>>;

    async fn deploy(&self, project_id: &str, request: &DeployRequest<'_>)
        -> Result<DeploymentRecord>;

    /// Fails with `NotFound` when no live resource exists.
    async fn get(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<DeploymentRecord>;

    async fn delete(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
        delete_volumes: bool,
    ) -> Result<()>;

    async fn delete_all(&self, project_id: &str, deployment_type: DeploymentType) -> Result<()>;

    async fn logs(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
        query: &LogQuery,
    ) -> Result<String>;

    /// Total host or cluster resources, `None` when unknown.
    async fn capacity(&self) -> Option<Capacity>;

    /// Fails with `InsufficientResources` or `Validation` when the spec can
    /// not run on this backend.
    async fn check_capacity(&self, spec: &DeploymentSpec) -> Result<()> {
        let capacity = self.capacity().await;
        check_minimums(&spec.compute, capacity.as_ref())
    }
}

/// Connects to the backend named in the settings.
pub async fn connect(
    settings: &Settings,
    tokens: Arc<dyn TokenIssuer>,
) -> Result<Arc<dyn OrchestrationBackend>> {
    match settings.backend {
        BackendKind::Docker => {
            let backend = DockerBackend::connect(settings.clone(), tokens)?;
            backend.reconnect_to_networks().await;
            info!("Using container engine backend");
            Ok(Arc::new(backend))
        }
        BackendKind::Kubernetes => {
            let cluster = KubeClusterApi::connect(settings.kubernetes.namespace.as_deref()).await?;
            info!("Using cluster scheduler backend in namespace {}", cluster.namespace());
            let namespace = cluster.namespace().to_string();
            Ok(Arc::new(KubernetesBackend::new(
                cluster,
                namespace,
                settings.clone(),
                tokens,
            )))
        }
    }
}
