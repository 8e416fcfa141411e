//! Cluster-scheduler adapter.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodSpec, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, error, info, warn};

use super::cluster::{ClusterApi, ClusterResource};
use super::{DeployRequest, LogQuery, OrchestrationBackend, NO_LOGS_MESSAGE};
use crate::auth::TokenIssuer;
use crate::config::Settings;
use crate::error::{kube_conflict, kube_not_found, DeployError, Result};
use crate::models::{DeploymentRecord, DeploymentSpec, DeploymentStatus, DeploymentType};
use crate::resources::capacity::{build_exec_resources, Capacity, KUBE_MEMORY_FLOOR_MB};
use crate::resources::environment::{build_environment, DeploymentIdentity};
use crate::resources::kube::{network_policy, network_policy_name, KubeWorkload};
use crate::resources::labels::{decode_spec, deployment_labels, selection_labels, selector_string, Label};
use crate::wait::poll_until;

pub struct KubernetesBackend<C> {
    cluster: C,
    namespace: String,
    settings: Settings,
    tokens: Arc<dyn TokenIssuer>,
}

/// Resources created during one deploy call, deleted again on failure.
#[derive(Default)]
struct Created {
    volume_claim: bool,
    service: bool,
    workload: bool,
}

impl<C: ClusterApi> KubernetesBackend<C> {
    pub fn new(
        cluster: C,
        namespace: impl Into<String>,
        settings: Settings,
        tokens: Arc<dyn TokenIssuer>,
    ) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            settings,
            tokens,
        }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    fn ns(&self) -> &str {
        &self.settings.system_namespace
    }

    /// Creates the project's isolation policy unless it exists. A concurrent
    /// creation is treated as success.
    async fn ensure_network_policy(&self, project_id: &str) -> Result<()> {
        let name = network_policy_name(self.ns(), project_id);
        let existing = self
            .cluster
            .get::<NetworkPolicy>(&name)
            .await
            .map_err(|e| DeployError::backend(format!("Could not read network policy '{name}'."), e))?;
        if existing.is_some() {
            return Ok(());
        }

        let policy = network_policy(self.ns(), &self.namespace, project_id);
        match self.cluster.create(&policy).await {
            Ok(_) => {
                info!("Created network policy {} for project {}", name, project_id);
                Ok(())
            }
            Err(e) if kube_conflict(&e) => Ok(()),
            Err(e) => Err(DeployError::backend(
                format!("Could not create network policy for project '{project_id}'."),
                e,
            )),
        }
    }

    /// Creates an object. Returns `false` when it already existed.
    async fn create_benign<K: ClusterResource>(&self, object: &K, what: &str) -> Result<bool> {
        match self.cluster.create(object).await {
            Ok(_) => Ok(true),
            Err(e) if kube_conflict(&e) => {
                debug!("{} already exists", what);
                Ok(false)
            }
            Err(e) => Err(DeployError::backend(format!("Could not create {what}."), e)),
        }
    }

    /// Best-effort cleanup after a failed deploy. Failures are logged only.
    async fn compensate(&self, deployment_id: &str, deployment_type: DeploymentType, created: &Created) {
        if created.workload {
            let result = if deployment_type.is_job() {
                self.cluster.delete::<Job>(deployment_id).await
            } else {
                self.cluster.delete::<Deployment>(deployment_id).await
            };
            if let Err(e) = result {
                error!("Failed to remove workload {} during rollback: {}", deployment_id, e);
            }
        }
        if created.service {
            if let Err(e) = self.cluster.delete::<Service>(deployment_id).await {
                error!("Failed to remove service {} during rollback: {}", deployment_id, e);
            }
        }
        if created.volume_claim {
            if let Err(e) = self.cluster.delete::<PersistentVolumeClaim>(deployment_id).await {
                error!("Failed to remove volume claim {} during rollback: {}", deployment_id, e);
            }
        }
    }

    async fn wait_for_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        let timeouts = &self.settings.timeouts;
        poll_until(
            timeouts.poll_interval(),
            timeouts.ready(),
            &format!("deployment '{deployment_id}' to become ready"),
            || async move {
                let current = self
                    .cluster
                    .get::<Deployment>(deployment_id)
                    .await
                    .map_err(|e| DeployError::backend(format!("Could not read deployment '{deployment_id}'."), e))?;
                Ok(current.filter(deployment_is_ready))
            },
        )
        .await
    }

    async fn wait_for_job(&self, deployment_id: &str) -> Result<Job> {
        let timeouts = &self.settings.timeouts;
        poll_until(
            timeouts.poll_interval(),
            timeouts.ready(),
            &format!("job '{deployment_id}' to start"),
            || async move {
                let current = self
                    .cluster
                    .get::<Job>(deployment_id)
                    .await
                    .map_err(|e| DeployError::backend(format!("Could not read job '{deployment_id}'."), e))?;
                Ok(current.filter(|job| job_status(job) != DeploymentStatus::Pending))
            },
        )
        .await
    }

    async fn wait_for_absence<K: ClusterResource>(&self, name: &str) -> Result<()> {
        let timeouts = &self.settings.timeouts;
        poll_until(
            timeouts.poll_interval(),
            timeouts.delete(),
            &format!("'{name}' to be deleted"),
            || async move {
                match self.cluster.get::<K>(name).await {
                    Ok(None) => Ok(Some(())),
                    Ok(Some(_)) => Ok(None),
                    Err(e) if kube_not_found(&e) => Ok(Some(())),
                    Err(e) => Err(DeployError::backend(format!("Could not read '{name}'."), e)),
                }
            },
        )
        .await
    }

    fn belongs_to(&self, record_labels: Option<&BTreeMap<String, String>>, project_id: &str) -> bool {
        let Some(labels) = record_labels else {
            return false;
        };
        labels.get(&Label::Namespace.key(self.ns())).map(String::as_str) == Some(self.ns())
            && labels.get(&Label::ProjectName.key(self.ns())).map(String::as_str) == Some(project_id)
    }

    async fn deploy_inner(
        &self,
        project_id: &str,
        request: &DeployRequest<'_>,
        workload: &KubeWorkload<'_>,
        created: &mut Created,
    ) -> Result<DeploymentRecord> {
        let id = request.deployment_id;
        let kube = &self.settings.kubernetes;

        if let Some(claim) = workload.volume_claim(&kube.storage_class, kube.default_volume_size_mb) {
            created.volume_claim = self
                .create_benign(&claim, &format!("volume claim for '{id}'"))
                .await?;
        }

        let service = workload.service()?;
        created.service = self
            .create_benign(&service, &format!("service endpoint for '{id}'"))
            .await?;

        let create_err = |e| DeployError::backend(format!("Could not deploy '{id}'."), e);
        let record = if request.deployment_type.is_job() {
            let job = workload.job()?;
            match self.cluster.create(&job).await {
                Ok(job) => {
                    created.workload = true;
                    info!("Created job {} in project {}", id, project_id);
                    let job = if request.wait { self.wait_for_job(id).await? } else { job };
                    try_job_record(self.ns(), &job)?
                }
                Err(e) if kube_conflict(&e) => {
                    return Err(DeployError::AlreadyExists(format!("Job '{id}' already exists.")))
                }
                Err(e) => return Err(create_err(e)),
            }
        } else {
            let deployment = workload.deployment()?;
            match self.cluster.create(&deployment).await {
                Ok(deployment) => {
                    created.workload = true;
                    info!("Created deployment {} in project {}", id, project_id);
                    let deployment = if request.wait {
                        self.wait_for_deployment(id).await?
                    } else {
                        deployment
                    };
                    try_deployment_record(self.ns(), &deployment)?
                }
                Err(e) if kube_conflict(&e) => {
                    return Err(DeployError::AlreadyExists(format!(
                        "Deployment '{id}' already exists."
                    )))
                }
                Err(e) => return Err(create_err(e)),
            }
        };
        Ok(record)
    }
}

#[async_trait]
impl<C: ClusterApi> OrchestrationBackend for KubernetesBackend<C> {
    async fn list(
        &self,
        project_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<Vec<DeploymentRecord>> {
        let selector = selector_string(&selection_labels(self.ns(), project_id, deployment_type));
        let list_err = |e| {
            DeployError::backend(format!("Could not list deployments of project '{project_id}'."), e)
        };

        let mut records = if deployment_type.is_job() {
            self.cluster
                .list::<Job>(&selector)
                .await
                .map_err(list_err)?
                .iter()
                .map(|job| job_record(self.ns(), job))
                .collect::<Vec<_>>()
        } else {
            self.cluster
                .list::<Deployment>(&selector)
                .await
                .map_err(list_err)?
                .iter()
                .map(|d| deployment_record(self.ns(), d))
                .collect::<Vec<_>>()
        };
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn deploy(
        &self,
        project_id: &str,
        request: &DeployRequest<'_>,
    ) -> Result<DeploymentRecord> {
        let id = request.deployment_id;
        let capacity = self.capacity().await;
        let resources =
            build_exec_resources(&request.spec.compute, capacity.as_ref(), KUBE_MEMORY_FLOOR_MB)?;

        let identity = DeploymentIdentity {
            project_id: project_id.to_string(),
            deployment_id: id.to_string(),
            deployment_type: request.deployment_type,
            user_id: request.user_id.map(str::to_string),
        };
        let environment =
            build_environment(request.spec, &identity, &self.settings, self.tokens.as_ref()).await?;

        self.ensure_network_policy(project_id).await?;

        let workload = KubeWorkload {
            system_namespace: self.ns(),
            namespace: &self.namespace,
            identity: &identity,
            spec: request.spec,
            environment: &environment,
            resources: &resources,
            min_ready_seconds: self.settings.kubernetes.min_ready_seconds,
        };

        let mut created = Created::default();
        match self.deploy_inner(project_id, request, &workload, &mut created).await {
            Ok(record) => Ok(record),
            // A workload that never became ready stays in place.
            Err(e @ DeployError::Timeout(_)) => {
                warn!("Deployment {} did not become ready: {}", id, e);
                Err(e)
            }
            Err(e) => {
                warn!("Deploying {} failed, rolling back: {}", id, e.detail());
                self.compensate(id, request.deployment_type, &created).await;
                Err(e)
            }
        }
    }

    async fn get(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<DeploymentRecord> {
        let labels = if deployment_type.is_job() {
            self.cluster
                .get::<Job>(deployment_id)
                .await
                .map_err(|e| DeployError::backend(format!("Could not read job '{deployment_id}'."), e))?
                .map(|job| (job.metadata.labels.clone(), job_record(self.ns(), &job)))
        } else {
            self.cluster
                .get::<Deployment>(deployment_id)
                .await
                .map_err(|e| {
                    DeployError::backend(format!("Could not read deployment '{deployment_id}'."), e)
                })?
                .map(|d| (d.metadata.labels.clone(), deployment_record(self.ns(), &d)))
        };

        match labels {
            Some((labels, record)) if self.belongs_to(labels.as_ref(), project_id) => Ok(record),
            _ => Err(DeployError::not_found(format!(
                "Could not find deployment '{deployment_id}' of project '{project_id}'."
            ))),
        }
    }

    async fn delete(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
        delete_volumes: bool,
    ) -> Result<()> {
        self.get(project_id, deployment_id, deployment_type).await?;

        let delete_err = |e| DeployError::backend(format!("Could not delete '{deployment_id}'."), e);
        match self.cluster.delete::<Service>(deployment_id).await {
            Err(e) if !kube_not_found(&e) => return Err(delete_err(e)),
            _ => {}
        }

        let result = if deployment_type.is_job() {
            self.cluster.delete::<Job>(deployment_id).await
        } else {
            self.cluster.delete::<Deployment>(deployment_id).await
        };
        match result {
            Err(e) if !kube_not_found(&e) => return Err(delete_err(e)),
            _ => {}
        }

        if delete_volumes {
            match self.cluster.delete::<PersistentVolumeClaim>(deployment_id).await {
                Err(e) if !kube_not_found(&e) => return Err(delete_err(e)),
                _ => {}
            }
        }

        if deployment_type.is_job() {
            self.wait_for_absence::<Job>(deployment_id).await?;
        } else {
            self.wait_for_absence::<Deployment>(deployment_id).await?;
        }
        info!("Deleted {} from project {}", deployment_id, project_id);
        Ok(())
    }

    async fn delete_all(&self, project_id: &str, deployment_type: DeploymentType) -> Result<()> {
        let selector = selector_string(&selection_labels(self.ns(), project_id, deployment_type));
        let delete_err =
            |e| DeployError::backend(format!("Could not delete deployments of project '{project_id}'."), e);

        if deployment_type.is_job() {
            self.cluster.delete_collection::<Job>(&selector).await.map_err(delete_err)?;
        } else {
            self.cluster
                .delete_collection::<Deployment>(&selector)
                .await
                .map_err(delete_err)?;
        }
        self.cluster
            .delete_collection::<Service>(&selector)
            .await
            .map_err(delete_err)?;
        self.cluster
            .delete_collection::<PersistentVolumeClaim>(&selector)
            .await
            .map_err(delete_err)?;
        info!("Deleted all {} deployments of project {}", deployment_type, project_id);
        Ok(())
    }

    async fn logs(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
        query: &LogQuery,
    ) -> Result<String> {
        let selector = selector_string(&deployment_labels(
            self.ns(),
            project_id,
            deployment_id,
            deployment_type,
        ));
        let pods = match self.cluster.list::<Pod>(&selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!("Could not list pods of {}: {}", deployment_id, e);
                return Ok(NO_LOGS_MESSAGE.to_string());
            }
        };
        let Some(pod_name) = pods.first().and_then(|pod| pod.metadata.name.clone()) else {
            return Err(DeployError::not_found(format!(
                "Could not find deployment '{deployment_id}' of project '{project_id}'."
            )));
        };

        let timeouts = &self.settings.timeouts;
        let started = poll_until(
            timeouts.poll_interval(),
            timeouts.logs(),
            &format!("pod '{pod_name}' to leave the pending phase"),
            || {
                let pod_name = pod_name.clone();
                async move {
                    let pod = self
                        .cluster
                        .get::<Pod>(&pod_name)
                        .await
                        .map_err(|e| DeployError::backend("Could not read pod.", e))?;
                    let pending = pod
                        .and_then(|p| p.status)
                        .and_then(|s| s.phase)
                        .map_or(true, |phase| phase == "Pending");
                    Ok((!pending).then_some(()))
                }
            },
        )
        .await;
        if let Err(e) = started {
            warn!("No logs for {}: {}", deployment_id, e);
            return Ok(NO_LOGS_MESSAGE.to_string());
        }

        let since_seconds = query
            .since
            .map(|since| (Utc::now() - since).num_seconds().max(1));
        match self
            .cluster
            .pod_logs(&pod_name, query.tail_lines.map(i64::from), since_seconds)
            .await
        {
            Ok(logs) if !logs.is_empty() => Ok(logs),
            Ok(_) => Ok(NO_LOGS_MESSAGE.to_string()),
            Err(e) => {
                warn!("Could not read logs of pod {}: {}", pod_name, e);
                Ok(NO_LOGS_MESSAGE.to_string())
            }
        }
    }

    async fn capacity(&self) -> Option<Capacity> {
        if let Some(capacity) = self.settings.kubernetes.capacity {
            return Some(capacity);
        }
        match self.cluster.node_capacity().await {
            Ok(capacity) => Some(capacity),
            Err(e) => {
                warn!("Could not determine cluster capacity: {}", e);
                None
            }
        }
    }
}

/// Ready once every replica is updated and available for the latest generation.
pub fn deployment_is_ready(deployment: &Deployment) -> bool {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let generation = deployment.metadata.generation.unwrap_or(0);

    status.replicas.unwrap_or(0) == desired
        && status.updated_replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
        && status.observed_generation.unwrap_or(0) >= generation
}

pub fn deployment_status(deployment: &Deployment) -> DeploymentStatus {
    if deployment.metadata.deletion_timestamp.is_some() {
        return DeploymentStatus::Terminating;
    }
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    if ready == desired {
        DeploymentStatus::Running
    } else {
        DeploymentStatus::Pending
    }
}

pub fn job_status(job: &Job) -> DeploymentStatus {
    if job.metadata.deletion_timestamp.is_some() {
        return DeploymentStatus::Terminating;
    }
    let Some(status) = job.status.as_ref() else {
        return DeploymentStatus::Pending;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        DeploymentStatus::Succeeded
    } else if status.active.unwrap_or(0) > 0 {
        DeploymentStatus::Running
    } else if status.failed.unwrap_or(0) > 0 {
        DeploymentStatus::Failed
    } else {
        DeploymentStatus::Pending
    }
}

fn record_from_meta(
    system_namespace: &str,
    metadata: &ObjectMeta,
    pod: Option<&PodSpec>,
    fallback_type: DeploymentType,
    status: DeploymentStatus,
    strict: bool,
) -> Result<DeploymentRecord> {
    let id = metadata.name.clone().unwrap_or_default();
    let annotations = metadata.annotations.clone().unwrap_or_default();

    let (deployment_type, spec, status) = match decode_spec(system_namespace, &annotations) {
        Ok(decoded) => (decoded.deployment_type, decoded.spec, status),
        Err(e) if strict => return Err(e),
        Err(e) => {
            debug!("Could not decode spec of {}: {}", id, e);
            let image = pod
                .and_then(|p| p.containers.first())
                .and_then(|c| c.image.clone())
                .unwrap_or_default();
            let spec = DeploymentSpec::new(image, id.clone());
            (fallback_type, spec, DeploymentStatus::Unknown)
        }
    };

    let mut record = DeploymentRecord::new(id, deployment_type, spec);
    record.internal_id = metadata.uid.clone();
    record.status = status;
    record.started_at = metadata.creation_timestamp.as_ref().map(|t| t.0);
    Ok(record)
}

fn try_deployment_record(system_namespace: &str, deployment: &Deployment) -> Result<DeploymentRecord> {
    record_from_meta(
        system_namespace,
        &deployment.metadata,
        deployment.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
        DeploymentType::Service,
        deployment_status(deployment),
        true,
    )
}

/// Record for a live deployment. Undecodable specs yield `Unknown` status.
pub fn deployment_record(system_namespace: &str, deployment: &Deployment) -> DeploymentRecord {
    let pod = deployment.spec.as_ref().and_then(|s| s.template.spec.as_ref());
    match record_from_meta(
        system_namespace,
        &deployment.metadata,
        pod,
        DeploymentType::Service,
        deployment_status(deployment),
        false,
    ) {
        Ok(record) => record,
        Err(_) => unknown_record(&deployment.metadata, DeploymentType::Service),
    }
}

fn try_job_record(system_namespace: &str, job: &Job) -> Result<DeploymentRecord> {
    let mut record = record_from_meta(
        system_namespace,
        &job.metadata,
        job.spec.as_ref().and_then(|s| s.template.spec.as_ref()),
        DeploymentType::Job,
        job_status(job),
        true,
    )?;
    record.stopped_at = job
        .status
        .as_ref()
        .and_then(|s| s.completion_time.as_ref())
        .map(|t| t.0);
    Ok(record)
}

pub fn job_record(system_namespace: &str, job: &Job) -> DeploymentRecord {
    match try_job_record(system_namespace, job) {
        Ok(record) => record,
        Err(_) => {
            let pod = job.spec.as_ref().and_then(|s| s.template.spec.as_ref());
            record_from_meta(
                system_namespace,
                &job.metadata,
                pod,
                DeploymentType::Job,
                job_status(job),
                false,
            )
            .unwrap_or_else(|_| unknown_record(&job.metadata, DeploymentType::Job))
        }
    }
}

fn unknown_record(metadata: &ObjectMeta, deployment_type: DeploymentType) -> DeploymentRecord {
    let id = metadata.name.clone().unwrap_or_default();
    let mut record = DeploymentRecord::new(id.clone(), deployment_type, DeploymentSpec::new("", id));
    record.internal_id = metadata.uid.clone();
    record.status = DeploymentStatus::Unknown;
    record
}
