//! Container-engine adapter.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, EndpointSettings, Ipam, IpamConfig,
    MountPointTypeEnum,
};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions,
};
use bollard::volume::RemoveVolumeOptions;
use bollard::Docker;
use chrono::{DateTime, Datelike, Utc};
use futures::StreamExt;
use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use super::network::{gateway, next_subnet};
use super::{DeployRequest, LogQuery, OrchestrationBackend, NO_LOGS_MESSAGE};
use crate::auth::TokenIssuer;
use crate::config::{NetworkAttachPolicy, Settings};
use crate::error::{docker_conflict, docker_not_found, DeployError, Result};
use crate::models::{DeploymentRecord, DeploymentSpec, DeploymentStatus, DeploymentType};
use crate::resources::capacity::{
    build_exec_resources, check_minimums, Capacity, DOCKER_MEMORY_FLOOR_MB,
};
use crate::resources::docker::ContainerWorkload;
use crate::resources::environment::{build_environment, DeploymentIdentity};
use crate::resources::ids::network_name;
use crate::resources::labels::{decode_spec, project_labels, selection_labels, Label};
use crate::wait::poll_until;

const STOP_TIMEOUT_SECS: i64 = 10;

pub struct DockerBackend {
    docker: Docker,
    settings: Settings,
    tokens: Arc<dyn TokenIssuer>,
}

impl DockerBackend {
    pub fn new(docker: Docker, settings: Settings, tokens: Arc<dyn TokenIssuer>) -> Self {
        Self {
            docker,
            settings,
            tokens,
        }
    }

    /// Connects through the local socket or `DOCKER_HOST`.
    pub fn connect(settings: Settings, tokens: Arc<dyn TokenIssuer>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DeployError::backend("Could not connect to the container engine.", e))?;
        Ok(Self::new(docker, settings, tokens))
    }

    fn ns(&self) -> &str {
        &self.settings.system_namespace
    }

    fn label_filters(&self, labels: &BTreeMap<String, String>) -> HashMap<String, Vec<String>> {
        let values = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        HashMap::from([("label".to_string(), values)])
    }

    /// Attaches this process's own container to every project network,
    /// e.g. after a restart. Failures are logged only.
    pub async fn reconnect_to_networks(&self) {
        let Some(container) = self.attachable_container() else {
            return;
        };
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", Label::Namespace.key(self.ns()), self.ns())],
        )]);
        let networks = match self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
        {
            Ok(networks) => networks,
            Err(e) => {
                warn!("Could not list project networks: {}", e);
                return;
            }
        };

        for network in networks.into_iter().filter_map(|n| n.name) {
            if let Err(e) = self.attach(container, &network).await {
                warn!("Could not attach {} to network {}: {}", container, network, e.detail());
            }
        }
    }

    fn attachable_container(&self) -> Option<&str> {
        if self.settings.docker.network_attach == NetworkAttachPolicy::Disabled {
            return None;
        }
        self.settings.docker.self_container.as_deref()
    }

    async fn attach(&self, container: &str, network: &str) -> Result<()> {
        let inspected = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| DeployError::backend(format!("Could not inspect container '{container}'."), e))?;
        let attached = inspected
            .network_settings
            .and_then(|s| s.networks)
            .map_or(false, |networks| networks.contains_key(network));
        if attached {
            return Ok(());
        }

        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await
            .map_err(|e| {
                DeployError::backend(format!("Could not attach '{container}' to '{network}'."), e)
            })?;
        info!("Attached {} to network {}", container, network);
        Ok(())
    }

    /// Creates the project network on first use. A concurrent creation is
    /// treated as success.
    async fn ensure_network(&self, project_id: &str) -> Result<String> {
        let name = network_name(self.ns(), project_id);
        match self
            .docker
            .inspect_network(&name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => return Ok(name),
            Err(e) if docker_not_found(&e) => {}
            Err(e) => {
                return Err(DeployError::backend(format!("Could not inspect network '{name}'."), e))
            }
        }

        let existing = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| DeployError::backend("Could not list networks.", e))?;
        let subnets: Vec<Ipv4Net> = existing
            .iter()
            .filter_map(|n| n.ipam.as_ref())
            .filter_map(|ipam| ipam.config.as_ref())
            .flatten()
            .filter_map(|config| config.subnet.as_deref())
            .filter_map(|subnet| subnet.parse().ok())
            .collect();

        let docker_settings = &self.settings.docker;
        let subnet = next_subnet(&subnets, docker_settings.subnet_pool, docker_settings.subnet_prefix)?;

        let options = CreateNetworkOptions {
            name: name.clone(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_string()),
                    gateway: Some(gateway(&subnet).to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            labels: project_labels(self.ns(), project_id).into_iter().collect(),
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => {
                info!("Created network {} with subnet {}", name, subnet);
                Ok(name)
            }
            Err(e) if docker_conflict(&e) => Ok(name),
            Err(e) => Err(DeployError::backend(format!("Could not create network '{name}'."), e)),
        }
    }

    async fn attach_self(&self, network: &str) -> Result<()> {
        let Some(container) = self.attachable_container() else {
            return Ok(());
        };
        match self.attach(container, network).await {
            Ok(()) => Ok(()),
            Err(e) if self.settings.docker.network_attach == NetworkAttachPolicy::Required => Err(e),
            Err(e) => {
                warn!("Continuing without network attachment: {}", e.detail());
                Ok(())
            }
        }
    }

    async fn inspect(&self, deployment_id: &str) -> Result<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(deployment_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(container) => Ok(Some(container)),
            Err(e) if docker_not_found(&e) => Ok(None),
            Err(e) => Err(DeployError::backend(
                format!("Could not inspect container '{deployment_id}'."),
                e,
            )),
        }
    }

    /// Live container owned by the project, or `NotFound`.
    async fn owned_container(
        &self,
        project_id: &str,
        deployment_id: &str,
    ) -> Result<ContainerInspectResponse> {
        let container = self.inspect(deployment_id).await?;
        let owned = container.filter(|c| {
            let labels = c.config.as_ref().and_then(|config| config.labels.as_ref());
            labels.map_or(false, |labels| {
                labels.get(&Label::Namespace.key(self.ns())).map(String::as_str) == Some(self.ns())
                    && labels.get(&Label::ProjectName.key(self.ns())).map(String::as_str)
                        == Some(project_id)
            })
        });
        owned.ok_or_else(|| {
            DeployError::not_found(format!(
                "Could not find deployment '{deployment_id}' of project '{project_id}'."
            ))
        })
    }

    async fn remove_container(&self, deployment_id: &str, delete_volumes: bool) -> Result<()> {
        let container = self.inspect(deployment_id).await?;
        let volumes: Vec<String> = container
            .as_ref()
            .and_then(|c| c.mounts.as_ref())
            .map(|mounts| {
                mounts
                    .iter()
                    .filter(|m| m.typ == Some(MountPointTypeEnum::VOLUME))
                    .filter_map(|m| m.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        if let Err(e) = self
            .docker
            .stop_container(deployment_id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            debug!("Stopping {} failed: {}", deployment_id, e);
        }

        let options = RemoveContainerOptions {
            v: delete_volumes,
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(deployment_id, Some(options)).await {
            Ok(()) => {}
            // Already being removed or already gone.
            Err(e) if docker_conflict(&e) || docker_not_found(&e) => {}
            Err(e) => {
                return Err(DeployError::backend(
                    format!("Could not delete container '{deployment_id}'."),
                    e,
                ))
            }
        }

        if delete_volumes {
            for volume in volumes {
                match self
                    .docker
                    .remove_volume(&volume, Some(RemoveVolumeOptions { force: true }))
                    .await
                {
                    Ok(()) => debug!("Removed volume {}", volume),
                    Err(e) if docker_not_found(&e) => {}
                    Err(e) => warn!("Could not remove volume {}: {}", volume, e),
                }
            }
        }
        Ok(())
    }

    async fn wait_until_started(&self, deployment_id: &str) -> Result<ContainerInspectResponse> {
        let timeouts = &self.settings.timeouts;
        poll_until(
            timeouts.poll_interval(),
            timeouts.ready(),
            &format!("container '{deployment_id}' to start"),
            || async move {
                let container = self.inspect(deployment_id).await?.ok_or_else(|| {
                    DeployError::not_found(format!("Container '{deployment_id}' disappeared."))
                })?;
                let created = container
                    .state
                    .as_ref()
                    .and_then(|s| s.status.as_ref())
                    .map_or(true, |status| *status == ContainerStateStatusEnum::CREATED);
                Ok((!created).then_some(container))
            },
        )
        .await
    }
}

#[async_trait]
impl OrchestrationBackend for DockerBackend {
    async fn list(
        &self,
        project_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<Vec<DeploymentRecord>> {
        let filters = self.label_filters(&selection_labels(self.ns(), project_id, deployment_type));
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| {
                DeployError::backend(format!("Could not list deployments of project '{project_id}'."), e)
            })?;

        let mut records = Vec::with_capacity(containers.len());
        for summary in containers {
            let Some(id) = summary.id else {
                continue;
            };
            // Removed between listing and inspection.
            if let Some(container) = self.inspect(&id).await? {
                records.push(container_record(self.ns(), &container, deployment_type));
            }
        }
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
            build_exec_resources(&request.spec.compute, capacity.as_ref(), DOCKER_MEMORY_FLOOR_MB)?;

        let identity = DeploymentIdentity {
            project_id: project_id.to_string(),
            deployment_id: id.to_string(),
            deployment_type: request.deployment_type,
            user_id: request.user_id.map(str::to_string),
        };
        let environment =
            build_environment(request.spec, &identity, &self.settings, self.tokens.as_ref()).await?;

        let network = self.ensure_network(project_id).await?;
        self.attach_self(&network).await?;

        let docker_settings = &self.settings.docker;
        let workload = ContainerWorkload {
            system_namespace: self.ns(),
            identity: &identity,
            spec: request.spec,
            environment: &environment,
            resources: &resources,
            network: &network,
            host_data_root: docker_settings.host_data_root.as_deref(),
            restart_retries: docker_settings.restart_retries,
            gpu_available: docker_settings.gpu_count > 0,
        };
        let config = workload.config()?;

        let options = CreateContainerOptions {
            name: id.to_string(),
            platform: None,
        };
        match self.docker.create_container(Some(options), config).await {
            Ok(response) => {
                for warning in response.warnings {
                    warn!("Container engine warning for {}: {}", id, warning);
                }
            }
            Err(e) if docker_conflict(&e) => {
                return Err(DeployError::AlreadyExists(format!(
                    "Container '{id}' already exists."
                )))
            }
            Err(e) => {
                return Err(DeployError::backend(format!("Could not deploy '{id}'."), e));
            }
        }

        if let Err(e) = self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            // The named volume may hold data of an earlier run and stays.
            if let Err(cleanup) = self.remove_container(id, false).await {
                warn!("Failed to remove container {} after start failure: {}", id, cleanup.detail());
            }
            return Err(DeployError::backend(format!("Could not start '{id}'."), e));
        }
        info!("Started container {} in project {}", id, project_id);

        let container = if request.wait {
            self.wait_until_started(id).await?
        } else {
            self.owned_container(project_id, id).await?
        };
        try_container_record(self.ns(), &container)
    }

    async fn get(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<DeploymentRecord> {
        let container = self.owned_container(project_id, deployment_id).await?;
        Ok(container_record(self.ns(), &container, deployment_type))
    }

    async fn delete(
        &self,
        project_id: &str,
        deployment_id: &str,
        _deployment_type: DeploymentType,
        delete_volumes: bool,
    ) -> Result<()> {
        self.owned_container(project_id, deployment_id).await?;
        self.remove_container(deployment_id, delete_volumes).await?;
        info!("Deleted {} from project {}", deployment_id, project_id);
        Ok(())
    }

    async fn delete_all(&self, project_id: &str, deployment_type: DeploymentType) -> Result<()> {
        for record in self.list(project_id, deployment_type).await? {
            self.remove_container(&record.id, true).await?;
        }
        info!("Deleted all {} deployments of project {}", deployment_type, project_id);
        Ok(())
    }

    async fn logs(
        &self,
        project_id: &str,
        deployment_id: &str,
        _deployment_type: DeploymentType,
        query: &LogQuery,
    ) -> Result<String> {
        self.owned_container(project_id, deployment_id).await?;

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            since: query.since.map_or(0, |since| since.timestamp()),
            tail: query
                .tail_lines
                .map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.logs(deployment_id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => output.push_str(&chunk.to_string()),
                Err(e) => {
                    warn!("Could not read logs of {}: {}", deployment_id, e);
                    return Ok(NO_LOGS_MESSAGE.to_string());
                }
            }
        }

        if output.is_empty() {
            Ok(NO_LOGS_MESSAGE.to_string())
        } else {
            Ok(output)
        }
    }

    async fn capacity(&self) -> Option<Capacity> {
        match self.docker.info().await {
            Ok(info) => Some(Capacity {
                cpus: info.ncpu.unwrap_or(0) as f64,
                memory_mb: (info.mem_total.unwrap_or(0).max(0) as u64) / 1_000_000,
                gpus: self.settings.docker.gpu_count,
            }),
            Err(e) => {
                warn!("Could not determine host capacity: {}", e);
                None
            }
        }
    }

    async fn check_capacity(&self, spec: &DeploymentSpec) -> Result<()> {
        if spec.compute.replicas() > 1 {
            return Err(DeployError::validation(
                "The container engine backend does not support more than one replica.",
            ));
        }
        let capacity = self.capacity().await;
        check_minimums(&spec.compute, capacity.as_ref())
    }
}

pub fn container_status(container: &ContainerInspectResponse) -> DeploymentStatus {
    let Some(state) = container.state.as_ref() else {
        return DeploymentStatus::Unknown;
    };
    match state.status {
        Some(ContainerStateStatusEnum::CREATED) => DeploymentStatus::Pending,
        Some(ContainerStateStatusEnum::RUNNING) => DeploymentStatus::Running,
        Some(ContainerStateStatusEnum::EXITED) if state.exit_code == Some(0) => {
            DeploymentStatus::Succeeded
        }
        Some(ContainerStateStatusEnum::EXITED) => DeploymentStatus::Failed,
        Some(ContainerStateStatusEnum::REMOVING) => DeploymentStatus::Terminating,
        _ => DeploymentStatus::Unknown,
    }
}

/// The engine reports `0001-01-01T00:00:00Z` for timestamps that never happened.
fn parse_engine_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw?).ok()?.with_timezone(&Utc);
    (parsed.year() > 1).then_some(parsed)
}

fn container_id(container: &ContainerInspectResponse, system_namespace: &str) -> String {
    container
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(&Label::DeploymentName.key(system_namespace)).cloned())
        .or_else(|| container.name.as_ref().map(|n| n.trim_start_matches('/').to_string()))
        .unwrap_or_default()
}

fn try_container_record(
    system_namespace: &str,
    container: &ContainerInspectResponse,
) -> Result<DeploymentRecord> {
    let labels: BTreeMap<String, String> = container
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default()
        .into_iter()
        .collect();
    let decoded = decode_spec(system_namespace, &labels)?;

    let mut record = DeploymentRecord::new(
        container_id(container, system_namespace),
        decoded.deployment_type,
        decoded.spec,
    );
    record.internal_id = container.id.clone();
    record.status = container_status(container);

    let state = container.state.as_ref();
    record.started_at = parse_engine_time(state.and_then(|s| s.started_at.as_deref()));
    if matches!(record.status, DeploymentStatus::Succeeded | DeploymentStatus::Failed) {
        record.stopped_at = parse_engine_time(state.and_then(|s| s.finished_at.as_deref()));
    }
    Ok(record)
}

/// Record for a live container. Undecodable specs yield `Unknown` status.
pub fn container_record(
    system_namespace: &str,
    container: &ContainerInspectResponse,
    fallback_type: DeploymentType,
) -> DeploymentRecord {
    match try_container_record(system_namespace, container) {
        Ok(record) => record,
        Err(e) => {
            let id = container_id(container, system_namespace);
            debug!("Could not decode spec of {}: {}", id, e);
            let image = container
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default();
            let mut record =
                DeploymentRecord::new(id.clone(), fallback_type, DeploymentSpec::new(image, id));
            record.internal_id = container.id.clone();
            record.status = DeploymentStatus::Unknown;
            record
        }
    }
}
