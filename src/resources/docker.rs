//! Container-engine definitions built from a deployment spec.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use bollard::container::{Config, NetworkingConfig};
use bollard::models::{
    DeviceRequest, EndpointSettings, HostConfig, Mount, MountTypeEnum, MountVolumeOptions,
    RestartPolicy, RestartPolicyNameEnum,
};

use crate::error::Result;
use crate::models::DeploymentSpec;
use crate::resources::capacity::ExecResources;
use crate::resources::endpoints::parse_endpoints;
use crate::resources::environment::DeploymentIdentity;
use crate::resources::ids::volume_name;
use crate::resources::labels::{deployment_labels, encode_spec, Label};

pub struct ContainerWorkload<'a> {
    pub system_namespace: &'a str,
    pub identity: &'a DeploymentIdentity,
    pub spec: &'a DeploymentSpec,
    pub environment: &'a BTreeMap<String, String>,
    pub resources: &'a ExecResources,
    pub network: &'a str,
    /// Bind mount volumes below this directory instead of using named volumes.
    pub host_data_root: Option<&'a Path>,
    pub restart_retries: i64,
    pub gpu_available: bool,
}

impl ContainerWorkload<'_> {
    /// Selection labels plus the encoded spec.
    pub fn labels(&self) -> Result<HashMap<String, String>> {
        let mut labels: HashMap<String, String> = encode_spec(
            self.system_namespace,
            self.identity.deployment_type,
            self.spec,
            self.identity.user_id.as_deref(),
        )?
        .into_iter()
        .collect();
        labels.extend(deployment_labels(
            self.system_namespace,
            &self.identity.project_id,
            &self.identity.deployment_id,
            self.identity.deployment_type,
        ));
        Ok(labels)
    }

    pub fn mounts(&self) -> Vec<Mount> {
        let Some(target) = self.spec.compute.volume() else {
            return Vec::new();
        };
        let name = volume_name(&self.identity.project_id, &self.identity.deployment_id);

        let mount = match self.host_data_root {
            Some(root) => Mount {
                target: Some(target.to_string()),
                source: Some(root.join(&name).to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            },
            None => Mount {
                target: Some(target.to_string()),
                source: Some(name),
                typ: Some(MountTypeEnum::VOLUME),
                volume_options: Some(MountVolumeOptions {
                    labels: Some(self.volume_labels()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };
        vec![mount]
    }

    fn volume_labels(&self) -> HashMap<String, String> {
        let ns = self.system_namespace;
        HashMap::from([
            (Label::Namespace.key(ns), ns.to_string()),
            (Label::ProjectName.key(ns), self.identity.project_id.clone()),
            (
                Label::DeploymentName.key(ns),
                self.identity.deployment_id.clone(),
            ),
        ])
    }

    pub fn config(&self) -> Result<Config<String>> {
        let env: Vec<String> = self
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = parse_endpoints(&self.spec.endpoints)?
            .into_iter()
            .map(|endpoint| (format!("{}/tcp", endpoint.port), HashMap::new()))
            .collect();

        let mounts = self.mounts();
        let device_requests = (self.gpu_available && self.resources.gpus > 0).then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(i64::from(self.resources.gpus)),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let host_config = HostConfig {
            nano_cpus: Some(self.resources.nano_cpus()),
            memory: Some(self.resources.memory_bytes()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ON_FAILURE),
                maximum_retry_count: Some(self.restart_retries),
            }),
            network_mode: Some(self.network.to_string()),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            device_requests,
            ..Default::default()
        };

        Ok(Config {
            image: Some(self.spec.container_image.clone()),
            entrypoint: non_empty(&self.spec.command),
            cmd: non_empty(&self.spec.args),
            env: Some(env),
            labels: Some(self.labels()?),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    self.network.to_string(),
                    EndpointSettings::default(),
                )]),
            }),
            ..Default::default()
        })
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}
