//! Cluster-scheduler resource definitions built from a deployment spec.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec as KubeDeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::error::Result;
use crate::models::{DeploymentSpec, DeploymentType};
use crate::resources::capacity::ExecResources;
use crate::resources::endpoints::parse_endpoints;
use crate::resources::environment::DeploymentIdentity;
use crate::resources::ids::project_resource_prefix;
use crate::resources::labels::{deployment_labels, encode_spec, project_labels, Label};

pub const GPU_RESOURCE: &str = "nvidia.com/gpu";
const VOLUME_NAME: &str = "data";
const DEFAULT_PORT: i32 = 80;

/// Everything needed to render the resources of one deployment.
pub struct KubeWorkload<'a> {
    pub system_namespace: &'a str,
    pub namespace: &'a str,
    pub identity: &'a DeploymentIdentity,
    pub spec: &'a DeploymentSpec,
    pub environment: &'a BTreeMap<String, String>,
    pub resources: &'a ExecResources,
    pub min_ready_seconds: i32,
}

impl KubeWorkload<'_> {
    fn labels(&self) -> BTreeMap<String, String> {
        deployment_labels(
            self.system_namespace,
            &self.identity.project_id,
            &self.identity.deployment_id,
            self.identity.deployment_type,
        )
    }

    /// Selection labels go to labels, the encoded spec to annotations.
    fn metadata(&self) -> Result<ObjectMeta> {
        let annotations = encode_spec(
            self.system_namespace,
            self.identity.deployment_type,
            self.spec,
            self.identity.user_id.as_deref(),
        )?;
        Ok(ObjectMeta {
            name: Some(self.identity.deployment_id.clone()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(self.labels()),
            annotations: Some(annotations),
            ..Default::default()
        })
    }

    fn resource_requirements(&self) -> ResourceRequirements {
        let r = self.resources;
        let mut limits = BTreeMap::from([
            ("cpu".to_string(), Quantity(ExecResources::milli_cpus(r.max_cpus))),
            ("memory".to_string(), Quantity(format!("{}M", r.max_memory_mb))),
            (
                "ephemeral-storage".to_string(),
                Quantity(format!("{}M", r.container_size_mb)),
            ),
        ]);
        if r.gpus > 0 {
            limits.insert(GPU_RESOURCE.to_string(), Quantity(r.gpus.to_string()));
        }
        let requests = BTreeMap::from([
            ("cpu".to_string(), Quantity(ExecResources::milli_cpus(r.min_cpus))),
            ("memory".to_string(), Quantity(format!("{}M", r.min_memory_mb))),
        ]);
        ResourceRequirements {
            limits: Some(limits),
            requests: Some(requests),
            ..Default::default()
        }
    }

    fn pod_template(&self, restart_policy: Option<&str>) -> PodTemplateSpec {
        let volume_path = self.spec.compute.volume();
        let container = Container {
            name: "main".to_string(),
            image: Some(self.spec.container_image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: non_empty(&self.spec.command),
            args: non_empty(&self.spec.args),
            env: Some(
                self.environment
                    .iter()
                    .map(|(name, value)| EnvVar {
                        name: name.clone(),
                        value: Some(value.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources: Some(self.resource_requirements()),
            volume_mounts: volume_path.map(|path| {
                vec![VolumeMount {
                    name: VOLUME_NAME.to_string(),
                    mount_path: path.to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        };

        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(self.labels()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                restart_policy: restart_policy.map(str::to_string),
                volumes: volume_path.map(|_| {
                    vec![Volume {
                        name: VOLUME_NAME.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: self.identity.deployment_id.clone(),
                            read_only: None,
                        }),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
        }
    }

    pub fn deployment(&self) -> Result<Deployment> {
        Ok(Deployment {
            metadata: self.metadata()?,
            spec: Some(KubeDeploymentSpec {
                replicas: Some(self.spec.compute.replicas() as i32),
                min_ready_seconds: Some(self.min_ready_seconds),
                selector: LabelSelector {
                    match_labels: Some(self.labels()),
                    ..Default::default()
                },
                template: self.pod_template(None),
                ..Default::default()
            }),
            status: None,
        })
    }

    pub fn job(&self) -> Result<Job> {
        Ok(Job {
            metadata: self.metadata()?,
            spec: Some(JobSpec {
                template: self.pod_template(Some("OnFailure")),
                ..Default::default()
            }),
            status: None,
        })
    }

    /// Network endpoint for the declared ports, or the default port when
    /// none are declared.
    pub fn service(&self) -> Result<Service> {
        let mut ports: Vec<ServicePort> = parse_endpoints(&self.spec.endpoints)?
            .into_iter()
            .map(|endpoint| ServicePort {
                name: Some(format!("port-{}", endpoint.port)),
                port: i32::from(endpoint.port),
                target_port: Some(IntOrString::Int(i32::from(endpoint.port))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();
        if ports.is_empty() {
            ports.push(ServicePort {
                name: Some("default".to_string()),
                port: DEFAULT_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }

        Ok(Service {
            metadata: ObjectMeta {
                name: Some(self.identity.deployment_id.clone()),
                namespace: Some(self.namespace.to_string()),
                labels: Some(self.labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.labels()),
                ports: Some(ports),
                ..Default::default()
            }),
            status: None,
        })
    }

    pub fn volume_claim(&self, storage_class: &str, default_size_mb: u64) -> Option<PersistentVolumeClaim> {
        self.spec.compute.volume()?;
        let size = self
            .spec
            .compute
            .max_volume_size_mb
            .filter(|size| *size > 0)
            .unwrap_or(default_size_mb);

        Some(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.identity.deployment_id.clone()),
                namespace: Some(self.namespace.to_string()),
                labels: Some(self.labels()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(storage_class.to_string()),
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(format!("{size}M")),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        })
    }
}

/// Name of the project's isolation policy.
pub fn network_policy_name(system_namespace: &str, project_id: &str) -> String {
    project_resource_prefix(system_namespace, project_id)
}

/// Ingress allow-list: pods of the same project and core backend pods.
pub fn network_policy(system_namespace: &str, namespace: &str, project_id: &str) -> NetworkPolicy {
    let project_selector = LabelSelector {
        match_labels: Some(project_labels(system_namespace, project_id)),
        ..Default::default()
    };
    let backend_selector = LabelSelector {
        match_labels: Some(BTreeMap::from([
            (
                Label::Namespace.key(system_namespace),
                system_namespace.to_string(),
            ),
            (
                Label::DeploymentType.key(system_namespace),
                DeploymentType::CoreBackend.to_string(),
            ),
        ])),
        ..Default::default()
    };

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(network_policy_name(system_namespace, project_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(project_labels(system_namespace, project_id)),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: project_selector.clone(),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![
                    NetworkPolicyPeer {
                        pod_selector: Some(project_selector),
                        ..Default::default()
                    },
                    NetworkPolicyPeer {
                        pod_selector: Some(backend_selector),
                        ..Default::default()
                    },
                ]),
                ports: None,
            }]),
            egress: None,
        }),
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}
