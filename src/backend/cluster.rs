//! Narrow view of the cluster API used by the scheduler adapter.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DeployError, Result};
use crate::resources::capacity::Capacity;
use crate::resources::kube::GPU_RESOURCE;

/// Namespaced typed resources the adapter creates and reads.
pub trait ClusterResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// All calls are scoped to one namespace. Errors keep the raw API error so
/// that callers can tell conflicts and missing objects apart.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get<K: ClusterResource>(&self, name: &str) -> Result<Option<K>, kube::Error>;

    async fn list<K: ClusterResource>(&self, selector: &str) -> Result<Vec<K>, kube::Error>;

    async fn create<K: ClusterResource>(&self, object: &K) -> Result<K, kube::Error>;

    /// Foreground deletion.
    async fn delete<K: ClusterResource>(&self, name: &str) -> Result<(), kube::Error>;

    async fn delete_collection<K: ClusterResource>(&self, selector: &str)
        -> Result<(), kube::Error>;

    async fn pod_logs(
        &self,
        pod: &str,
        tail_lines: Option<i64>,
        since_seconds: Option<i64>,
    ) -> Result<String, kube::Error>;

    /// Sum of allocatable resources over all nodes.
    async fn node_capacity(&self) -> Result<Capacity, kube::Error>;
}

#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    namespace: String,
}

impl KubeClusterApi {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Uses the in-cluster or kubeconfig credentials. Without an explicit
    /// namespace the client's default namespace is used.
    pub async fn connect(namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| DeployError::backend("Could not connect to the cluster.", e))?;
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| client.default_namespace().to_string());
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api<K: ClusterResource>(&self) -> Api<K> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get<K: ClusterResource>(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.api::<K>().get_opt(name).await
    }

    async fn list<K: ClusterResource>(&self, selector: &str) -> Result<Vec<K>, kube::Error> {
        let params = ListParams::default().labels(selector);
        Ok(self.api::<K>().list(&params).await?.items)
    }

    async fn create<K: ClusterResource>(&self, object: &K) -> Result<K, kube::Error> {
        self.api::<K>().create(&PostParams::default(), object).await
    }

    async fn delete<K: ClusterResource>(&self, name: &str) -> Result<(), kube::Error> {
        self.api::<K>()
            .delete(name, &DeleteParams::foreground())
            .await
            .map(|_| ())
    }

    async fn delete_collection<K: ClusterResource>(
        &self,
        selector: &str,
    ) -> Result<(), kube::Error> {
        let params = ListParams::default().labels(selector);
        self.api::<K>()
            .delete_collection(&DeleteParams::foreground(), &params)
            .await
            .map(|_| ())
    }

    async fn pod_logs(
        &self,
        pod: &str,
        tail_lines: Option<i64>,
        since_seconds: Option<i64>,
    ) -> Result<String, kube::Error> {
        let params = LogParams {
            tail_lines,
            since_seconds,
            ..Default::default()
        };
        self.api::<Pod>().logs(pod, &params).await
    }

    async fn node_capacity(&self) -> Result<Capacity, kube::Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;

        let mut capacity = Capacity {
            cpus: 0.0,
            memory_mb: 0,
            gpus: 0,
        };
        for node in list.items {
            let Some(allocatable) = node.status.and_then(|s| s.allocatable) else {
                continue;
            };
            if let Some(cpu) = allocatable.get("cpu") {
                capacity.cpus += parse_cpu(cpu).unwrap_or(0.0);
            }
            if let Some(memory) = allocatable.get("memory") {
                capacity.memory_mb += parse_memory_mb(memory).unwrap_or(0);
            }
            if let Some(gpus) = allocatable.get(GPU_RESOURCE) {
                capacity.gpus += gpus.0.parse::<u32>().unwrap_or(0);
            }
        }
        Ok(capacity)
    }
}

/// `"4"`, `"3500m"` or `"0.5"` to cores.
pub fn parse_cpu(quantity: &Quantity) -> Option<f64> {
    let raw = quantity.0.trim();
    match raw.strip_suffix('m') {
        Some(milli) => milli.parse::<f64>().ok().map(|m| m / 1000.0),
        None => raw.parse::<f64>().ok(),
    }
}

/// Memory quantities (`"16374624Ki"`, `"2Gi"`, `"500M"`, plain bytes) to
/// megabytes.
pub fn parse_memory_mb(quantity: &Quantity) -> Option<u64> {
    const SUFFIXES: [(&str, f64); 10] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ];

    let raw = quantity.0.trim();
    let bytes = SUFFIXES
        .iter()
        .find_map(|(suffix, factor)| {
            raw.strip_suffix(suffix)
                .and_then(|n| n.parse::<f64>().ok())
                .map(|n| n * factor)
        })
        .or_else(|| raw.parse::<f64>().ok())?;

    Some((bytes / 1e6) as u64)
}
