//! Settings for the deployment core.
//!
//! Values are layered: built-in defaults, then `berth.toml` in the working
//! directory, then environment variables prefixed with `BERTH_` where `__`
//! separates nested keys (e.g. `BERTH_TIMEOUTS__READY_SECS=120`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};
use crate::resources::capacity::Capacity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Prefix for resource names and value of the namespace label.
    #[serde(default = "default_system_namespace")]
    pub system_namespace: String,

    /// Project under which deployment records are persisted.
    #[serde(default = "default_internal_project")]
    pub internal_project: String,

    /// Externally reachable base URL, used for access URLs.
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub api_endpoint: String,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub docker: DockerSettings,

    #[serde(default)]
    pub kubernetes: KubernetesSettings,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub database: DatabaseSettings,
}

fn default_system_namespace() -> String {
    "berth".to_string()
}

fn default_internal_project() -> String {
    "berth-internal".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system_namespace: default_system_namespace(),
            internal_project: default_internal_project(),
            base_url: String::new(),
            api_endpoint: String::new(),
            backend: BackendKind::default(),
            docker: DockerSettings::default(),
            kubernetes: KubernetesSettings::default(),
            timeouts: Timeouts::default(),
            database: DatabaseSettings::default(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::figment(Path::new("berth.toml"))
            .extract()
            .map_err(|e| DeployError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| DeployError::Config(e.to_string()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BERTH_").split("__"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Docker,
    Kubernetes,
}

/// What to do when the orchestrator's own container cannot be attached to a
/// project network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAttachPolicy {
    /// Attach failures abort the deployment.
    Required,
    /// Attach failures are logged and the deployment continues.
    #[default]
    BestEffort,
    /// Never attach.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    /// When set, volumes become bind mounts below this host directory.
    #[serde(default)]
    pub host_data_root: Option<PathBuf>,

    /// Name of the container this process runs in, if any.
    #[serde(default)]
    pub self_container: Option<String>,

    #[serde(default)]
    pub network_attach: NetworkAttachPolicy,

    /// Range project networks are carved from. The first block is reserved.
    #[serde(default = "default_subnet_pool")]
    pub subnet_pool: Ipv4Net,

    #[serde(default = "default_subnet_prefix")]
    pub subnet_prefix: u8,

    #[serde(default = "default_restart_retries")]
    pub restart_retries: i64,

    /// Number of GPUs on the host. Zero disables GPU device requests.
    #[serde(default)]
    pub gpu_count: u32,
}

fn default_subnet_pool() -> Ipv4Net {
    Ipv4Net::new(std::net::Ipv4Addr::new(10, 0, 0, 0), 8).unwrap_or_default()
}

const fn default_subnet_prefix() -> u8 {
    24
}

const fn default_restart_retries() -> i64 {
    10
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            host_data_root: None,
            self_container: None,
            network_attach: NetworkAttachPolicy::default(),
            subnet_pool: default_subnet_pool(),
            subnet_prefix: default_subnet_prefix(),
            restart_retries: default_restart_retries(),
            gpu_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesSettings {
    /// Namespace for all resources. Detected from the service account when unset.
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_storage_class")]
    pub storage_class: String,

    #[serde(default = "default_volume_size_mb")]
    pub default_volume_size_mb: u64,

    #[serde(default = "default_min_ready_seconds")]
    pub min_ready_seconds: i32,

    /// Overrides the capacity summed from node allocatable resources.
    #[serde(default)]
    pub capacity: Option<Capacity>,
}

fn default_storage_class() -> String {
    "standard".to_string()
}

const fn default_volume_size_mb() -> u64 {
    100
}

const fn default_min_ready_seconds() -> i32 {
    5
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            storage_class: default_storage_class(),
            default_volume_size_mb: default_volume_size_mb(),
            min_ready_seconds: default_min_ready_seconds(),
            capacity: None,
        }
    }
}

/// Poll and timeout budgets, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_ready_secs")]
    pub ready_secs: u64,
    #[serde(default = "default_delete_secs")]
    pub delete_secs: u64,
    #[serde(default = "default_restart_secs")]
    pub restart_secs: u64,
    #[serde(default = "default_logs_secs")]
    pub logs_secs: u64,
}

const fn default_poll_interval_secs() -> u64 {
    2
}

const fn default_ready_secs() -> u64 {
    60
}

const fn default_delete_secs() -> u64 {
    60
}

const fn default_restart_secs() -> u64 {
    120
}

const fn default_logs_secs() -> u64 {
    60
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            ready_secs: default_ready_secs(),
            delete_secs: default_delete_secs(),
            restart_secs: default_restart_secs(),
            logs_secs: default_logs_secs(),
        }
    }
}

impl Timeouts {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_secs)
    }

    pub fn delete(&self) -> Duration {
        Duration::from_secs(self.delete_secs)
    }

    pub fn restart(&self) -> Duration {
        Duration::from_secs(self.restart_secs)
    }

    pub fn logs(&self) -> Duration {
        Duration::from_secs(self.logs_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite:berth.db?mode=rwc".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}
