//! Compute limits for a single container, clamped against what the host or
//! cluster can provide.

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};
use crate::models::ComputeSpec;

pub const DEFAULT_MAX_CPUS: f64 = 1.0;
pub const DEFAULT_MAX_MEMORY_MB: u64 = 100;
pub const DEFAULT_MIN_MEMORY_MB: u64 = 5;
pub const DEFAULT_CONTAINER_SIZE_MB: u64 = 100;

/// The container engine refuses containers with less memory than this.
pub const DOCKER_MEMORY_FLOOR_MB: u64 = 6;

/// Pods with a smaller memory limit fail to start their sandbox.
pub const KUBE_MEMORY_FLOOR_MB: u64 = 4;

/// Total resources of a host or cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpus: f64,
    pub memory_mb: u64,
    #[serde(default)]
    pub gpus: u32,
}

/// Resolved limits and requests for one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResources {
    pub min_cpus: f64,
    pub max_cpus: f64,
    pub min_memory_mb: u64,
    pub max_memory_mb: u64,
    pub gpus: u32,
    pub container_size_mb: u64,
}

impl ExecResources {
    pub fn nano_cpus(&self) -> i64 {
        (self.max_cpus * 1e9).round() as i64
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.max_memory_mb as i64) * 1000 * 1000
    }

    pub fn milli_cpus(cpus: f64) -> String {
        format!("{}m", (cpus * 1000.0).round() as i64)
    }
}

/// Fails when a declared minimum exceeds the total capacity.
pub fn check_minimums(compute: &ComputeSpec, capacity: Option<&Capacity>) -> Result<()> {
    let Some(capacity) = capacity else {
        return Ok(());
    };

    let min_cpus = compute.min_cpus.unwrap_or(0.0);
    if min_cpus > capacity.cpus {
        return Err(DeployError::InsufficientResources(format!(
            "The minimal amount of cpus of {} cannot be fulfilled as only {} cpus are available.",
            min_cpus, capacity.cpus
        )));
    }

    let min_memory = compute.min_memory_mb.unwrap_or(0);
    if min_memory > capacity.memory_mb {
        return Err(DeployError::InsufficientResources(format!(
            "The minimal amount of memory of {}MB cannot be fulfilled as only {}MB are available.",
            min_memory, capacity.memory_mb
        )));
    }

    let min_gpus = compute.min_gpus.unwrap_or(0);
    if min_gpus > capacity.gpus {
        return Err(DeployError::InsufficientResources(format!(
            "The minimal amount of gpus of {} cannot be fulfilled as only {} gpus are available.",
            min_gpus, capacity.gpus
        )));
    }
    Ok(())
}

/// Checks the minimums, then clamps the maximums to the capacity and applies
/// the memory floor.
pub fn build_exec_resources(
    compute: &ComputeSpec,
    capacity: Option<&Capacity>,
    memory_floor_mb: u64,
) -> Result<ExecResources> {
    check_minimums(compute, capacity)?;

    let mut max_cpus = compute.max_cpus.unwrap_or(DEFAULT_MAX_CPUS);
    let mut max_memory_mb = compute.max_memory_mb.unwrap_or(DEFAULT_MAX_MEMORY_MB);
    let mut gpus = compute.max_gpus.unwrap_or(0);

    if let Some(capacity) = capacity {
        max_cpus = max_cpus.min(capacity.cpus);
        max_memory_mb = max_memory_mb.min(capacity.memory_mb);
        gpus = gpus.min(capacity.gpus);
    }
    let max_memory_mb = max_memory_mb.max(memory_floor_mb);

    let min_cpus = compute.min_cpus.unwrap_or(0.0).min(max_cpus);
    let min_memory_mb = compute
        .min_memory_mb
        .unwrap_or(DEFAULT_MIN_MEMORY_MB)
        .min(max_memory_mb);

    Ok(ExecResources {
        min_cpus,
        max_cpus,
        min_memory_mb,
        max_memory_mb,
        gpus,
        container_size_mb: compute
            .max_container_size_mb
            .unwrap_or(DEFAULT_CONTAINER_SIZE_MB),
    })
}
