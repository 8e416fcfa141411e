// Cluster-scheduler adapter against a fake cluster API
mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use berth::backend::cluster::ClusterApi;
use berth::backend::{DeployRequest, KubernetesBackend, LogQuery, OrchestrationBackend, NO_LOGS_MESSAGE};
use berth::models::{DeploymentSpec, DeploymentStatus, DeploymentType};
use berth::resources::capacity::{Capacity, KUBE_MEMORY_FLOOR_MB};
use berth::resources::labels::{deployment_labels, selection_labels};
use berth::DeployError;
use common::*;

const SERVICE_ID: &str = "berth-p-demo-s-echo";

fn backend() -> KubernetesBackend<FakeCluster> {
    init_tracing();
    KubernetesBackend::new(
        FakeCluster::default(),
        "apps",
        test_settings(),
        Arc::new(FakeTokenIssuer::default()),
    )
}

fn request<'a>(id: &'a str, spec: &'a DeploymentSpec, wait: bool) -> DeployRequest<'a> {
    DeployRequest {
        deployment_id: id,
        deployment_type: DeploymentType::Service,
        spec,
        wait,
        user_id: Some("alice"),
    }
}

fn spec_with_volume() -> DeploymentSpec {
    let mut spec = echo_spec();
    spec.compute.volume_path = Some("/data".to_string());
    spec.compute.max_volume_size_mb = Some(500);
    spec
}

fn pod(name: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(deployment_labels(
                "berth",
                PROJECT,
                SERVICE_ID,
                DeploymentType::Service,
            )),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_deploy_creates_all_resources() {
    let backend = backend();
    let spec = spec_with_volume();

    let record = backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, true))
        .await
        .expect("deploy should succeed");

    assert_eq!(record.id, SERVICE_ID);
    assert_eq!(record.status, DeploymentStatus::Running);
    assert!(record.internal_id.is_some());
    assert_eq!(record.spec, spec);

    let cluster = backend.cluster();
    assert!(cluster.contains("NetworkPolicy", "berth-p-demo"));
    assert!(cluster.contains("PersistentVolumeClaim", SERVICE_ID));
    assert!(cluster.contains("Service", SERVICE_ID));
    assert!(cluster.contains("Deployment", SERVICE_ID));

    let deployment: Deployment = cluster.get(SERVICE_ID).await.unwrap().unwrap();
    let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
    let env: BTreeMap<String, String> = container
        .env
        .clone()
        .unwrap()
        .into_iter()
        .map(|var| (var.name, var.value.unwrap_or_default()))
        .collect();
    assert_eq!(env["BERTH_DEPLOYMENT_NAME"], SERVICE_ID);
    assert_eq!(env["BERTH_API_TOKEN"], format!("token-deployment-{SERVICE_ID}"));
    assert_eq!(
        env["BERTH_SERVICE_URL"],
        format!("http://localhost:30010/projects/demo/services/{SERVICE_ID}/access/8080")
    );
    assert_eq!(env["BERTH_MAX_VOLUME_SIZE_MB"], "500");
}

#[tokio::test]
async fn test_workload_failure_rolls_back_volume_and_service() {
    let backend = backend();
    backend.cluster().fail_creates_of("Deployment");
    let spec = spec_with_volume();

    let err = backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Backend { .. }), "unexpected error: {err:?}");
    let cluster = backend.cluster();
    assert!(!cluster.contains("PersistentVolumeClaim", SERVICE_ID));
    assert!(!cluster.contains("Service", SERVICE_ID));
    assert!(!cluster.contains("Deployment", SERVICE_ID));
    // The project policy is shared and stays.
    assert!(cluster.contains("NetworkPolicy", "berth-p-demo"));

    let deleted = cluster.deleted();
    assert!(deleted.contains(&("Service".to_string(), SERVICE_ID.to_string())));
    assert!(deleted.contains(&("PersistentVolumeClaim".to_string(), SERVICE_ID.to_string())));
}

#[tokio::test]
async fn test_existing_workload_is_already_exists_without_rollback() {
    let backend = backend();
    let spec = spec_with_volume();
    backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap();

    let err = backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap_err();

    assert!(err.is_already_exists(), "unexpected error: {err:?}");
    let cluster = backend.cluster();
    assert!(cluster.contains("Service", SERVICE_ID));
    assert!(cluster.contains("PersistentVolumeClaim", SERVICE_ID));
    assert!(cluster.deleted().is_empty());
}

#[tokio::test]
async fn test_network_policy_is_created_once_per_project() {
    let backend = backend();
    let echo = echo_spec();
    let web = DeploymentSpec::new("nginx", "web");

    backend
        .deploy(PROJECT, &request(SERVICE_ID, &echo, false))
        .await
        .unwrap();
    backend
        .deploy(PROJECT, &request("berth-p-demo-s-web0", &web, false))
        .await
        .unwrap();

    let policies = backend
        .cluster()
        .created()
        .into_iter()
        .filter(|(kind, _)| kind == "NetworkPolicy")
        .count();
    assert_eq!(policies, 1);
}

#[tokio::test]
async fn test_get_checks_project_labels() {
    let backend = backend();
    let spec = echo_spec();
    backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap();

    let record = backend
        .get(PROJECT, SERVICE_ID, DeploymentType::Service)
        .await
        .unwrap();
    assert_eq!(record.spec.display_name.as_deref(), Some("echo"));

    let err = backend
        .get("other", SERVICE_ID, DeploymentType::Service)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = backend
        .get(PROJECT, "berth-p-demo-s-none", DeploymentType::Service)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_list_marks_undecodable_resources_unknown() {
    let backend = backend();
    let spec = echo_spec();
    backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap();
    backend.cluster().insert(&Deployment {
        metadata: ObjectMeta {
            name: Some("berth-p-demo-s-legacy".to_string()),
            labels: Some(selection_labels("berth", PROJECT, DeploymentType::Service)),
            ..Default::default()
        },
        ..Default::default()
    });

    let records = backend.list(PROJECT, DeploymentType::Service).await.unwrap();
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["berth-p-demo-s-echo", "berth-p-demo-s-legacy"]);
    assert_eq!(records[1].status, DeploymentStatus::Unknown);

    assert!(backend.list(PROJECT, DeploymentType::Job).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_removes_resources() {
    let backend = backend();
    let spec = spec_with_volume();
    backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap();

    backend
        .delete(PROJECT, SERVICE_ID, DeploymentType::Service, false)
        .await
        .unwrap();
    let cluster = backend.cluster();
    assert!(!cluster.contains("Deployment", SERVICE_ID));
    assert!(!cluster.contains("Service", SERVICE_ID));
    assert!(cluster.contains("PersistentVolumeClaim", SERVICE_ID));

    let err = backend
        .delete(PROJECT, SERVICE_ID, DeploymentType::Service, true)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_all_removes_project_resources() {
    let backend = backend();
    let echo = spec_with_volume();
    let web = DeploymentSpec::new("nginx", "web");
    backend
        .deploy(PROJECT, &request(SERVICE_ID, &echo, false))
        .await
        .unwrap();
    backend
        .deploy(PROJECT, &request("berth-p-demo-s-web0", &web, false))
        .await
        .unwrap();

    backend
        .delete_all(PROJECT, DeploymentType::Service)
        .await
        .unwrap();

    assert!(backend.list(PROJECT, DeploymentType::Service).await.unwrap().is_empty());
    let cluster = backend.cluster();
    assert!(!cluster.contains("Service", SERVICE_ID));
    assert!(!cluster.contains("PersistentVolumeClaim", SERVICE_ID));
}

#[tokio::test]
async fn test_job_deploy_waits_for_start() {
    let backend = backend();
    let spec = DeploymentSpec::new("busybox", "batch");
    let id = "berth-p-demo-j-batch";

    let record = backend
        .deploy(
            PROJECT,
            &DeployRequest {
                deployment_id: id,
                deployment_type: DeploymentType::Job,
                spec: &spec,
                wait: true,
                user_id: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(record.deployment_type, DeploymentType::Job);
    assert_eq!(record.status, DeploymentStatus::Running);
    assert!(backend.cluster().contains("Job", id));
    assert!(!backend.cluster().contains("Deployment", id));
}

#[tokio::test]
async fn test_minimums_above_cluster_capacity_create_nothing() {
    let backend = backend();
    let mut spec = echo_spec();
    spec.compute.min_memory_mb = Some(64_000);
    spec.compute.max_memory_mb = Some(64_000);

    let err = backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::InsufficientResources(_)));
    assert!(backend.cluster().created().is_empty());
}

#[tokio::test]
async fn test_configured_capacity_overrides_nodes() {
    init_tracing();
    let mut settings = test_settings();
    settings.kubernetes.capacity = Some(Capacity {
        cpus: 2.0,
        memory_mb: 1000,
        gpus: 2,
    });
    let backend = KubernetesBackend::new(
        FakeCluster::default(),
        "apps",
        settings,
        Arc::new(FakeTokenIssuer::default()),
    );

    assert_eq!(backend.capacity().await.unwrap().gpus, 2);
    let mut spec = echo_spec();
    spec.compute.min_cpus = Some(4.0);
    spec.compute.max_cpus = Some(4.0);
    assert!(backend.check_capacity(&spec).await.is_err());
}

#[tokio::test]
async fn test_logs_without_pods_is_not_found() {
    let backend = backend();
    let err = backend
        .logs(PROJECT, SERVICE_ID, DeploymentType::Service, &LogQuery::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_logs_of_running_pod() {
    let backend = backend();
    backend.cluster().insert(&pod("echo-1", "Running"));
    backend.cluster().set_logs("echo-1", "listening on :8080\n");

    let logs = backend
        .logs(
            PROJECT,
            SERVICE_ID,
            DeploymentType::Service,
            &LogQuery {
                tail_lines: Some(10),
                since: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(logs, "listening on :8080\n");
}

#[tokio::test]
async fn test_logs_read_failure_returns_sentinel() {
    let backend = backend();
    backend.cluster().insert(&pod("echo-1", "Running"));

    let logs = backend
        .logs(PROJECT, SERVICE_ID, DeploymentType::Service, &LogQuery::default())
        .await
        .unwrap();
    assert_eq!(logs, NO_LOGS_MESSAGE);
}

#[tokio::test(start_paused = true)]
async fn test_logs_of_pending_pod_time_out_to_sentinel() {
    let backend = backend();
    backend.cluster().insert(&pod("echo-1", "Pending"));
    backend.cluster().set_logs("echo-1", "never read");

    let logs = backend
        .logs(PROJECT, SERVICE_ID, DeploymentType::Service, &LogQuery::default())
        .await
        .unwrap();
    assert_eq!(logs, NO_LOGS_MESSAGE);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_leaves_workload_in_place() {
    let backend = backend();
    backend.cluster().hold_rollouts();
    let spec = spec_with_volume();

    let err = backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, true))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Timeout(_)), "unexpected error: {err:?}");
    let cluster = backend.cluster();
    assert!(cluster.contains("Deployment", SERVICE_ID));
    assert!(cluster.contains("Service", SERVICE_ID));
    assert!(cluster.contains("PersistentVolumeClaim", SERVICE_ID));
    assert!(cluster.deleted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deletion_timeout_is_reported() {
    let backend = backend();
    let spec = echo_spec();
    backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap();
    backend.cluster().linger_deletes_of("Deployment");

    let err = backend
        .delete(PROJECT, SERVICE_ID, DeploymentType::Service, false)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Timeout(_)), "unexpected error: {err:?}");
    assert!(!backend.cluster().contains("Service", SERVICE_ID));
    assert_eq!(
        backend
            .get(PROJECT, SERVICE_ID, DeploymentType::Service)
            .await
            .unwrap()
            .status,
        DeploymentStatus::Terminating
    );
}

#[tokio::test]
async fn test_untranslatable_workload_is_rolled_back() {
    let backend = backend();
    backend.cluster().strip_annotations_of("Deployment");
    let spec = spec_with_volume();

    let err = backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Validation(_)), "unexpected error: {err:?}");
    let cluster = backend.cluster();
    assert!(!cluster.contains("Deployment", SERVICE_ID));
    assert!(!cluster.contains("Service", SERVICE_ID));
    assert!(!cluster.contains("PersistentVolumeClaim", SERVICE_ID));
    let deleted = cluster.deleted();
    assert!(deleted.contains(&("Deployment".to_string(), SERVICE_ID.to_string())));
    assert!(deleted.contains(&("Service".to_string(), SERVICE_ID.to_string())));
}

#[tokio::test]
async fn test_memory_limit_has_a_floor() {
    let backend = backend();
    let mut spec = echo_spec();
    spec.compute.min_memory_mb = Some(1);
    spec.compute.max_memory_mb = Some(1);

    backend
        .deploy(PROJECT, &request(SERVICE_ID, &spec, false))
        .await
        .unwrap();

    let deployment: Deployment = backend.cluster().get(SERVICE_ID).await.unwrap().unwrap();
    let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
    let resources = container.resources.clone().unwrap();
    assert_eq!(
        resources.limits.unwrap()["memory"].0,
        format!("{KUBE_MEMORY_FLOOR_MB}M")
    );
    assert_eq!(resources.requests.unwrap()["memory"].0, "1M");
}
