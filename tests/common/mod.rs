// Shared fakes and helpers for the integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use berth::auth::{AllowAllImages, Permission, TokenIssuer};
use berth::backend::cluster::{ClusterApi, ClusterResource};
use berth::backend::{DeployRequest, LogQuery, OrchestrationBackend};
use berth::config::Timeouts;
use berth::models::{DeploymentRecord, DeploymentSpec, DeploymentStatus, DeploymentType};
use berth::resources::capacity::Capacity;
use berth::storage::{DocumentStore, JsonDocument, SqliteDocumentStore};
use berth::{DeployError, DeploymentManager, Result, Settings, Storage};

pub const PROJECT: &str = "demo";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_settings() -> Settings {
    Settings {
        base_url: "http://localhost:30010".to_string(),
        api_endpoint: "http://localhost:30010/api".to_string(),
        timeouts: Timeouts {
            poll_interval_secs: 1,
            ready_secs: 10,
            delete_secs: 10,
            restart_secs: 10,
            logs_secs: 5,
        },
        ..Default::default()
    }
}

pub fn echo_spec() -> DeploymentSpec {
    let mut spec = DeploymentSpec::new("hashicorp/http-echo", "echo");
    spec.endpoints = vec!["8080".to_string()];
    spec
}

pub fn host_capacity() -> Capacity {
    Capacity {
        cpus: 4.0,
        memory_mb: 8000,
        gpus: 0,
    }
}

#[derive(Default)]
pub struct FakeTokenIssuer {
    pub issued: Mutex<Vec<(Vec<String>, String)>>,
}

#[async_trait]
impl TokenIssuer for FakeTokenIssuer {
    async fn issue_token(&self, scopes: &[Permission], purpose: &str) -> Result<String> {
        let scopes = scopes.iter().map(|s| s.to_string()).collect();
        self.issued
            .lock()
            .unwrap()
            .push((scopes, purpose.to_string()));
        Ok(format!("token-{purpose}"))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallCounts {
    pub list: usize,
    pub deploy: usize,
    pub get: usize,
    pub delete: usize,
    pub delete_all: usize,
    pub logs: usize,
    /// Deletes that also removed volumes.
    pub volume_deletes: usize,
}

impl CallCounts {
    /// Calls that change live state.
    pub fn mutations(&self) -> usize {
        self.deploy + self.delete + self.delete_all
    }
}

#[derive(Default)]
struct BackendState {
    live: BTreeMap<String, (String, DeploymentRecord)>,
    calls: CallCounts,
    fail_deploy: bool,
    linger_deletes: bool,
}

/// In-memory backend. Deployments become live immediately and deletions
/// take effect at once.
pub struct FakeBackend {
    state: Mutex<BackendState>,
    capacity: Option<Capacity>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::with_capacity(Some(host_capacity()))
    }

    pub fn with_capacity(capacity: Option<Capacity>) -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            capacity,
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_deploys(&self, fail: bool) {
        self.state.lock().unwrap().fail_deploy = fail;
    }

    /// Deletes succeed but the live resource stays visible.
    pub fn linger_deletes(&self, linger: bool) {
        self.state.lock().unwrap().linger_deletes = linger;
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().live.keys().cloned().collect()
    }

    /// Adds a live resource created outside the reconciliation layer.
    pub fn insert_live(&self, project_id: &str, record: DeploymentRecord) {
        self.state
            .lock()
            .unwrap()
            .live
            .insert(record.id.clone(), (project_id.to_string(), record));
    }

    pub fn set_live_status(&self, id: &str, status: DeploymentStatus) {
        if let Some((_, record)) = self.state.lock().unwrap().live.get_mut(id) {
            record.status = status;
        }
    }

    fn not_found(id: &str) -> DeployError {
        DeployError::not_found(format!("No live deployment '{id}'."))
    }
}

#[async_trait]
impl OrchestrationBackend for FakeBackend {
    async fn list(
        &self,
        project_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<Vec<DeploymentRecord>> {
        let mut state = self.state.lock().unwrap();
        state.calls.list += 1;
        Ok(state
            .live
            .values()
            .filter(|(project, record)| {
                project == project_id
                    && record.deployment_type.is_job() == deployment_type.is_job()
            })
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn deploy(
        &self,
        project_id: &str,
        request: &DeployRequest<'_>,
    ) -> Result<DeploymentRecord> {
        let mut state = self.state.lock().unwrap();
        state.calls.deploy += 1;
        if state.fail_deploy {
            return Err(DeployError::backend_msg(format!(
                "Could not deploy '{}'.",
                request.deployment_id
            )));
        }
        if state.live.contains_key(request.deployment_id) {
            return Err(DeployError::AlreadyExists(format!(
                "'{}' already exists.",
                request.deployment_id
            )));
        }

        let mut record = DeploymentRecord::new(
            request.deployment_id,
            request.deployment_type,
            request.spec.clone(),
        );
        record.internal_id = Some(uuid::Uuid::new_v4().to_string());
        record.status = if request.wait {
            DeploymentStatus::Running
        } else {
            DeploymentStatus::Pending
        };
        record.started_at = Some(Utc::now());
        state.live.insert(
            record.id.clone(),
            (project_id.to_string(), record.clone()),
        );
        Ok(record)
    }

    async fn get(
        &self,
        project_id: &str,
        deployment_id: &str,
        _deployment_type: DeploymentType,
    ) -> Result<DeploymentRecord> {
        let mut state = self.state.lock().unwrap();
        state.calls.get += 1;
        match state.live.get(deployment_id) {
            Some((project, record)) if project == project_id => Ok(record.clone()),
            _ => Err(Self::not_found(deployment_id)),
        }
    }

    async fn delete(
        &self,
        project_id: &str,
        deployment_id: &str,
        _deployment_type: DeploymentType,
        delete_volumes: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.delete += 1;
        if delete_volumes {
            state.calls.volume_deletes += 1;
        }
        let owned = matches!(state.live.get(deployment_id), Some((project, _)) if project == project_id);
        if !owned {
            return Err(Self::not_found(deployment_id));
        }
        if !state.linger_deletes {
            state.live.remove(deployment_id);
        }
        Ok(())
    }

    async fn delete_all(&self, project_id: &str, deployment_type: DeploymentType) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.delete_all += 1;
        state.live.retain(|_, (project, record)| {
            project.as_str() != project_id || record.deployment_type.is_job() != deployment_type.is_job()
        });
        Ok(())
    }

    async fn logs(
        &self,
        project_id: &str,
        deployment_id: &str,
        _deployment_type: DeploymentType,
        _query: &LogQuery,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.logs += 1;
        match state.live.get(deployment_id) {
            Some((project, _)) if project == project_id => Ok("listening on :8080\n".to_string()),
            _ => Err(Self::not_found(deployment_id)),
        }
    }

    async fn capacity(&self) -> Option<Capacity> {
        self.capacity
    }
}

/// Document store that can be told to reject writes.
pub struct FlakyDocumentStore {
    inner: SqliteDocumentStore,
    fail_creates: AtomicBool,
}

impl FlakyDocumentStore {
    pub fn new(inner: SqliteDocumentStore) -> Self {
        Self {
            inner,
            fail_creates: AtomicBool::new(false),
        }
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for FlakyDocumentStore {
    async fn create_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
        value: &Value,
        upsert: bool,
    ) -> Result<JsonDocument> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(DeployError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner
            .create_document(project_id, collection_id, key, value, upsert)
            .await
    }

    async fn get_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
    ) -> Result<JsonDocument> {
        self.inner.get_document(project_id, collection_id, key).await
    }

    async fn update_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
        patch: &Value,
    ) -> Result<JsonDocument> {
        self.inner
            .update_document(project_id, collection_id, key, patch)
            .await
    }

    async fn delete_document(&self, project_id: &str, collection_id: &str, key: &str) -> Result<()> {
        self.inner.delete_document(project_id, collection_id, key).await
    }

    async fn list_documents(
        &self,
        project_id: &str,
        collection_id: &str,
        filter: Option<&Value>,
        keys: Option<&[String]>,
    ) -> Result<Vec<JsonDocument>> {
        self.inner
            .list_documents(project_id, collection_id, filter, keys)
            .await
    }

    async fn delete_collection(&self, project_id: &str, collection_id: &str) -> Result<()> {
        self.inner.delete_collection(project_id, collection_id).await
    }
}

pub struct Harness {
    pub manager: DeploymentManager,
    pub backend: Arc<FakeBackend>,
    pub documents: Arc<FlakyDocumentStore>,
}

pub async fn harness() -> Harness {
    harness_with(FakeBackend::new()).await
}

pub async fn harness_with(backend: FakeBackend) -> Harness {
    harness_with_settings(backend, test_settings()).await
}

pub async fn harness_with_settings(backend: FakeBackend, settings: Settings) -> Harness {
    init_tracing();
    let storage = Storage::in_memory()
        .await
        .expect("in-memory database should open");
    let backend = Arc::new(backend);
    let documents = Arc::new(FlakyDocumentStore::new(storage.documents()));
    let manager = DeploymentManager::new(
        backend.clone(),
        documents.clone(),
        Arc::new(AllowAllImages),
        settings,
    );
    Harness {
        manager,
        backend,
        documents,
    }
}

/// Persisted record as stored, without the live overlay.
pub async fn stored_record(harness: &Harness, id: &str) -> Option<DeploymentRecord> {
    let settings = test_settings();
    harness
        .documents
        .get_document(
            &settings.internal_project,
            &berth::manager::collection_id(PROJECT, DeploymentType::Service),
            id,
        )
        .await
        .ok()
        .map(|doc| serde_json::from_value(doc.json_value).expect("stored record should decode"))
}

fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("fake cluster: {reason}"),
        reason: reason.to_string(),
        code,
    })
}

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<(String, String), Value>,
    failing_kinds: HashSet<String>,
    lingering_kinds: HashSet<String>,
    stripped_kinds: HashSet<String>,
    unready: bool,
    created: Vec<(String, String)>,
    deleted: Vec<(String, String)>,
    logs: BTreeMap<String, String>,
}

/// Namespaced object store standing in for the cluster API. Created
/// workloads report themselves as fully ready.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

fn kind_of<K: ClusterResource>() -> String {
    <K as kube::Resource>::kind(&()).to_string()
}

fn matches_selector(object: &Value, selector: &str) -> bool {
    let labels = &object["metadata"]["labels"];
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).and_then(Value::as_str) == Some(value),
            None => false,
        })
}

impl FakeCluster {
    pub fn fail_creates_of(&self, kind: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_kinds
            .insert(kind.to_string());
    }

    /// Deletes of `kind` succeed but the object only gets a deletion
    /// timestamp and never goes away.
    pub fn linger_deletes_of(&self, kind: &str) {
        self.state
            .lock()
            .unwrap()
            .lingering_kinds
            .insert(kind.to_string());
    }

    /// Objects of `kind` are stored without their annotations.
    pub fn strip_annotations_of(&self, kind: &str) {
        self.state
            .lock()
            .unwrap()
            .stripped_kinds
            .insert(kind.to_string());
    }

    /// Created deployments never report available replicas.
    pub fn hold_rollouts(&self) {
        self.state.lock().unwrap().unready = true;
    }

    pub fn contains(&self, kind: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .objects
            .contains_key(&(kind.to_string(), name.to_string()))
    }

    pub fn created(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn deleted(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn set_logs(&self, pod: &str, logs: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(pod.to_string(), logs.to_string());
    }

    /// Stores an object as is, bypassing create.
    pub fn insert<K: ClusterResource>(&self, object: &K) {
        let value = serde_json::to_value(object).expect("object should serialize");
        let name = value["metadata"]["name"]
            .as_str()
            .expect("object should have a name")
            .to_string();
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((kind_of::<K>(), name), value);
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get<K: ClusterResource>(&self, name: &str) -> std::result::Result<Option<K>, kube::Error> {
        let state = self.state.lock().unwrap();
        match state.objects.get(&(kind_of::<K>(), name.to_string())) {
            Some(value) => Ok(Some(
                serde_json::from_value(value.clone()).map_err(kube::Error::SerdeError)?,
            )),
            None => Ok(None),
        }
    }

    async fn list<K: ClusterResource>(&self, selector: &str) -> std::result::Result<Vec<K>, kube::Error> {
        let kind = kind_of::<K>();
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((k, _), value)| *k == kind && matches_selector(value, selector))
            .map(|(_, value)| serde_json::from_value(value.clone()).map_err(kube::Error::SerdeError))
            .collect()
    }

    async fn create<K: ClusterResource>(&self, object: &K) -> std::result::Result<K, kube::Error> {
        let kind = kind_of::<K>();
        let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
        let name = value["metadata"]["name"].as_str().unwrap_or_default().to_string();

        let mut state = self.state.lock().unwrap();
        if state.failing_kinds.contains(&kind) {
            return Err(api_error(500, "InternalError"));
        }
        let key = (kind.clone(), name);
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }

        if state.stripped_kinds.contains(&kind) {
            if let Some(metadata) = value["metadata"].as_object_mut() {
                metadata.remove("annotations");
            }
        }
        value["metadata"]["uid"] = json!(uuid::Uuid::new_v4().to_string());
        value["metadata"]["creationTimestamp"] = json!(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        match kind.as_str() {
            "Deployment" => {
                let replicas = value["spec"]["replicas"].as_i64().unwrap_or(1);
                let ready = if state.unready { 0 } else { replicas };
                value["metadata"]["generation"] = json!(1);
                value["status"] = json!({
                    "replicas": replicas,
                    "updatedReplicas": ready,
                    "availableReplicas": ready,
                    "readyReplicas": ready,
                    "observedGeneration": 1,
                });
            }
            "Job" => {
                value["status"] = json!({ "active": 1 });
            }
            _ => {}
        }

        state.created.push(key.clone());
        state.objects.insert(key, value.clone());
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }

    async fn delete<K: ClusterResource>(&self, name: &str) -> std::result::Result<(), kube::Error> {
        let kind = kind_of::<K>();
        let key = (kind.clone(), name.to_string());
        let mut state = self.state.lock().unwrap();
        if state.lingering_kinds.contains(&kind) {
            let Some(value) = state.objects.get_mut(&key) else {
                return Err(api_error(404, "NotFound"));
            };
            value["metadata"]["deletionTimestamp"] =
                json!(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
            state.deleted.push(key);
            return Ok(());
        }
        match state.objects.remove(&key) {
            Some(_) => {
                state.deleted.push(key);
                Ok(())
            }
            None => Err(api_error(404, "NotFound")),
        }
    }

    async fn delete_collection<K: ClusterResource>(
        &self,
        selector: &str,
    ) -> std::result::Result<(), kube::Error> {
        let kind = kind_of::<K>();
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<(String, String)> = state
            .objects
            .iter()
            .filter(|((k, _), value)| *k == kind && matches_selector(value, selector))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            state.objects.remove(&key);
            state.deleted.push(key);
        }
        Ok(())
    }

    async fn pod_logs(
        &self,
        pod: &str,
        _tail_lines: Option<i64>,
        _since_seconds: Option<i64>,
    ) -> std::result::Result<String, kube::Error> {
        let state = self.state.lock().unwrap();
        state
            .logs
            .get(pod)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn node_capacity(&self) -> std::result::Result<Capacity, kube::Error> {
        Ok(Capacity {
            cpus: 8.0,
            memory_mb: 16_000,
            gpus: 0,
        })
    }
}
