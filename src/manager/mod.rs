//! Reconciliation layer.
//!
//! Wraps an [`OrchestrationBackend`] and keeps the desired state of every
//! deployment in a [`DocumentStore`]. Reads merge both sides, writes touch
//! the backend first and compensate when persisting fails.

pub mod actions;
pub mod merge;

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::auth::{ImagePolicy, TokenIssuer};
use crate::backend::{self, DeployRequest, LogQuery, OrchestrationBackend};
use crate::config::Settings;
use crate::error::{DeployError, Result};
use crate::models::{
    ActionInstruction, ActionOutcome, DeploymentAction, DeploymentRecord, DeploymentSpec,
    DeploymentType, ResourceAction,
};
use crate::resources::environment::access_url;
use crate::resources::ids::deployment_id;
use crate::resources::image::split_image_name_and_tag;
use crate::storage::{DocumentStore, Storage};
use crate::wait::poll_until;

use self::actions::{access_endpoint, available_actions, ensure_allowed};
use self::merge::{merge_records, overlay};

/// Collection holding the records of one project and deployment type.
pub fn collection_id(project_id: &str, deployment_type: DeploymentType) -> String {
    if deployment_type.is_job() {
        format!("project_{project_id}_job_metadata")
    } else {
        format!("project_{project_id}_service_metadata")
    }
}

pub struct DeploymentManager {
    backend: Arc<dyn OrchestrationBackend>,
    documents: Arc<dyn DocumentStore>,
    images: Arc<dyn ImagePolicy>,
    settings: Settings,
}

impl DeploymentManager {
    pub fn new(
        backend: Arc<dyn OrchestrationBackend>,
        documents: Arc<dyn DocumentStore>,
        images: Arc<dyn ImagePolicy>,
        settings: Settings,
    ) -> Self {
        Self {
            backend,
            documents,
            images,
            settings,
        }
    }

    /// Opens the configured database and connects to the configured backend.
    pub async fn from_settings(
        settings: Settings,
        tokens: Arc<dyn TokenIssuer>,
        images: Arc<dyn ImagePolicy>,
    ) -> Result<Self> {
        let storage = Storage::new(&settings.database).await?;
        storage.migrate().await?;
        let backend = backend::connect(&settings, tokens).await?;
        Ok(Self::new(
            backend,
            Arc::new(storage.documents()),
            images,
            settings,
        ))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // Services

    pub async fn list_services(&self, project_id: &str) -> Result<Vec<DeploymentRecord>> {
        self.list(project_id, DeploymentType::Service).await
    }

    pub async fn deploy_service(
        &self,
        project_id: &str,
        spec: DeploymentSpec,
        user_id: Option<&str>,
    ) -> Result<DeploymentRecord> {
        self.deploy(project_id, spec, DeploymentType::Service, user_id).await
    }

    pub async fn get_service_metadata(
        &self,
        project_id: &str,
        service_id: &str,
    ) -> Result<DeploymentRecord> {
        self.get_metadata(project_id, service_id, DeploymentType::Service)
            .await
    }

    /// Applies `patch` to the service spec as a JSON merge patch. A running
    /// service is restarted with the new spec.
    pub async fn update_service(
        &self,
        project_id: &str,
        service_id: &str,
        patch: &Value,
        user_id: Option<&str>,
    ) -> Result<DeploymentRecord> {
        let current = self
            .get_metadata(project_id, service_id, DeploymentType::Service)
            .await?;

        let mut merged = serde_json::to_value(&current.spec)?;
        json_patch::merge(&mut merged, patch);
        let spec: DeploymentSpec = serde_json::from_value(merged)
            .map_err(|e| DeployError::validation(format!("Invalid service update: {e}")))?;

        if spec.display_name != current.spec.display_name {
            return Err(DeployError::validation(
                "The display name of a deployment cannot be changed.",
            ));
        }
        spec.validate()?;
        self.check_image(&spec).await?;

        if current.status.is_stopped() {
            let mut record = current;
            record.spec = spec;
            self.persist(project_id, &record, true).await?;
            info!("Updated stopped service {} in project {}", record.id, project_id);
            return Ok(record);
        }

        info!("Restarting service {} in project {} after update", current.id, project_id);
        self.redeploy(project_id, &current, spec, user_id).await
    }

    /// Records an access on the persisted record only.
    pub async fn update_service_access(
        &self,
        project_id: &str,
        service_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let patch = json!({
            "last_access_time": Utc::now(),
            "last_access_user": user_id,
        });
        self.documents
            .update_document(
                &self.settings.internal_project,
                &collection_id(project_id, DeploymentType::Service),
                service_id,
                &patch,
            )
            .await?;
        debug!("Recorded access to {} by {}", service_id, user_id);
        Ok(())
    }

    pub async fn delete_service(
        &self,
        project_id: &str,
        service_id: &str,
        delete_volumes: bool,
    ) -> Result<()> {
        self.delete(project_id, service_id, DeploymentType::Service, delete_volumes)
            .await
    }

    pub async fn delete_services(&self, project_id: &str) -> Result<()> {
        self.delete_all(project_id, DeploymentType::Service).await
    }

    pub async fn get_service_logs(
        &self,
        project_id: &str,
        service_id: &str,
        query: &LogQuery,
    ) -> Result<String> {
        self.backend
            .logs(project_id, service_id, DeploymentType::Service, query)
            .await
    }

    pub async fn list_service_actions(
        &self,
        project_id: &str,
        service_id: &str,
    ) -> Result<Vec<ResourceAction>> {
        self.list_actions(project_id, service_id, DeploymentType::Service)
            .await
    }

    pub async fn execute_service_action(
        &self,
        project_id: &str,
        service_id: &str,
        action_id: &str,
        user_id: Option<&str>,
    ) -> Result<ActionOutcome> {
        self.execute_action(project_id, service_id, DeploymentType::Service, action_id, user_id)
            .await
    }

    pub async fn list_deploy_service_actions(
        &self,
        spec: &DeploymentSpec,
    ) -> Result<Vec<ResourceAction>> {
        self.list_deploy_actions(spec).await
    }

    // Jobs

    pub async fn list_jobs(&self, project_id: &str) -> Result<Vec<DeploymentRecord>> {
        self.list(project_id, DeploymentType::Job).await
    }

    pub async fn deploy_job(
        &self,
        project_id: &str,
        spec: DeploymentSpec,
        user_id: Option<&str>,
    ) -> Result<DeploymentRecord> {
        self.deploy(project_id, spec, DeploymentType::Job, user_id).await
    }

    pub async fn get_job_metadata(&self, project_id: &str, job_id: &str) -> Result<DeploymentRecord> {
        self.get_metadata(project_id, job_id, DeploymentType::Job).await
    }

    pub async fn delete_job(&self, project_id: &str, job_id: &str) -> Result<()> {
        self.delete(project_id, job_id, DeploymentType::Job, true).await
    }

    pub async fn delete_jobs(&self, project_id: &str) -> Result<()> {
        self.delete_all(project_id, DeploymentType::Job).await
    }

    pub async fn get_job_logs(
        &self,
        project_id: &str,
        job_id: &str,
        query: &LogQuery,
    ) -> Result<String> {
        self.backend
            .logs(project_id, job_id, DeploymentType::Job, query)
            .await
    }

    pub async fn list_job_actions(
        &self,
        project_id: &str,
        job_id: &str,
    ) -> Result<Vec<ResourceAction>> {
        self.list_actions(project_id, job_id, DeploymentType::Job).await
    }

    pub async fn execute_job_action(
        &self,
        project_id: &str,
        job_id: &str,
        action_id: &str,
        user_id: Option<&str>,
    ) -> Result<ActionOutcome> {
        self.execute_action(project_id, job_id, DeploymentType::Job, action_id, user_id)
            .await
    }

    pub async fn list_deploy_job_actions(
        &self,
        spec: &DeploymentSpec,
    ) -> Result<Vec<ResourceAction>> {
        self.list_deploy_actions(spec).await
    }

    // Shared implementation

    async fn list(
        &self,
        project_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<Vec<DeploymentRecord>> {
        let persisted = self.load_all(project_id, deployment_type).await?;
        let live = self.backend.list(project_id, deployment_type).await?;

        let merged = merge_records(persisted, live);
        for record in &merged.adopted {
            match self.persist(project_id, record, false).await {
                Ok(()) => info!("Adopted {} {} in project {}", deployment_type, record.id, project_id),
                Err(e) if e.is_already_exists() => {}
                Err(e) => warn!("Could not adopt {}: {}", record.id, e.detail()),
            }
        }
        Ok(merged.records)
    }

    async fn deploy(
        &self,
        project_id: &str,
        spec: DeploymentSpec,
        deployment_type: DeploymentType,
        user_id: Option<&str>,
    ) -> Result<DeploymentRecord> {
        spec.validate()?;
        self.check_image(&spec).await?;

        let id = deployment_id(
            &self.settings.system_namespace,
            project_id,
            spec.display_name()?,
            deployment_type,
        );
        if self.load(project_id, &id, deployment_type).await?.is_some() {
            return Err(DeployError::AlreadyExists(format!(
                "A deployment with the display name '{}' already exists.",
                spec.display_name()?
            )));
        }
        self.backend.check_capacity(&spec).await?;

        if spec.is_stopped {
            let mut record = DeploymentRecord::new(id, deployment_type, spec);
            record.mark_stopped();
            self.persist(project_id, &record, false).await?;
            info!("Created stopped {} {} in project {}", deployment_type, record.id, project_id);
            return Ok(record);
        }

        let request = DeployRequest {
            deployment_id: &id,
            deployment_type,
            spec: &spec,
            wait: false,
            user_id,
        };
        let record = self.backend.deploy(project_id, &request).await?;

        if let Err(e) = self.persist(project_id, &record, false).await {
            warn!("Persisting {} failed, removing the deployment again: {}", id, e.detail());
            if let Err(cleanup) = self
                .backend
                .delete(project_id, &id, deployment_type, false)
                .await
            {
                error!("Failed to remove {} after persistence failure: {}", id, cleanup.detail());
            }
            return Err(e);
        }

        info!("Deployed {} {} in project {}", deployment_type, id, project_id);
        Ok(record)
    }

    async fn get_metadata(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<DeploymentRecord> {
        let persisted = self.load(project_id, deployment_id, deployment_type).await?;
        let live = self.live(project_id, deployment_id, deployment_type).await?;

        match (persisted, live) {
            (Some(mut record), Some(live)) => {
                overlay(&mut record, &live);
                Ok(record)
            }
            (Some(mut record), None) => {
                record.mark_stopped();
                Ok(record)
            }
            (None, Some(live)) => {
                match self.persist(project_id, &live, false).await {
                    Ok(()) => info!("Adopted {} {} in project {}", deployment_type, deployment_id, project_id),
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e),
                }
                Ok(live)
            }
            (None, None) => Err(DeployError::not_found(format!(
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
        let live_deleted = match self
            .backend
            .delete(project_id, deployment_id, deployment_type, delete_volumes)
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        let record_deleted = match self
            .documents
            .delete_document(
                &self.settings.internal_project,
                &collection_id(project_id, deployment_type),
                deployment_id,
            )
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        if !live_deleted && !record_deleted {
            return Err(DeployError::not_found(format!(
                "Could not find deployment '{deployment_id}' of project '{project_id}'."
            )));
        }
        info!("Deleted {} {} from project {}", deployment_type, deployment_id, project_id);
        Ok(())
    }

    async fn delete_all(&self, project_id: &str, deployment_type: DeploymentType) -> Result<()> {
        self.backend.delete_all(project_id, deployment_type).await?;
        self.documents
            .delete_collection(
                &self.settings.internal_project,
                &collection_id(project_id, deployment_type),
            )
            .await
    }

    async fn list_actions(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<Vec<ResourceAction>> {
        let record = self
            .get_metadata(project_id, deployment_id, deployment_type)
            .await?;

        Ok(available_actions(&record)
            .iter()
            .map(|action| {
                let mut resource_action = ResourceAction::from(action);
                if let DeploymentAction::Access { endpoint } = action {
                    if let Some(declared) = access_endpoint(&record, endpoint) {
                        resource_action.instructions = vec![ActionInstruction::NewTab {
                            url: access_url(&self.settings.base_url, project_id, &record.id, declared),
                        }];
                    }
                }
                resource_action
            })
            .collect())
    }

    async fn execute_action(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
        action_id: &str,
        user_id: Option<&str>,
    ) -> Result<ActionOutcome> {
        let action: DeploymentAction = action_id.parse()?;
        let record = self
            .get_metadata(project_id, deployment_id, deployment_type)
            .await?;
        ensure_allowed(&record, &action)?;
        info!("Executing action {} on {} in project {}", action, deployment_id, project_id);

        let outcome = match action {
            DeploymentAction::Start => {
                let spec = record.spec.clone();
                let record = self.start(project_id, &record, spec, user_id).await?;
                ActionOutcome::Record(Box::new(record))
            }
            DeploymentAction::Stop => {
                let record = self.stop(project_id, record).await?;
                ActionOutcome::Record(Box::new(record))
            }
            DeploymentAction::Restart => {
                let spec = record.spec.clone();
                let record = self.redeploy(project_id, &record, spec, user_id).await?;
                ActionOutcome::Record(Box::new(record))
            }
            DeploymentAction::Access { endpoint } => {
                let declared = access_endpoint(&record, &endpoint).ok_or_else(|| {
                    DeployError::validation(format!("Unknown endpoint '{endpoint}'."))
                })?;
                ActionOutcome::Redirect {
                    url: access_url(&self.settings.base_url, project_id, &record.id, declared),
                }
            }
        };
        Ok(outcome)
    }

    async fn list_deploy_actions(&self, spec: &DeploymentSpec) -> Result<Vec<ResourceAction>> {
        spec.validate()?;
        match self.backend.check_capacity(spec).await {
            Ok(()) => Ok(vec![ResourceAction::default_deploy()]),
            Err(DeployError::InsufficientResources(reason) | DeployError::Validation(reason)) => {
                debug!("No deploy action offered: {}", reason);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Deploys from a stored spec and waits for readiness.
    async fn start(
        &self,
        project_id: &str,
        previous: &DeploymentRecord,
        mut spec: DeploymentSpec,
        user_id: Option<&str>,
    ) -> Result<DeploymentRecord> {
        spec.is_stopped = false;
        let request = DeployRequest {
            deployment_id: &previous.id,
            deployment_type: previous.deployment_type,
            spec: &spec,
            wait: true,
            user_id,
        };
        let mut record = self.backend.deploy(project_id, &request).await?;
        record.last_access_time = previous.last_access_time;
        record.last_access_user = previous.last_access_user.clone();
        self.persist(project_id, &record, true).await?;
        Ok(record)
    }

    /// Removes the live resource and keeps the record.
    async fn stop(&self, project_id: &str, record: DeploymentRecord) -> Result<DeploymentRecord> {
        self.remove_live(project_id, &record, record.spec.clear_volume_on_stop)
            .await?;

        let mut record = record;
        record.mark_stopped();
        record.stopped_at = Some(Utc::now());
        self.persist(project_id, &record, true).await?;
        Ok(record)
    }

    /// Removes the live resource, waits until it is gone and deploys `spec`.
    async fn redeploy(
        &self,
        project_id: &str,
        record: &DeploymentRecord,
        spec: DeploymentSpec,
        user_id: Option<&str>,
    ) -> Result<DeploymentRecord> {
        self.remove_live(project_id, record, false).await?;

        let timeouts = &self.settings.timeouts;
        let deployment_type = record.deployment_type;
        poll_until(
            timeouts.poll_interval(),
            timeouts.restart(),
            &format!("'{}' to be removed", record.id),
            || async move {
                match self.backend.get(project_id, &record.id, deployment_type).await {
                    Ok(_) => Ok(None),
                    Err(e) if e.is_not_found() => Ok(Some(())),
                    Err(e) => Err(e),
                }
            },
        )
        .await?;

        self.start(project_id, record, spec, user_id).await
    }

    async fn remove_live(
        &self,
        project_id: &str,
        record: &DeploymentRecord,
        delete_volumes: bool,
    ) -> Result<()> {
        match self
            .backend
            .delete(project_id, &record.id, record.deployment_type, delete_volumes)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn check_image(&self, spec: &DeploymentSpec) -> Result<()> {
        let (name, tag) = split_image_name_and_tag(&spec.container_image);
        self.images.check_image_allowed(&name, &tag).await
    }

    async fn live(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<Option<DeploymentRecord>> {
        match self
            .backend
            .get(project_id, deployment_id, deployment_type)
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn load(
        &self,
        project_id: &str,
        deployment_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<Option<DeploymentRecord>> {
        match self
            .documents
            .get_document(
                &self.settings.internal_project,
                &collection_id(project_id, deployment_type),
                deployment_id,
            )
            .await
        {
            Ok(document) => Ok(Some(serde_json::from_value(document.json_value)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persisted records of one type. Undecodable documents are skipped.
    async fn load_all(
        &self,
        project_id: &str,
        deployment_type: DeploymentType,
    ) -> Result<Vec<DeploymentRecord>> {
        let documents = self
            .documents
            .list_documents(
                &self.settings.internal_project,
                &collection_id(project_id, deployment_type),
                None,
                None,
            )
            .await?;

        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            match serde_json::from_value::<DeploymentRecord>(document.json_value) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable record {}: {}", document.key, e),
            }
        }
        Ok(records)
    }

    async fn persist(&self, project_id: &str, record: &DeploymentRecord, upsert: bool) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.documents
            .create_document(
                &self.settings.internal_project,
                &collection_id(project_id, record.deployment_type),
                &record.id,
                &value,
                upsert,
            )
            .await?;
        Ok(())
    }
}
