use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::{json_contains, DocumentStore, JsonDocument};
use crate::error::{DeployError, Result};

pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_document(row: &SqliteRow) -> Result<JsonDocument> {
        let raw: String = row.get("json_value");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(JsonDocument {
            key: row.get("key"),
            json_value: serde_json::from_str(&raw)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    async fn fetch(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
    ) -> Result<Option<JsonDocument>> {
        let row = sqlx::query(
            "SELECT key, json_value, created_at, updated_at FROM json_documents
             WHERE project_id = ? AND collection_id = ? AND key = ?",
        )
        .bind(project_id)
        .bind(collection_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_document).transpose()
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_default()
}

fn not_found(collection_id: &str, key: &str) -> DeployError {
    DeployError::not_found(format!(
        "Document '{}' does not exist in collection '{}'.",
        key, collection_id
    ))
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn create_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
        value: &Value,
        upsert: bool,
    ) -> Result<JsonDocument> {
        let now = Utc::now().to_rfc3339();
        let query = if upsert {
            "INSERT INTO json_documents (project_id, collection_id, key, json_value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (project_id, collection_id, key)
             DO UPDATE SET json_value = excluded.json_value, updated_at = excluded.updated_at"
        } else {
            "INSERT INTO json_documents (project_id, collection_id, key, json_value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (project_id, collection_id, key) DO NOTHING"
        };

        let result = sqlx::query(query)
            .bind(project_id)
            .bind(collection_id)
            .bind(key)
            .bind(value.to_string())
            .bind(&now)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeployError::AlreadyExists(format!(
                "Document '{}' already exists in collection '{}'.",
                key, collection_id
            )));
        }

        debug!("Stored document {}/{}/{}", project_id, collection_id, key);
        self.fetch(project_id, collection_id, key)
            .await?
            .ok_or_else(|| not_found(collection_id, key))
    }

    async fn get_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
    ) -> Result<JsonDocument> {
        self.fetch(project_id, collection_id, key)
            .await?
            .ok_or_else(|| not_found(collection_id, key))
    }

    async fn update_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
        patch: &Value,
    ) -> Result<JsonDocument> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT json_value FROM json_documents
             WHERE project_id = ? AND collection_id = ? AND key = ?",
        )
        .bind(project_id)
        .bind(collection_id)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| not_found(collection_id, key))?;

        let raw: String = row.get("json_value");
        let mut value: Value = serde_json::from_str(&raw)?;
        json_patch::merge(&mut value, patch);

        sqlx::query(
            "UPDATE json_documents SET json_value = ?, updated_at = ?
             WHERE project_id = ? AND collection_id = ? AND key = ?",
        )
        .bind(value.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(project_id)
        .bind(collection_id)
        .bind(key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_document(project_id, collection_id, key).await
    }

    async fn delete_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM json_documents WHERE project_id = ? AND collection_id = ? AND key = ?",
        )
        .bind(project_id)
        .bind(collection_id)
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(collection_id, key));
        }
        Ok(())
    }

    async fn list_documents(
        &self,
        project_id: &str,
        collection_id: &str,
        filter: Option<&Value>,
        keys: Option<&[String]>,
    ) -> Result<Vec<JsonDocument>> {
        let rows = sqlx::query(
            "SELECT key, json_value, created_at, updated_at FROM json_documents
             WHERE project_id = ? AND collection_id = ?
             ORDER BY rowid",
        )
        .bind(project_id)
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in &rows {
            let document = Self::row_to_document(row)?;
            if let Some(keys) = keys {
                if !keys.contains(&document.key) {
                    continue;
                }
            }
            if let Some(filter) = filter {
                if !json_contains(&document.json_value, filter) {
                    continue;
                }
            }
            documents.push(document);
        }
        Ok(documents)
    }

    async fn delete_collection(&self, project_id: &str, collection_id: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM json_documents WHERE project_id = ? AND collection_id = ?",
        )
        .bind(project_id)
        .bind(collection_id)
        .execute(&self.pool)
        .await?;

        debug!(
            "Deleted {} documents from {}/{}",
            result.rows_affected(),
            project_id,
            collection_id
        );
        Ok(())
    }
}
