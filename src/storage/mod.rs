pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::config::DatabaseSettings;
use crate::error::Result;

pub use self::sqlite::SqliteDocumentStore;

#[derive(Debug, Clone, PartialEq)]
pub struct JsonDocument {
    pub key: String,
    pub json_value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Keyed JSON documents grouped into collections per project.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fails with `AlreadyExists` when the key is taken and `upsert` is false.
    async fn create_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
        value: &Value,
        upsert: bool,
    ) -> Result<JsonDocument>;

    async fn get_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
    ) -> Result<JsonDocument>;

    /// Applies `patch` as a JSON merge patch.
    async fn update_document(
        &self,
        project_id: &str,
        collection_id: &str,
        key: &str,
        patch: &Value,
    ) -> Result<JsonDocument>;

    async fn delete_document(&self, project_id: &str, collection_id: &str, key: &str)
        -> Result<()>;

    /// Documents in insertion order. `filter` keeps documents that contain
    /// it structurally, `keys` restricts the result to the given keys.
    async fn list_documents(
        &self,
        project_id: &str,
        collection_id: &str,
        filter: Option<&Value>,
        keys: Option<&[String]>,
    ) -> Result<Vec<JsonDocument>>;

    async fn delete_collection(&self, project_id: &str, collection_id: &str) -> Result<()>;
}

/// True when every field of `filter` is present in `document` with an
/// equal value. Objects compare recursively, everything else by equality.
pub fn json_contains(document: &Value, filter: &Value) -> bool {
    match (document, filter) {
        (Value::Object(doc), Value::Object(filter)) => filter.iter().all(|(key, expected)| {
            doc.get(key)
                .map_or(false, |actual| json_contains(actual, expected))
        }),
        _ => document == filter,
    }
}

#[derive(Clone)]
pub struct Storage {
    pub pool: Arc<SqlitePool>,
}

impl Storage {
    pub async fn new(settings: &DatabaseSettings) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.url)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Private in-memory database, mainly for tests. A single connection is
    /// kept alive for the lifetime of the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let storage = Self {
            pool: Arc::new(pool),
        };
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    pub fn documents(&self) -> SqliteDocumentStore {
        SqliteDocumentStore::new((*self.pool).clone())
    }
}
