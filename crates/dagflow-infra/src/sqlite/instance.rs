//! SQLite instance store implementation.
//!
//! Implements `InstanceStore` from `dagflow-core` using sqlx with split
//! read/write pools. Each instance is one row; its step states and context
//! are JSON columns, so `save` is a single atomic `UPDATE`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dagflow_core::repository::instance::InstanceStore;
use dagflow_types::error::RepositoryError;
use dagflow_types::workflow::{ContextMap, InstanceStatus, StepState, WorkflowInstance};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `InstanceStore`.
pub struct SqliteInstanceStore {
    pool: DatabasePool,
}

impl SqliteInstanceStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    template_name: String,
    status: String,
    context: String,
    steps: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            template_name: row.try_get("template_name")?,
            status: row.try_get("status")?,
            context: row.try_get("context")?,
            steps: row.try_get("steps")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status = parse_status(&self.status)?;
        let context: ContextMap = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;
        let steps: BTreeMap<String, StepState> = serde_json::from_str(&self.steps)
            .map_err(|e| RepositoryError::Query(format!("invalid steps JSON: {e}")))?;

        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            template_name: self.template_name,
            context,
            steps,
            status,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

/// Serialized mutable columns of an instance.
struct EncodedState {
    context: String,
    steps: String,
}

impl EncodedState {
    fn of(instance: &WorkflowInstance) -> Result<Self, RepositoryError> {
        Ok(Self {
            context: serde_json::to_string(&instance.context)
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            steps: serde_json::to_string(&instance.steps)
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_status(s: &str) -> Result<InstanceStatus, RepositoryError> {
    match s {
        "running" => Ok(InstanceStatus::Running),
        "paused" => Ok(InstanceStatus::Paused),
        "completed" => Ok(InstanceStatus::Completed),
        "failed" => Ok(InstanceStatus::Failed),
        other => Err(RepositoryError::Query(format!(
            "invalid instance status: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// InstanceStore implementation
// ---------------------------------------------------------------------------

impl InstanceStore for SqliteInstanceStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<Uuid, RepositoryError> {
        let encoded = EncodedState::of(instance)?;

        let result = sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, template_name, status, context, steps, error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.template_name)
        .bind(instance.status.as_str())
        .bind(&encoded.context)
        .bind(&encoded.steps)
        .bind(&instance.error)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(instance.id),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("instance {} already exists", instance.id)),
            ),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn load(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let encoded = EncodedState::of(instance)?;

        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = ?, context = ?, steps = ?, error = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(instance.status.as_str())
        .bind(&encoded.context)
        .bind(&encoded.steps)
        .bind(&instance.error)
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        Ok(())
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances WHERE status = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
