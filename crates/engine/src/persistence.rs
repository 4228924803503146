//! Durable storage for workflow instances.
//!
//! [`WorkflowPersistence`] is the contract the engine writes through;
//! [`MemoryPersistence`] keeps everything in a `DashMap` (tests, the CLI
//! without a database) and [`PgPersistence`] maps instances onto the
//! `workflow_instances` table via the `db` crate.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::debug;

use db::models::WorkflowInstanceRow;
use db::repository::instances;
use db::{DbError, DbPool};

use crate::instance::{InstanceStatus, WorkflowInstance};

#[async_trait]
pub trait WorkflowPersistence: Send + Sync {
    /// Store a full snapshot of `instance`, replacing any previous one.
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), DbError>;

    async fn restore(&self, id: &str) -> Result<Option<WorkflowInstance>, DbError>;

    /// Returns `false` if no instance with `id` is stored.
    async fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        end_time: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> Result<bool, DbError>;

    /// Delete terminal instances that ended before `cutoff`.
    async fn cleanup_expired_instances(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError>;

    /// Every stored RUNNING or PAUSED instance.
    async fn find_recoverable(&self) -> Result<Vec<WorkflowInstance>, DbError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPersistence {
    instances: DashMap<String, WorkflowInstance>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl WorkflowPersistence for MemoryPersistence {
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), DbError> {
        self.instances.insert(instance.id().to_owned(), instance.clone());
        Ok(())
    }

    async fn restore(&self, id: &str) -> Result<Option<WorkflowInstance>, DbError> {
        Ok(self.instances.get(id).map(|entry| entry.value().clone()))
    }

    async fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        end_time: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> Result<bool, DbError> {
        let Some(mut entry) = self.instances.get_mut(id) else {
            return Ok(false);
        };
        let updated = entry.with_status(
            status,
            error_message.map(str::to_owned),
            end_time,
            entry.active_nodes().clone(),
        );
        *entry = updated;
        Ok(true)
    }

    async fn cleanup_expired_instances(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
        let before = self.instances.len();
        self.instances.retain(|_, instance| {
            !(instance.is_terminal() && instance.end_time().is_some_and(|end| end < cutoff))
        });
        Ok(before.saturating_sub(self.instances.len()) as u64)
    }

    async fn find_recoverable(&self) -> Result<Vec<WorkflowInstance>, DbError> {
        let mut found: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|entry| {
                matches!(entry.status(), InstanceStatus::Running | InstanceStatus::Paused)
            })
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.start_time().cmp(&b.start_time()).then_with(|| a.id().cmp(b.id())));
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// Postgres-backed store. Every call is bounded by `timeout`; an expired
/// call fails with [`DbError::Timeout`].
pub struct PgPersistence {
    pool: DbPool,
    timeout: Duration,
}

impl PgPersistence {
    pub fn new(pool: DbPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>> + Send,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| DbError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl WorkflowPersistence for PgPersistence {
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), DbError> {
        let row = to_row(instance)?;
        self.bounded(instances::upsert_instance(&self.pool, &row)).await?;
        debug!(instance_id = instance.id(), "instance snapshot stored");
        Ok(())
    }

    async fn restore(&self, id: &str) -> Result<Option<WorkflowInstance>, DbError> {
        let row = self.bounded(instances::get_instance(&self.pool, id)).await?;
        row.map(from_row).transpose()
    }

    async fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        end_time: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> Result<bool, DbError> {
        self.bounded(instances::update_instance_status(
            &self.pool,
            id,
            status.as_str(),
            end_time,
            error_message,
        ))
        .await
    }

    async fn cleanup_expired_instances(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
        self.bounded(instances::delete_expired_instances(&self.pool, cutoff))
            .await
    }

    async fn find_recoverable(&self) -> Result<Vec<WorkflowInstance>, DbError> {
        let rows = self
            .bounded(instances::list_recoverable_instances(&self.pool))
            .await?;
        rows.into_iter().map(from_row).collect()
    }
}

fn to_row(instance: &WorkflowInstance) -> Result<WorkflowInstanceRow, DbError> {
    let now = Utc::now();
    Ok(WorkflowInstanceRow {
        id: instance.id().to_owned(),
        definition_id: instance.definition_id().to_owned(),
        status: instance.status().as_str().to_owned(),
        active_nodes: serde_json::to_value(instance.active_nodes())?,
        context: Value::Object(instance.context().clone()),
        start_time: instance.start_time(),
        end_time: instance.end_time(),
        error_message: instance.error_message().map(str::to_owned),
        created_at: now,
        updated_at: now,
    })
}

fn from_row(row: WorkflowInstanceRow) -> Result<WorkflowInstance, DbError> {
    let status: InstanceStatus = row.status.parse().map_err(DbError::InvalidRow)?;
    let active_nodes: BTreeSet<String> = serde_json::from_value(row.active_nodes)?;
    let context: Map<String, Value> = match row.context {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(DbError::InvalidRow(format!(
                "instance '{}' context is not an object: {other}",
                row.id
            )))
        }
    };

    let mut builder = WorkflowInstance::builder(row.id, row.definition_id)
        .status(status)
        .active_nodes(active_nodes)
        .context(context);
    if let Some(start) = row.start_time {
        builder = builder.start_time(start);
    }
    if let Some(end) = row.end_time {
        builder = builder.end_time(end);
    }
    if let Some(message) = row.error_message {
        builder = builder.error_message(message);
    }
    Ok(builder.build())
}
