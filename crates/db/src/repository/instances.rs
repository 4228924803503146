//! Workflow instance repository functions.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    models::{WorkflowInstanceRow, RECOVERABLE_STATUSES, TERMINAL_STATUSES},
    DbError,
};

const INSTANCE_COLUMNS: &str = "id, definition_id, status, active_nodes, context, \
     start_time, end_time, error_message, created_at, updated_at";

/// Insert or fully overwrite an instance row.
///
/// `created_at` is kept from the first insert; everything else reflects the
/// latest snapshot.
pub async fn upsert_instance(
    pool: &PgPool,
    row: &WorkflowInstanceRow,
) -> Result<WorkflowInstanceRow, DbError> {
    let now = Utc::now();

    let saved = sqlx::query_as::<_, WorkflowInstanceRow>(&format!(
        r#"
        INSERT INTO workflow_instances
            (id, definition_id, status, active_nodes, context,
             start_time, end_time, error_message, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
        ON CONFLICT (id) DO UPDATE SET
            definition_id = EXCLUDED.definition_id,
            status        = EXCLUDED.status,
            active_nodes  = EXCLUDED.active_nodes,
            context       = EXCLUDED.context,
            start_time    = EXCLUDED.start_time,
            end_time      = EXCLUDED.end_time,
            error_message = EXCLUDED.error_message,
            updated_at    = EXCLUDED.updated_at
        RETURNING {INSTANCE_COLUMNS}
        "#
    ))
    .bind(&row.id)
    .bind(&row.definition_id)
    .bind(&row.status)
    .bind(&row.active_nodes)
    .bind(&row.context)
    .bind(row.start_time)
    .bind(row.end_time)
    .bind(&row.error_message)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(saved)
}

/// Fetch a single instance by its primary key.
pub async fn get_instance(pool: &PgPool, id: &str) -> Result<Option<WorkflowInstanceRow>, DbError> {
    let row = sqlx::query_as::<_, WorkflowInstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Update the status, end time and error message of an instance.
///
/// Returns `false` if no row matched.
pub async fn update_instance_status(
    pool: &PgPool,
    id: &str,
    status: &str,
    end_time: Option<DateTime<Utc>>,
    error_message: Option<&str>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET status = $1, end_time = $2, error_message = $3, updated_at = $4
        WHERE id = $5
        "#,
    )
    .bind(status)
    .bind(end_time)
    .bind(error_message)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Return all instances whose status is RUNNING or PAUSED, oldest first.
pub async fn list_recoverable_instances(pool: &PgPool) -> Result<Vec<WorkflowInstanceRow>, DbError> {
    let statuses: Vec<String> = RECOVERABLE_STATUSES.iter().map(|s| s.to_string()).collect();

    let rows = sqlx::query_as::<_, WorkflowInstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
         WHERE status = ANY($1) ORDER BY created_at ASC"
    ))
    .bind(statuses)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Permanently delete terminal instances that ended before `cutoff`.
///
/// Returns the number of deleted rows.
pub async fn delete_expired_instances(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
    let statuses: Vec<String> = TERMINAL_STATUSES.iter().map(|s| s.to_string()).collect();

    let result = sqlx::query(
        r#"
        DELETE FROM workflow_instances
        WHERE status = ANY($1) AND end_time IS NOT NULL AND end_time < $2
        "#,
    )
    .bind(statuses)
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
