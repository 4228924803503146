//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models and carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// workflow_instances
// ---------------------------------------------------------------------------

/// A persisted workflow instance row.
///
/// `status` holds the upper-case status name (`RUNNING`, `PAUSED`, …);
/// `active_nodes` is a JSON array of node IDs and `context` a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WorkflowInstanceRow {
    pub id: String,
    pub definition_id: String,
    pub status: String,
    pub active_nodes: serde_json::Value,
    pub context: serde_json::Value,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status names the store treats as finished.
pub const TERMINAL_STATUSES: [&str; 3] = ["SUCCEEDED", "FAILED", "CANCELLED"];

/// Status names recovered into memory on startup.
pub const RECOVERABLE_STATUSES: [&str; 2] = ["RUNNING", "PAUSED"];
