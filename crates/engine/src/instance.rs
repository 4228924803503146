//! Workflow instance: one execution of a definition.
//!
//! Instances are immutable values. Every state change produces a new value
//! (through [`WorkflowInstance::to_builder`] or [`WorkflowInstance::with_status`]),
//! which lets the engine swap cache entries atomically instead of editing
//! them in place.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// InstanceStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an instance.
///
/// `PENDING → RUNNING → {SUCCEEDED, FAILED, CANCELLED}`, `RUNNING ⇄ PAUSED`,
/// and any non-terminal state may move to `CANCELLED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    id: String,
    definition_id: String,
    status: InstanceStatus,
    active_nodes: BTreeSet<String>,
    context: Map<String, Value>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl WorkflowInstance {
    pub fn builder(id: impl Into<String>, definition_id: impl Into<String>) -> WorkflowInstanceBuilder {
        WorkflowInstanceBuilder {
            inner: WorkflowInstance {
                id: id.into(),
                definition_id: definition_id.into(),
                status: InstanceStatus::Pending,
                active_nodes: BTreeSet::new(),
                context: Map::new(),
                start_time: None,
                end_time: None,
                error_message: None,
            },
        }
    }

    /// A builder seeded with this instance's values.
    pub fn to_builder(&self) -> WorkflowInstanceBuilder {
        WorkflowInstanceBuilder { inner: self.clone() }
    }

    /// New value with the given status, error, end time and active nodes.
    pub fn with_status(
        &self,
        status: InstanceStatus,
        error_message: Option<String>,
        end_time: Option<DateTime<Utc>>,
        active_nodes: BTreeSet<String>,
    ) -> Self {
        Self {
            status,
            error_message,
            end_time,
            active_nodes,
            ..self.clone()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn active_nodes(&self) -> &BTreeSet<String> {
        &self.active_nodes
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// `end - start`, only when both are set.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

pub struct WorkflowInstanceBuilder {
    inner: WorkflowInstance,
}

impl WorkflowInstanceBuilder {
    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.inner.status = status;
        self
    }

    pub fn active_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.active_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.inner.context = context;
        self
    }

    pub fn start_time(mut self, at: DateTime<Utc>) -> Self {
        self.inner.start_time = Some(at);
        self
    }

    pub fn end_time(mut self, at: DateTime<Utc>) -> Self {
        self.inner.end_time = Some(at);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.inner.error_message = Some(message.into());
        self
    }

    pub fn build(self) -> WorkflowInstance {
        self.inner
    }
}
