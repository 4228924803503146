//! Engine-level error types.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::instance::InstanceStatus;

/// Errors produced by the workflow engine (validation, lookup, lifecycle,
/// persistence).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Definition structure ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the definition.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Edge weights must be finite and strictly positive.
    #[error("edge '{from}' -> '{to}' has non-positive weight {weight}")]
    InvalidEdgeWeight { from: String, to: String, weight: f64 },

    /// Topological sort could not order every node.
    #[error("workflow definition contains a cycle; unresolved nodes: {unresolved:?}")]
    CyclicGraph { unresolved: BTreeSet<String> },

    // ------ Registry / lookup ------

    #[error("workflow definition already exists: '{0}'")]
    DuplicateDefinition(String),

    #[error("unknown workflow definition: '{0}'")]
    UnknownDefinition(String),

    #[error("unknown workflow instance: '{0}'")]
    UnknownInstance(String),

    /// An instance was handed to a run together with another definition.
    #[error("instance '{instance_id}' belongs to definition '{expected}', not '{actual}'")]
    DefinitionMismatch {
        instance_id: String,
        expected: String,
        actual: String,
    },

    /// Pause/resume called from the wrong state.
    #[error("instance state invalid, expected {expected} but was {actual}")]
    InvalidStateTransition {
        expected: InstanceStatus,
        actual: InstanceStatus,
    },

    #[error("processor registration failed: {0}")]
    Registry(#[from] processors::RegistryError),

    // ------ Infrastructure ------

    /// The durable store rejected or could not complete a call.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(#[from] db::DbError),

    /// The engine has been shut down and no longer admits runs.
    #[error("workflow engine is shut down")]
    Shutdown,

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}
