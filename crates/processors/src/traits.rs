//! The `TaskProcessor` trait: the contract every processor must fulfil.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::ProcessorError;

/// Everything a processor sees when it runs for one workflow node.
///
/// Defined here (in the processors crate) so both the engine and individual
/// processor implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// ID of the workflow instance being executed.
    pub instance_id: String,
    /// ID of the definition the instance was started from.
    pub definition_id: String,
    /// ID of the node this processor runs for.
    pub node_id: String,
    /// Static configuration attached to the node in the definition.
    pub config: Value,
    /// Snapshot of the instance context at dispatch time.
    pub context: Map<String, Value>,
    /// 1-based dispatch attempt.
    pub attempt: u32,
}

impl TaskContext {
    /// Look up a top-level context value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }
}

/// The core processor trait.
///
/// A processor is a function of the instance context to a result or a typed
/// failure. When the returned value is a JSON object its keys are merged into
/// the instance context; any other value is recorded but not merged.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, ProcessorError>;
}
