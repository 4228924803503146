//! Built-in processors available to every engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::{ProcessorError, ProcessorRegistry, RegistryError, TaskContext, TaskProcessor};

/// Does nothing and produces no output.
pub struct NoopProcessor;

#[async_trait]
impl TaskProcessor for NoopProcessor {
    async fn execute(&self, _ctx: &TaskContext) -> Result<Value, ProcessorError> {
        Ok(Value::Null)
    }
}

/// Logs the node and the current instance context.
pub struct LogProcessor;

#[async_trait]
impl TaskProcessor for LogProcessor {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, ProcessorError> {
        info!(
            instance_id = %ctx.instance_id,
            node_id = %ctx.node_id,
            "context: {}",
            serde_json::Value::Object(ctx.context.clone())
        );
        Ok(Value::Null)
    }
}

/// Emits the node's config object so it is merged into the instance context.
///
/// A node `{"processor": "set", "config": {"approved": true}}` makes
/// `approved` visible to the conditions of its outgoing edges.
pub struct SetProcessor;

#[async_trait]
impl TaskProcessor for SetProcessor {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, ProcessorError> {
        match &ctx.config {
            Value::Object(_) => Ok(ctx.config.clone()),
            Value::Null => Ok(Value::Null),
            other => Err(ProcessorError::Fatal(format!(
                "set processor expects an object config, got {other}"
            ))),
        }
    }
}

/// Register `noop`, `log` and `set` with `registry`.
pub fn register_builtins(registry: &ProcessorRegistry) -> Result<(), RegistryError> {
    registry.register("noop", Arc::new(NoopProcessor))?;
    registry.register("log", Arc::new(LogProcessor))?;
    registry.register("set", Arc::new(SetProcessor))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(config: Value) -> TaskContext {
        TaskContext {
            instance_id: "i".into(),
            definition_id: "d".into(),
            node_id: "n".into(),
            config,
            context: serde_json::Map::new(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn set_emits_object_config() {
        let out = SetProcessor.execute(&ctx(json!({ "x": 3 }))).await.unwrap();
        assert_eq!(out, json!({ "x": 3 }));
    }

    #[tokio::test]
    async fn set_rejects_scalar_config() {
        let err = SetProcessor.execute(&ctx(json!(7))).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Fatal(_)));
    }

    #[test]
    fn builtins_register_once() {
        let registry = ProcessorRegistry::new();
        register_builtins(&registry).unwrap();
        assert!(registry.find("noop").is_some());
        assert!(registry.find("log").is_some());
        assert!(registry.find("set").is_some());
        assert!(register_builtins(&registry).is_err());
    }
}
