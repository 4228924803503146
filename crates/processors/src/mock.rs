//! `MockProcessor`: a test double for `TaskProcessor`.
//!
//! Useful in unit and integration tests where a real processor is either
//! unavailable or irrelevant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::{ProcessorError, TaskContext, TaskProcessor};

/// Behaviour injected into `MockProcessor` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail retryably for the first `failures` calls, then return the value.
    Flaky { failures: usize, value: Value },
    /// Sleep before returning the value.
    Delayed { delay: Duration, value: Value },
}

/// A mock processor that records every context it receives and returns a
/// programmer-specified result.
pub struct MockProcessor {
    /// Label used in test assertions and in the returned output.
    pub name: String,
    /// What the processor will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All contexts seen by this processor (in call order).
    pub calls: Arc<Mutex<Vec<TaskContext>>>,
}

impl MockProcessor {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails retryably `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::Flaky { failures, value })
    }

    /// Create a mock that sleeps for `delay` before succeeding.
    pub fn delayed(name: impl Into<String>, delay: Duration, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::Delayed { delay, value })
    }

    /// Number of times this processor has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Node IDs of every call, in call order.
    pub fn called_nodes(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.node_id.clone()).collect()
    }

    /// Tag the configured value with this mock's name so tests can trace
    /// which processor produced an output.
    fn output(&self, value: &Value) -> Value {
        let mut out = json!({ "processor": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl TaskProcessor for MockProcessor {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, ProcessorError> {
        let call_index = {
            let mut calls = self.calls.lock();
            calls.push(ctx.clone());
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.output(v)),
            MockBehaviour::FailRetryable(msg) => Err(ProcessorError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(ProcessorError::Fatal(msg.clone())),
            MockBehaviour::Flaky { failures, value } => {
                if call_index <= *failures {
                    Err(ProcessorError::Retryable(format!("{} flaked (call {call_index})", self.name)))
                } else {
                    Ok(self.output(value))
                }
            }
            MockBehaviour::Delayed { delay, value } => {
                tokio::time::sleep(*delay).await;
                Ok(self.output(value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(node_id: &str) -> TaskContext {
        TaskContext {
            instance_id: "inst-1".into(),
            definition_id: "def-1".into(),
            node_id: node_id.into(),
            config: Value::Null,
            context: serde_json::Map::new(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn returning_mock_tags_output_and_records_calls() {
        let mock = MockProcessor::returning("a", json!({ "step": 1 }));
        let out = mock.execute(&ctx("node_a")).await.expect("mock succeeds");

        assert_eq!(out["processor"], "a");
        assert_eq!(out["step"], 1);
        assert_eq!(mock.called_nodes(), vec!["node_a"]);
    }

    #[tokio::test]
    async fn flaky_mock_recovers_after_configured_failures() {
        let mock = MockProcessor::flaky("f", 2, json!({}));
        assert!(mock.execute(&ctx("n")).await.unwrap_err().is_retryable());
        assert!(mock.execute(&ctx("n")).await.unwrap_err().is_retryable());
        assert!(mock.execute(&ctx("n")).await.is_ok());
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn fatal_mock_is_not_retryable() {
        let mock = MockProcessor::failing_fatal("boom", "broken");
        let err = mock.execute(&ctx("n")).await.unwrap_err();
        assert_eq!(err, ProcessorError::Fatal("broken".into()));
        assert!(!err.is_retryable());
    }
}
