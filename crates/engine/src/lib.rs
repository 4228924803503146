//! `engine` crate: workflow graph model, topological validation, instance
//! lifecycle, caching, persistence contract and the execution engine.

pub mod cache;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod instance;
pub mod listener;
pub mod models;
pub mod persistence;
pub mod sorter;

pub use cache::BoundedCache;
pub use condition::{ConditionError, ConditionEvaluator, SimpleConditionEvaluator};
pub use config::{EngineConfig, ExecutorConfig};
pub use engine::WorkflowEngine;
pub use error::EngineError;
pub use executor::{ExecutionLog, ExecutionObserver, NodeExecutionRecord, NodeOutcome, WorkflowExecutor};
pub use instance::{InstanceStatus, WorkflowInstance, WorkflowInstanceBuilder};
pub use listener::{ListenerRegistry, WorkflowEventListener};
pub use models::{FailureStrategy, WorkflowDefinition, WorkflowEdge, WorkflowEdgeBuilder, WorkflowNode};
pub use persistence::{MemoryPersistence, PgPersistence, WorkflowPersistence};
pub use sorter::TopologyResult;
