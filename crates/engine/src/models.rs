//! Workflow graph model: nodes, edges and the immutable definition.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory. They serialise to/from JSON; deserialisation goes through the same
//! validating constructors as code, so a definition that parsed is
//! structurally sound (unique node IDs, known edge endpoints, positive
//! weights). Acyclicity is checked separately by [`WorkflowDefinition::validate_topology`].

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sorter::{self, TopologyResult};
use crate::EngineError;

// ---------------------------------------------------------------------------
// WorkflowNode
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique identifier within this definition (referenced by edges).
    pub id: String,
    /// Name of the registered `TaskProcessor` that performs this step.
    pub processor: String,
    /// Arbitrary configuration handed to the processor at execution time.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Per-node override of the executor's node timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, processor: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            processor: processor.into(),
            config: serde_json::Value::Null,
            timeout_ms: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

// ---------------------------------------------------------------------------
// FailureStrategy
// ---------------------------------------------------------------------------

/// How a failure of an edge's source node affects the edge's target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    /// Ignore the failure; the edge is evaluated as if the source succeeded.
    Continue,
    /// Fail the whole instance and halt every branch.
    #[default]
    Fail,
    /// Halt this branch only.
    Stop,
}

impl fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "CONTINUE"),
            Self::Fail => write!(f, "FAIL"),
            Self::Stop => write!(f, "STOP"),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEdge
// ---------------------------------------------------------------------------

/// Directed dependency `from → to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEdge")]
pub struct WorkflowEdge {
    from: String,
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    condition: Option<String>,
    weight: f64,
    failure_strategy: FailureStrategy,
}

impl WorkflowEdge {
    pub fn builder(from: impl Into<String>, to: impl Into<String>) -> WorkflowEdgeBuilder {
        WorkflowEdgeBuilder {
            from: from.into(),
            to: to.into(),
            condition: None,
            weight: 1.0,
            failure_strategy: FailureStrategy::default(),
        }
    }

    /// Unconditional edge with default weight and strategy.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            weight: 1.0,
            failure_strategy: FailureStrategy::default(),
        }
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn failure_strategy(&self) -> FailureStrategy {
        self.failure_strategy
    }
}

/// Fluent builder for [`WorkflowEdge`]; `build` rejects non-positive weights.
#[derive(Debug, Clone)]
pub struct WorkflowEdgeBuilder {
    from: String,
    to: String,
    condition: Option<String>,
    weight: f64,
    failure_strategy: FailureStrategy,
}

impl WorkflowEdgeBuilder {
    /// Blank expressions are treated as "no condition".
    pub fn condition(mut self, expression: impl Into<String>) -> Self {
        let expression = expression.into();
        self.condition = if expression.trim().is_empty() {
            None
        } else {
            Some(expression)
        };
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    pub fn build(self) -> Result<WorkflowEdge, EngineError> {
        if !(self.weight.is_finite() && self.weight > 0.0) {
            return Err(EngineError::InvalidEdgeWeight {
                from: self.from,
                to: self.to,
                weight: self.weight,
            });
        }
        Ok(WorkflowEdge {
            from: self.from,
            to: self.to,
            condition: self.condition,
            weight: self.weight,
            failure_strategy: self.failure_strategy,
        })
    }
}

/// Wire shape of an edge; routed through the builder on deserialisation.
#[derive(Deserialize)]
struct RawEdge {
    from: String,
    to: String,
    #[serde(default, alias = "condition_expression")]
    condition: Option<String>,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default)]
    failure_strategy: FailureStrategy,
}

fn default_weight() -> f64 {
    1.0
}

impl TryFrom<RawEdge> for WorkflowEdge {
    type Error = EngineError;

    fn try_from(raw: RawEdge) -> Result<Self, Self::Error> {
        let mut builder = WorkflowEdge::builder(raw.from, raw.to)
            .weight(raw.weight)
            .failure_strategy(raw.failure_strategy);
        if let Some(condition) = raw.condition {
            builder = builder.condition(condition);
        }
        builder.build()
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// An identified, immutable workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDefinition")]
pub struct WorkflowDefinition {
    id: String,
    name: String,
    nodes: Vec<WorkflowNode>,
    edges: Vec<WorkflowEdge>,
}

impl WorkflowDefinition {
    /// Build a definition, enforcing:
    /// 1. Node IDs are unique.
    /// 2. Every edge references declared node IDs on both sides.
    ///
    /// Edge weights are already guaranteed positive by [`WorkflowEdge`].
    ///
    /// # Errors
    /// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
    /// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        nodes: Vec<WorkflowNode>,
        edges: Vec<WorkflowEdge>,
    ) -> Result<Self, EngineError> {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        for node in &nodes {
            if !seen_ids.insert(node.id.as_str()) {
                return Err(EngineError::DuplicateNodeId(node.id.clone()));
            }
        }

        for edge in &edges {
            if !seen_ids.contains(edge.from()) {
                return Err(EngineError::UnknownNodeReference {
                    node_id: edge.from().to_owned(),
                    side: "from",
                });
            }
            if !seen_ids.contains(edge.to()) {
                return Err(EngineError::UnknownNodeReference {
                    node_id: edge.to().to_owned(),
                    side: "to",
                });
            }
        }

        Ok(Self {
            id: id.into(),
            name: name.into(),
            nodes,
            edges,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[WorkflowEdge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of `node_id`, in declaration order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> + 'a {
        self.edges.iter().filter(move |e| e.from() == node_id)
    }

    /// Run the topological sorter over this definition.
    pub fn validate_topology(&self) -> TopologyResult {
        sorter::sort(&self.nodes, &self.edges)
    }
}

#[derive(Deserialize)]
struct RawDefinition {
    id: String,
    name: String,
    nodes: Vec<WorkflowNode>,
    #[serde(default)]
    edges: Vec<WorkflowEdge>,
}

impl TryFrom<RawDefinition> for WorkflowDefinition {
    type Error = EngineError;

    fn try_from(raw: RawDefinition) -> Result<Self, Self::Error> {
        WorkflowDefinition::new(raw.id, raw.name, raw.nodes, raw.edges)
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn edge_builder_defaults() {
        let edge = WorkflowEdge::builder("a", "b").build().unwrap();
        assert_eq!(edge.weight(), 1.0);
        assert_eq!(edge.failure_strategy(), FailureStrategy::Fail);
        assert!(!edge.is_conditional());
    }

    #[test]
    fn edge_builder_rejects_non_positive_weight() {
        for weight in [0.0, -1.5, f64::NAN] {
            let result = WorkflowEdge::builder("a", "b").weight(weight).build();
            assert!(matches!(result, Err(EngineError::InvalidEdgeWeight { .. })));
        }
    }

    #[test]
    fn blank_condition_is_unconditional() {
        let edge = WorkflowEdge::builder("a", "b").condition("   ").build().unwrap();
        assert!(!edge.is_conditional());
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let result = WorkflowDefinition::new(
            "wf",
            "test",
            vec![WorkflowNode::new("a", "noop"), WorkflowNode::new("a", "noop")],
            vec![],
        );
        assert!(matches!(result, Err(EngineError::DuplicateNodeId(id)) if id == "a"));
    }

    #[test]
    fn edge_referencing_missing_node_is_rejected() {
        let result = WorkflowDefinition::new(
            "wf",
            "test",
            vec![WorkflowNode::new("a", "noop")],
            vec![WorkflowEdge::new("a", "ghost")],
        );
        assert!(matches!(
            result,
            Err(EngineError::UnknownNodeReference { node_id, side: "to" }) if node_id == "ghost"
        ));
    }

    #[test]
    fn definition_deserialises_through_validation() {
        let raw = json!({
            "id": "approval",
            "name": "Approval flow",
            "nodes": [
                { "id": "check", "processor": "set", "config": { "amount": 10 } },
                { "id": "approve", "processor": "noop" }
            ],
            "edges": [
                { "from": "check", "to": "approve", "condition": "amount > 5",
                  "weight": 2.0, "failure_strategy": "STOP" }
            ]
        });

        let def: WorkflowDefinition = serde_json::from_value(raw).expect("valid definition");
        let edge = &def.edges()[0];
        assert_eq!(edge.condition(), Some("amount > 5"));
        assert_eq!(edge.weight(), 2.0);
        assert_eq!(edge.failure_strategy(), FailureStrategy::Stop);

        let bad = json!({
            "id": "x", "name": "x",
            "nodes": [{ "id": "a", "processor": "noop" }],
            "edges": [{ "from": "a", "to": "a", "weight": 0 }]
        });
        assert!(serde_json::from_value::<WorkflowDefinition>(bad).is_err());
    }
}
