//! Workflow execution.
//!
//! `WorkflowExecutor` drives one instance through its definition:
//! 1. Starts from the instance's active nodes and walks everything reachable
//!    from them.
//! 2. Dispatches ready nodes wave by wave; the nodes of one wave run
//!    concurrently on tokio tasks.
//! 3. Merges each processor's object output into the instance context, then
//!    evaluates the node's outgoing edges against that context.
//! 4. Retries `ProcessorError::Retryable` failures with exponential back-off
//!    and bounds every attempt with the node timeout.
//! 5. Applies the edge failure strategy when a node fails: `CONTINUE`
//!    evaluates the edges as if the node succeeded, `STOP` closes the edge,
//!    `FAIL` halts the instance.
//!
//! A node with several incoming edges waits for all of them to be resolved.
//! It runs if at least one was activated; otherwise it is skipped and the
//! skip propagates downstream.
//!
//! The executor never writes instance state itself. Progress, node events and
//! the final outcome go to an [`ExecutionObserver`] (the engine), which also
//! tells the executor whether the instance was paused or cancelled.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use processors::{ProcessorError, ProcessorRegistry, TaskContext, TaskProcessor};

use crate::cache::BoundedCache;
use crate::condition::ConditionEvaluator;
use crate::config::ExecutorConfig;
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::models::{FailureStrategy, WorkflowDefinition, WorkflowEdge};

/// Upper bound on remembered node results.
const IDEMPOTENCY_CACHE_SIZE: usize = 100_000;

// ---------------------------------------------------------------------------
// Execution log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeOutcome {
    Succeeded,
    Failed,
    /// Every incoming edge resolved without activation.
    Skipped,
    /// A result remembered from an earlier run of the same instance was reused.
    Cached,
    /// In flight when another node failed the instance.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: NodeOutcome,
    pub attempts: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// What happened during one `execute` call. Entries are in the order the
/// executor resolved the nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionLog {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub error_message: Option<String>,
    pub context: Map<String, Value>,
    pub entries: Vec<NodeExecutionRecord>,
}

impl ExecutionLog {
    pub fn entry(&self, node_id: &str) -> Option<&NodeExecutionRecord> {
        self.entries.iter().find(|e| e.node_id == node_id)
    }

    pub fn outcome(&self, node_id: &str) -> Option<NodeOutcome> {
        self.entry(node_id).map(|e| e.outcome)
    }

    /// Nodes whose processor produced a result (fresh or cached) or failed.
    pub fn executed_nodes(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.outcome,
                    NodeOutcome::Succeeded | NodeOutcome::Failed | NodeOutcome::Cached
                )
            })
            .map(|e| e.node_id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Receives progress from the executor and reports external state changes
/// back to it.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    /// Latest known status of the instance. `None` means "keep running".
    fn current_status(&self, _instance_id: &str) -> Option<InstanceStatus> {
        None
    }

    fn on_node_start(&self, _instance_id: &str, _node_id: &str) {}

    fn on_node_success(&self, _instance_id: &str, _node_id: &str) {}

    fn on_node_failure(&self, _instance_id: &str, _node_id: &str, _error: &str) {}

    /// Called after every wave with the nodes of the next wave.
    async fn on_progress(
        &self,
        _instance_id: &str,
        _active_nodes: &BTreeSet<String>,
        _context: &Map<String, Value>,
    ) {
    }

    /// Called once when the traversal ends, with the nodes that were still
    /// active at that point.
    async fn on_complete(&self, _log: &ExecutionLog, _active_nodes: &BTreeSet<String>) {}
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

pub struct WorkflowExecutor {
    registry: Arc<ProcessorRegistry>,
    conditions: Arc<dyn ConditionEvaluator>,
    config: ExecutorConfig,
    /// `instance:start:node` → output of a node that already succeeded. The
    /// start time keeps a restarted instance id from seeing earlier results.
    completed: BoundedCache<String, Value>,
}

struct NodeRun {
    result: Result<Value, ProcessorError>,
    attempts: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    cached: bool,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        conditions: Arc<dyn ConditionEvaluator>,
        config: ExecutorConfig,
    ) -> Self {
        let completed = BoundedCache::new(IDEMPOTENCY_CACHE_SIZE, config.idempotency_ttl);
        Self {
            registry,
            conditions,
            config,
            completed,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `instance` to completion (or until it fails, is cancelled, or the
    /// observer reports a terminal state).
    #[instrument(
        skip(self, definition, instance, observer),
        fields(instance_id = %instance.id(), definition_id = %definition.id())
    )]
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        observer: &dyn ExecutionObserver,
    ) -> ExecutionLog {
        let instance_id = instance.id();
        let mut traversal = Traversal::new(definition, instance);

        if instance.is_terminal() {
            info!("instance already {}; nothing to execute", instance.status());
            return traversal.into_log(instance_id, instance.status(), instance.error_message().map(str::to_owned));
        }

        let mut ready = traversal.start_nodes();
        let mut failure: Option<String> = None;
        let mut halted: Option<InstanceStatus> = None;
        let mut last_wave: BTreeSet<String> = BTreeSet::new();
        let mut wave = 0usize;

        while !ready.is_empty() {
            if let Some(status) = self.wait_while_paused(instance_id, observer).await {
                halted = Some(status);
                last_wave = ready.iter().map(|n| n.to_string()).collect();
                break;
            }

            traversal.order_wave(&mut ready);
            let batch = std::mem::take(&mut ready);
            last_wave = batch.iter().map(|n| n.to_string()).collect();
            debug!(wave, nodes = ?batch, "dispatching wave");

            if wave > 0 {
                for node_id in &batch {
                    observer.on_node_start(instance_id, node_id);
                }
            }

            let (mut runs, aborting) = self.dispatch_wave(&traversal, instance, &batch).await;

            for (idx, node_id) in batch.iter().copied().enumerate() {
                let run = runs[idx].take();
                let Some(run) = run else {
                    if aborting {
                        traversal.record(node_id, NodeOutcome::Aborted, None, None, 0, None, None);
                        continue;
                    }
                    // The task panicked; report it as a failure of the node.
                    let now = Utc::now();
                    let run = NodeRun {
                        result: Err(ProcessorError::Fatal("processor task panicked".into())),
                        attempts: 1,
                        started_at: now,
                        finished_at: now,
                        cached: false,
                    };
                    self.settle(&mut traversal, instance, node_id, run, &mut failure, &mut ready, observer);
                    continue;
                };
                self.settle(&mut traversal, instance, node_id, run, &mut failure, &mut ready, observer);
            }

            if failure.is_some() {
                break;
            }

            let next: BTreeSet<String> = ready.iter().map(|n| n.to_string()).collect();
            observer.on_progress(instance_id, &next, &traversal.context).await;
            wave += 1;
        }

        let (status, error_message, active) = match (failure, halted) {
            (Some(message), _) => (InstanceStatus::Failed, Some(message), last_wave),
            (None, Some(status)) => (status, None, last_wave),
            (None, None) => match observer.current_status(instance_id) {
                // Cancelled while the last wave was in flight.
                Some(status) if status.is_terminal() => (status, None, BTreeSet::new()),
                _ => (InstanceStatus::Succeeded, None, BTreeSet::new()),
            },
        };

        match status {
            InstanceStatus::Failed => error!(
                "instance finished FAILED: {}",
                error_message.as_deref().unwrap_or("unknown error")
            ),
            other => info!("instance finished {}", other),
        }

        let log = traversal.into_log(instance_id, status, error_message);
        observer.on_complete(&log, &active).await;
        log
    }

    /// Block while the observer reports `PAUSED`. Returns the status if the
    /// instance reached a terminal state meanwhile.
    async fn wait_while_paused(
        &self,
        instance_id: &str,
        observer: &dyn ExecutionObserver,
    ) -> Option<InstanceStatus> {
        let mut logged = false;
        loop {
            match observer.current_status(instance_id) {
                Some(InstanceStatus::Paused) => {
                    if !logged {
                        info!("instance paused; waiting");
                        logged = true;
                    }
                    tokio::time::sleep(self.config.pause_poll_interval).await;
                }
                Some(status) if status.is_terminal() => {
                    info!("instance became {}; stopping dispatch", status);
                    return Some(status);
                }
                _ => return None,
            }
        }
    }

    /// Run every node of `batch` and collect the results in batch order.
    ///
    /// If a node fails in a way that fails the whole instance, the tasks still
    /// in flight are aborted and the second return value is `true`; aborted
    /// nodes have no result.
    async fn dispatch_wave(
        &self,
        traversal: &Traversal<'_>,
        instance: &WorkflowInstance,
        batch: &[&str],
    ) -> (Vec<Option<NodeRun>>, bool) {
        let mut runs: Vec<Option<NodeRun>> = (0..batch.len()).map(|_| None).collect();
        let mut tasks: JoinSet<(usize, NodeRun)> = JoinSet::new();

        for (idx, node_id) in batch.iter().copied().enumerate() {
            if let Some(output) = self.completed.get(&idempotency_key(instance, node_id)) {
                debug!(node_id, "reusing remembered result");
                let now = Utc::now();
                runs[idx] = Some(NodeRun {
                    result: Ok(output),
                    attempts: 0,
                    started_at: now,
                    finished_at: now,
                    cached: true,
                });
                continue;
            }

            let Some(node) = traversal.definition.node(node_id) else {
                continue;
            };
            let processor = self.registry.find(&node.processor);
            let processor_name = node.processor.clone();
            let timeout = node
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.config.node_timeout);
            let ctx = TaskContext {
                instance_id: instance.id().to_owned(),
                definition_id: instance.definition_id().to_owned(),
                node_id: node_id.to_owned(),
                config: node.config.clone(),
                context: traversal.context.clone(),
                attempt: 0,
            };
            let max_retries = self.config.max_retries;
            let base_delay = self.config.retry_base_delay;

            tasks.spawn(async move {
                let run = run_with_retry(processor, processor_name, ctx, timeout, max_retries, base_delay).await;
                (idx, run)
            });
        }

        let mut aborting = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, run)) => {
                    if run.result.is_err() && traversal.fails_instance(batch[idx]) && !aborting {
                        aborting = true;
                        tasks.abort_all();
                    }
                    runs[idx] = Some(run);
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => error!("node task panicked: {}", err),
            }
        }
        (runs, aborting)
    }

    /// Record one node's result and resolve its outgoing edges.
    #[allow(clippy::too_many_arguments)]
    fn settle<'a>(
        &self,
        traversal: &mut Traversal<'a>,
        instance: &WorkflowInstance,
        node_id: &'a str,
        run: NodeRun,
        failure: &mut Option<String>,
        ready: &mut Vec<&'a str>,
        observer: &dyn ExecutionObserver,
    ) {
        let instance_id = instance.id();
        let definition = traversal.definition;
        match run.result {
            Ok(output) => {
                if !run.cached {
                    self.completed
                        .insert(idempotency_key(instance, node_id), output.clone());
                }
                if let Value::Object(fields) = &output {
                    for (key, value) in fields {
                        traversal.context.insert(key.clone(), value.clone());
                    }
                }
                let outcome = if run.cached {
                    NodeOutcome::Cached
                } else {
                    NodeOutcome::Succeeded
                };
                traversal.record(
                    node_id,
                    outcome,
                    Some(run.started_at),
                    Some(run.finished_at),
                    run.attempts,
                    Some(output),
                    None,
                );
                observer.on_node_success(instance_id, node_id);

                if failure.is_some() {
                    return;
                }
                for edge in definition.outgoing(node_id) {
                    let active = self.edge_active(edge, &traversal.context);
                    traversal.resolve_edge(edge, active, ready);
                }
            }
            Err(err) => {
                let message = err.to_string();
                error!(node_id, attempts = run.attempts, "node failed: {}", message);
                traversal.record(
                    node_id,
                    NodeOutcome::Failed,
                    Some(run.started_at),
                    Some(run.finished_at),
                    run.attempts,
                    None,
                    Some(message.clone()),
                );
                observer.on_node_failure(instance_id, node_id, &message);

                if failure.is_some() {
                    return;
                }
                if traversal.fails_instance(node_id) {
                    *failure = Some(format!("node '{node_id}' failed: {message}"));
                    return;
                }
                for edge in definition.outgoing(node_id) {
                    let active = match edge.failure_strategy() {
                        FailureStrategy::Continue => self.edge_active(edge, &traversal.context),
                        FailureStrategy::Stop | FailureStrategy::Fail => false,
                    };
                    traversal.resolve_edge(edge, active, ready);
                }
            }
        }
    }

    /// Unconditional edges are always active; a condition that cannot be
    /// evaluated counts as false.
    fn edge_active(&self, edge: &WorkflowEdge, context: &Map<String, Value>) -> bool {
        let Some(expression) = edge.condition() else {
            return true;
        };
        match self.conditions.evaluate(expression, context) {
            Ok(active) => active,
            Err(err) => {
                warn!(
                    from = edge.from(),
                    to = edge.to(),
                    "condition '{}' could not be evaluated: {}",
                    expression,
                    err
                );
                false
            }
        }
    }
}

fn idempotency_key(instance: &WorkflowInstance, node_id: &str) -> String {
    let started = instance
        .start_time()
        .map_or(0, |at| at.timestamp_micros());
    format!("{}:{}:{}", instance.id(), started, node_id)
}

async fn run_with_retry(
    processor: Option<Arc<dyn TaskProcessor>>,
    processor_name: String,
    mut ctx: TaskContext,
    timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
) -> NodeRun {
    let started_at = Utc::now();
    let Some(processor) = processor else {
        return NodeRun {
            result: Err(ProcessorError::NotFound(processor_name)),
            attempts: 0,
            started_at,
            finished_at: Utc::now(),
            cached: false,
        };
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        ctx.attempt = attempt;

        let result = match tokio::time::timeout(timeout, processor.execute(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ProcessorError::Timeout(timeout)),
        };

        match result {
            Err(err) if err.is_retryable() && attempt <= max_retries => {
                let delay = base_delay.saturating_mul(2u32.saturating_pow(attempt - 1));
                warn!(
                    "node '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                    ctx.node_id, attempt, max_retries, delay, err
                );
                tokio::time::sleep(delay).await;
            }
            result => {
                return NodeRun {
                    result,
                    attempts: attempt,
                    started_at,
                    finished_at: Utc::now(),
                    cached: false,
                };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Traversal state
// ---------------------------------------------------------------------------

struct Traversal<'a> {
    definition: &'a WorkflowDefinition,
    position: HashMap<&'a str, usize>,
    start: Vec<&'a str>,
    reachable: HashSet<&'a str>,
    /// Incoming edges (from reachable sources) not yet resolved.
    pending: HashMap<&'a str, usize>,
    /// Highest weight among the activated incoming edges.
    activated: HashMap<&'a str, f64>,
    /// Nodes already scheduled or skipped.
    resolved: HashSet<&'a str>,
    context: Map<String, Value>,
    entries: Vec<NodeExecutionRecord>,
}

impl<'a> Traversal<'a> {
    fn new(definition: &'a WorkflowDefinition, instance: &WorkflowInstance) -> Self {
        let position: HashMap<&str, usize> = definition
            .nodes()
            .iter()
            .enumerate()
            .map(|(idx, n)| (n.id.as_str(), idx))
            .collect();

        let start: Vec<&str> = definition
            .nodes()
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| instance.active_nodes().contains(*id))
            .collect();
        for unknown in instance
            .active_nodes()
            .iter()
            .filter(|id| !position.contains_key(id.as_str()))
        {
            warn!(node_id = %unknown, "active node is not part of the definition; ignoring");
        }

        let mut reachable: HashSet<&str> = start.iter().copied().collect();
        let mut queue: VecDeque<&str> = start.iter().copied().collect();
        while let Some(node_id) = queue.pop_front() {
            for edge in definition.outgoing(node_id) {
                if reachable.insert(edge.to()) {
                    queue.push_back(edge.to());
                }
            }
        }

        let start_set: HashSet<&str> = start.iter().copied().collect();
        let mut pending: HashMap<&str, usize> = HashMap::new();
        for edge in definition.edges() {
            if reachable.contains(edge.from()) && !start_set.contains(edge.to()) {
                *pending.entry(edge.to()).or_insert(0) += 1;
            }
        }

        Self {
            definition,
            position,
            resolved: start_set,
            start,
            reachable,
            pending,
            activated: HashMap::new(),
            context: instance.context().clone(),
            entries: Vec::new(),
        }
    }

    fn start_nodes(&self) -> Vec<&'a str> {
        self.start.clone()
    }

    /// Highest activated incoming weight first, then declaration order.
    fn order_wave(&self, wave: &mut [&'a str]) {
        wave.sort_by(|a, b| {
            let wa = self.activated.get(a).copied().unwrap_or(0.0);
            let wb = self.activated.get(b).copied().unwrap_or(0.0);
            wb.partial_cmp(&wa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.position.get(a).cmp(&self.position.get(b)))
        });
    }

    /// A failure fails the instance when the node has no outgoing edges or at
    /// least one outgoing edge uses `FAIL`.
    fn fails_instance(&self, node_id: &str) -> bool {
        let mut outgoing = self.definition.outgoing(node_id).peekable();
        outgoing.peek().is_none()
            || outgoing.any(|e| e.failure_strategy() == FailureStrategy::Fail)
    }

    fn resolve_edge(&mut self, edge: &'a WorkflowEdge, active: bool, ready: &mut Vec<&'a str>) {
        let target = edge.to();
        if self.resolved.contains(target) || !self.reachable.contains(target) {
            return;
        }
        if active {
            let weight = self.activated.entry(target).or_insert(edge.weight());
            if edge.weight() > *weight {
                *weight = edge.weight();
            }
        }

        let Some(remaining) = self.pending.get_mut(target) else {
            return;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return;
        }

        self.resolved.insert(target);
        if self.activated.contains_key(target) {
            ready.push(target);
        } else {
            self.skip(target, ready);
        }
    }

    fn skip(&mut self, node_id: &'a str, ready: &mut Vec<&'a str>) {
        debug!(node_id, "no incoming edge activated; skipping");
        self.record(node_id, NodeOutcome::Skipped, None, None, 0, None, None);
        let definition = self.definition;
        for edge in definition.outgoing(node_id) {
            self.resolve_edge(edge, false, ready);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &mut self,
        node_id: &str,
        outcome: NodeOutcome,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        attempts: u32,
        output: Option<Value>,
        error: Option<String>,
    ) {
        self.entries.push(NodeExecutionRecord {
            node_id: node_id.to_owned(),
            started_at,
            finished_at,
            outcome,
            attempts,
            output,
            error,
        });
    }

    fn into_log(self, instance_id: &str, status: InstanceStatus, error_message: Option<String>) -> ExecutionLog {
        ExecutionLog {
            instance_id: instance_id.to_owned(),
            status,
            error_message,
            context: self.context,
            entries: self.entries,
        }
    }
}
