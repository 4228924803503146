//! `WorkflowEngine`: the orchestration entry point.
//!
//! The engine owns the definition and instance caches, the listener registry
//! and the executor. It validates and registers definitions, creates
//! instances, drives lifecycle transitions, and keeps the durable store in
//! step with the cache:
//!
//! - starting an instance persists it best-effort (a store outage is logged
//!   and the instance keeps running in memory);
//! - `update_workflow_status` writes through, and the cache only changes if
//!   the store accepted the write.
//!
//! All methods take `&self` and are safe to call concurrently. Per-instance
//! read-modify-write operations go through [`BoundedCache::compute`], so two
//! callers racing on the same instance never lose an update.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use processors::TaskProcessor;

use crate::cache::BoundedCache;
use crate::config::EngineConfig;
use crate::executor::{ExecutionLog, ExecutionObserver, WorkflowExecutor};
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::listener::{ListenerRegistry, WorkflowEventListener};
use crate::models::WorkflowDefinition;
use crate::persistence::WorkflowPersistence;
use crate::sorter::TopologyResult;
use crate::EngineError;

pub struct WorkflowEngine {
    config: EngineConfig,
    executor: WorkflowExecutor,
    persistence: Arc<dyn WorkflowPersistence>,
    definitions: BoundedCache<String, Arc<WorkflowDefinition>>,
    instances: BoundedCache<String, WorkflowInstance>,
    /// Instances whose active nodes were already announced by `start_workflow`.
    announced: BoundedCache<String, ()>,
    listeners: ListenerRegistry,
    run_slots: Semaphore,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        executor: WorkflowExecutor,
        persistence: Arc<dyn WorkflowPersistence>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        info!(
            "Workflow engine ready (definitions: max {} / ttl {:?}, instances: max {} / ttl {:?}, concurrency {})",
            config.definition_cache_max_size,
            config.definition_cache_ttl(),
            config.instance_cache_max_size,
            config.instance_cache_ttl(),
            config.max_concurrent_instances
        );
        Ok(Self {
            definitions: BoundedCache::new(config.definition_cache_max_size, config.definition_cache_ttl()),
            instances: BoundedCache::new(config.instance_cache_max_size, config.instance_cache_ttl()),
            announced: BoundedCache::new(config.instance_cache_max_size, config.instance_cache_ttl()),
            run_slots: Semaphore::new(config.max_concurrent_instances),
            listeners: ListenerRegistry::new(),
            config,
            executor,
            persistence,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and register a definition.
    ///
    /// # Errors
    /// - [`EngineError::CyclicGraph`] if the graph cannot be ordered.
    /// - [`EngineError::DuplicateDefinition`] if the id is already registered;
    ///   the registered definition is left unchanged.
    #[instrument(skip(self, definition), fields(definition_id = %definition.id()))]
    pub fn create_workflow(&self, definition: WorkflowDefinition) -> Result<Arc<WorkflowDefinition>, EngineError> {
        definition.validate_topology().ensure_acyclic()?;

        let id = definition.id().to_owned();
        let definition = Arc::new(definition);
        self.definitions
            .insert_if_absent(id.clone(), Arc::clone(&definition))
            .map_err(|_| EngineError::DuplicateDefinition(id))?;

        info!(
            "registered workflow '{}' ({} nodes, {} edges)",
            definition.name(),
            definition.nodes().len(),
            definition.edges().len()
        );
        Ok(definition)
    }

    /// Topology check without registering anything.
    pub fn validate_workflow(&self, definition: &WorkflowDefinition) -> TopologyResult {
        definition.validate_topology()
    }

    pub fn get_definition(&self, definition_id: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.definitions
            .get(definition_id)
            .ok_or_else(|| EngineError::UnknownDefinition(definition_id.to_owned()))
    }

    // -----------------------------------------------------------------------
    // Instance lifecycle
    // -----------------------------------------------------------------------

    /// Start an instance under a generated id.
    pub async fn start_workflow(
        &self,
        definition_id: &str,
        params: Option<Map<String, Value>>,
    ) -> Result<WorkflowInstance, EngineError> {
        self.start_workflow_with_id(Uuid::new_v4().to_string(), definition_id, params)
            .await
    }

    /// Start an instance under `instance_id`. A cached instance with the same
    /// id is replaced.
    #[instrument(skip(self, instance_id, params), fields(instance_id = tracing::field::Empty))]
    pub async fn start_workflow_with_id(
        &self,
        instance_id: impl Into<String>,
        definition_id: &str,
        params: Option<Map<String, Value>>,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance_id = instance_id.into();
        tracing::Span::current().record("instance_id", instance_id.as_str());

        let definition = self.get_definition(definition_id)?;
        let topology = definition.validate_topology().ensure_acyclic()?;
        let initial = topology.initial_nodes().to_vec();

        let instance = WorkflowInstance::builder(instance_id.clone(), definition.id())
            .status(InstanceStatus::Running)
            .active_nodes(initial.iter().cloned())
            .context(params.unwrap_or_default())
            .start_time(Utc::now())
            .build();

        if self.instances.insert(instance_id.clone(), instance.clone()).is_some() {
            warn!("replaced a cached instance with the same id");
        }

        if let Err(err) = self.persistence.save(&instance).await {
            error!("failed to persist new instance; continuing in memory: {}", err);
        }

        info!("started instance with initial nodes {:?}", initial);
        for node_id in &initial {
            self.listeners.notify_node_start(&instance_id, node_id);
        }
        self.announced.insert(instance_id, ());
        Ok(instance)
    }

    /// `RUNNING → PAUSED`.
    pub fn pause_workflow(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
        self.transition(instance_id, InstanceStatus::Running, InstanceStatus::Paused)
    }

    /// `PAUSED → RUNNING`.
    pub fn resume_workflow(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
        self.transition(instance_id, InstanceStatus::Paused, InstanceStatus::Running)
    }

    /// Move a non-terminal instance to `CANCELLED`. Terminal instances are
    /// returned unchanged.
    pub fn cancel_workflow(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
        let cancelled = self
            .instances
            .compute(instance_id, |current| {
                if current.is_terminal() {
                    return Ok::<_, Infallible>(current.clone());
                }
                Ok(current.with_status(
                    InstanceStatus::Cancelled,
                    current.error_message().map(str::to_owned),
                    Some(Utc::now()),
                    current.active_nodes().clone(),
                ))
            })
            .and_then(Result::ok)
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_owned()))?;
        info!(instance_id, "instance is {}", cancelled.status());
        Ok(cancelled)
    }

    /// Cached instance state. Does not fall back to the store; see
    /// [`WorkflowEngine::restore_workflow_instance`].
    pub fn get_status(&self, instance_id: &str) -> Result<WorkflowInstance, EngineError> {
        self.instances
            .get(instance_id)
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_owned()))
    }

    fn transition(
        &self,
        instance_id: &str,
        expected: InstanceStatus,
        target: InstanceStatus,
    ) -> Result<WorkflowInstance, EngineError> {
        let updated = self
            .instances
            .compute(instance_id, |current| {
                if current.status() != expected {
                    return Err(EngineError::InvalidStateTransition {
                        expected,
                        actual: current.status(),
                    });
                }
                Ok(current.with_status(
                    target,
                    current.error_message().map(str::to_owned),
                    current.end_time(),
                    current.active_nodes().clone(),
                ))
            })
            .unwrap_or_else(|| Err(EngineError::UnknownInstance(instance_id.to_owned())))?;
        info!(instance_id, "instance {} -> {}", expected, target);
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Processors and listeners
    // -----------------------------------------------------------------------

    pub fn register_processor(
        &self,
        name: &str,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), EngineError> {
        self.executor.registry().register(name, processor)?;
        Ok(())
    }

    /// Returns `false` if the listener was already registered.
    pub fn register_event_listener(&self, listener: Arc<dyn WorkflowEventListener>) -> bool {
        self.listeners.register(listener)
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn WorkflowEventListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn on_node_start(&self, instance_id: &str, node_id: &str) {
        self.listeners.notify_node_start(instance_id, node_id);
    }

    pub fn on_node_success(&self, instance_id: &str, node_id: &str) {
        self.listeners.notify_node_success(instance_id, node_id);
    }

    pub fn on_node_failure(&self, instance_id: &str, node_id: &str, error: &str) {
        self.listeners.notify_node_failure(instance_id, node_id, error);
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Hand `instance` to the executor. At most `max_concurrent_instances`
    /// runs proceed at once; the rest wait for a slot.
    ///
    /// Active nodes not announced by `start_workflow` (restored, recovered or
    /// re-run instances) get their `on_node_start` here.
    ///
    /// # Errors
    /// - [`EngineError::DefinitionMismatch`] if `instance` belongs to another
    ///   definition.
    /// - [`EngineError::CyclicGraph`] if `definition` cannot be ordered.
    /// - [`EngineError::Shutdown`] once [`WorkflowEngine::shutdown`] was called.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
    ) -> Result<ExecutionLog, EngineError> {
        if instance.definition_id() != definition.id() {
            return Err(EngineError::DefinitionMismatch {
                instance_id: instance.id().to_owned(),
                expected: instance.definition_id().to_owned(),
                actual: definition.id().to_owned(),
            });
        }
        definition.validate_topology().ensure_acyclic()?;

        let _slot = self
            .run_slots
            .acquire()
            .await
            .map_err(|_| EngineError::Shutdown)?;

        if self.announced.remove(instance.id()).is_none() && !instance.is_terminal() {
            for node_id in instance.active_nodes() {
                self.listeners.notify_node_start(instance.id(), node_id);
            }
        }
        Ok(self.executor.execute(definition, instance, self).await)
    }

    /// Look up a cached instance and its definition, then [`run`](Self::run) it.
    pub async fn run_instance(&self, instance_id: &str) -> Result<ExecutionLog, EngineError> {
        let instance = self.get_status(instance_id)?;
        let definition = self.get_definition(instance.definition_id())?;
        self.run(&definition, &instance).await
    }

    /// Stop admitting new runs. Runs already executing finish normally.
    pub fn shutdown(&self) {
        self.run_slots.close();
        info!("workflow engine shut down; no new runs admitted");
    }

    pub fn is_shutdown(&self) -> bool {
        self.run_slots.is_closed()
    }

    // -----------------------------------------------------------------------
    // Persistence and recovery
    // -----------------------------------------------------------------------

    /// Load an instance from the store into the cache.
    #[instrument(skip(self))]
    pub async fn restore_workflow_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, EngineError> {
        let Some(instance) = self.persistence.restore(instance_id).await? else {
            info!("instance not found in store");
            return Ok(None);
        };
        self.instances.insert(instance_id.to_owned(), instance.clone());
        info!("restored instance ({})", instance.status());
        Ok(Some(instance))
    }

    /// Write a status change to the store, then to the cache.
    ///
    /// Returns `false` (and leaves the cache alone) if the store has no such
    /// instance.
    ///
    /// # Errors
    /// [`EngineError::PersistenceUnavailable`] if the store call fails; the
    /// cache is not touched.
    #[instrument(skip(self, error_message))]
    pub async fn update_workflow_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        error_message: Option<&str>,
    ) -> Result<bool, EngineError> {
        let end_time = status.is_terminal().then(Utc::now);
        let stored = self
            .persistence
            .update_status(instance_id, status, end_time, error_message)
            .await?;
        if !stored {
            warn!("store has no such instance; cache left unchanged");
            return Ok(false);
        }

        let _ = self.instances.compute(instance_id, |current| {
            Ok::<_, Infallible>(current.with_status(
                status,
                error_message.map(str::to_owned),
                end_time,
                current.active_nodes().clone(),
            ))
        });
        Ok(true)
    }

    /// Best-effort snapshot of a cached instance. Returns whether it was
    /// stored.
    pub async fn persist_workflow_instance(&self, instance_id: &str) -> bool {
        let Some(instance) = self.instances.get(instance_id) else {
            warn!(instance_id, "cannot persist unknown instance");
            return false;
        };
        self.save_best_effort(&instance).await
    }

    /// Purge terminal instances that ended more than `expire_after` ago from
    /// the store. The cache is left to expire on its own.
    pub async fn cleanup_expired_instances(&self, expire_after: Duration) -> Result<u64, EngineError> {
        let age = chrono::Duration::from_std(expire_after)
            .map_err(|_| EngineError::InvalidConfig(format!("expiry {expire_after:?} is out of range")))?;
        let cutoff = Utc::now() - age;
        let removed = self.persistence.cleanup_expired_instances(cutoff).await?;
        info!("removed {} expired instances (ended before {})", removed, cutoff);
        Ok(removed)
    }

    /// Startup hook: load every RUNNING or PAUSED instance from the store into
    /// the cache. Returns how many were recovered.
    pub async fn recover_running_instances(&self) -> Result<usize, EngineError> {
        let recoverable = self.persistence.find_recoverable().await?;
        let count = recoverable.len();
        for instance in recoverable {
            self.instances.insert(instance.id().to_owned(), instance);
        }
        info!("recovered {} running/paused instances", count);
        Ok(count)
    }

    async fn save_best_effort(&self, instance: &WorkflowInstance) -> bool {
        match self.persistence.save(instance).await {
            Ok(()) => true,
            Err(err) => {
                error!(instance_id = instance.id(), "failed to persist instance: {}", err);
                false
            }
        }
    }
}

#[async_trait]
impl ExecutionObserver for WorkflowEngine {
    fn current_status(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.instances.get(instance_id).map(|i| i.status())
    }

    fn on_node_start(&self, instance_id: &str, node_id: &str) {
        self.listeners.notify_node_start(instance_id, node_id);
    }

    fn on_node_success(&self, instance_id: &str, node_id: &str) {
        self.listeners.notify_node_success(instance_id, node_id);
    }

    fn on_node_failure(&self, instance_id: &str, node_id: &str, error: &str) {
        self.listeners.notify_node_failure(instance_id, node_id, error);
    }

    async fn on_progress(
        &self,
        instance_id: &str,
        active_nodes: &BTreeSet<String>,
        context: &Map<String, Value>,
    ) {
        let updated = self
            .instances
            .compute(instance_id, |current| {
                if current.is_terminal() {
                    return Ok::<_, Infallible>(current.clone());
                }
                Ok(current
                    .to_builder()
                    .active_nodes(active_nodes.iter().cloned())
                    .context(context.clone())
                    .build())
            })
            .and_then(Result::ok);
        if let Some(instance) = updated {
            self.save_best_effort(&instance).await;
        }
    }

    /// Apply the outcome unless the instance already reached a terminal state
    /// (for example it was cancelled mid-run).
    async fn on_complete(&self, log: &ExecutionLog, active_nodes: &BTreeSet<String>) {
        let now = Utc::now();
        let updated = self
            .instances
            .compute(&log.instance_id, |current| {
                if current.is_terminal() {
                    return Ok::<_, Infallible>(current.clone());
                }
                Ok(current
                    .with_status(log.status, log.error_message.clone(), Some(now), active_nodes.clone())
                    .to_builder()
                    .context(log.context.clone())
                    .build())
            })
            .and_then(Result::ok);

        match updated {
            Some(instance) => {
                self.save_best_effort(&instance).await;
            }
            None => {
                warn!(instance_id = %log.instance_id, "instance left the cache during execution; updating store only");
                if let Err(err) = self
                    .persistence
                    .update_status(&log.instance_id, log.status, Some(now), log.error_message.as_deref())
                    .await
                {
                    error!(instance_id = %log.instance_id, "failed to persist outcome: {}", err);
                }
            }
        }
    }
}
