//! Run control surface.
//!
//! Owns the shared services (loader, dispatcher, worker pool) and a
//! registry of live run actors. `startRun` resolves and freezes the
//! definition, validates the input against the workflow's input schema,
//! and spawns the per-run actor; `cancelRun`/`getRun` talk to it through
//! its handle.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::info;

use crate::action::ActionExecutor;
use crate::actor::{spawn_run, ActorDeps, RunHandle, RunView, StartOptions};
use crate::dispatch::{
    EventDispatcher, SnapshotPolicy, Subscription, SubscriptionFilter, DEFAULT_SUBSCRIBER_CAPACITY,
};
use crate::error::CoordinatorError;
use crate::events::Stream;
use crate::executor::TaskExecutor;
use crate::loader::DefinitionLoader;
use crate::resource::ResourceService;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Concurrent task executions across all runs.
    pub worker_pool_size: usize,
    /// Per-subscriber channel capacity before disconnection.
    pub subscriber_capacity: usize,
    pub snapshot_policy: SnapshotPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            snapshot_policy: SnapshotPolicy::default(),
        }
    }
}

/// The workflow coordinator: definition loading, run actors, event fan-out.
pub struct Coordinator {
    resource: Arc<dyn ResourceService>,
    loader: DefinitionLoader,
    dispatcher: Arc<EventDispatcher>,
    workers: Arc<Semaphore>,
    executor: TaskExecutor,
    runs: DashMap<Arc<str>, RunHandle>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        resource: Arc<dyn ResourceService>,
        actions: Arc<dyn ActionExecutor>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            loader: DefinitionLoader::new(Arc::clone(&resource)),
            dispatcher: Arc::new(EventDispatcher::new(config.subscriber_capacity)),
            workers: Arc::new(Semaphore::new(config.worker_pool_size)),
            executor: TaskExecutor::new(actions),
            runs: DashMap::new(),
            resource,
            config,
        }
    }

    /// Resolve, validate, and launch a run. Returns its `runId`.
    pub async fn start_run(
        &self,
        reference: &str,
        version: Option<u32>,
        input: Value,
        options: StartOptions,
    ) -> Result<Arc<str>, CoordinatorError> {
        let def = self.loader.load(reference, version).await?;
        if let Some(schema) = &def.input_schema {
            schema.check(&input).map_err(CoordinatorError::InvalidInput)?;
        }

        let deps = ActorDeps {
            resource: Arc::clone(&self.resource),
            dispatcher: Arc::clone(&self.dispatcher),
            executor: self.executor.clone(),
            workers: Arc::clone(&self.workers),
            snapshot_policy: self.config.snapshot_policy.clone(),
        };
        let handle = spawn_run(def, input, options, deps);
        let run_id = Arc::clone(&handle.run_id);
        info!(run_id = %run_id, reference, "run launched");
        self.runs.insert(Arc::clone(&run_id), handle);
        Ok(run_id)
    }

    /// Request cancellation. Returns false for unknown runs.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.runs.get(run_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get_run(&self, run_id: &str) -> Option<RunView> {
        self.runs.get(run_id).map(|handle| handle.view())
    }

    /// Wait for a run to reach a terminal status.
    pub async fn wait(&self, run_id: &str) -> Option<RunView> {
        let handle = self.runs.get(run_id).map(|h| h.clone())?;
        Some(handle.wait().await)
    }

    /// Attach a subscriber to the `events` or `trace` stream.
    pub fn subscribe(&self, stream: Stream, filter: SubscriptionFilter) -> Subscription {
        self.dispatcher.subscribe(stream, filter)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.dispatcher.unsubscribe(id);
    }

    pub fn resource(&self) -> &Arc<dyn ResourceService> {
        &self.resource
    }
}
