//! Run actor: the logically single-threaded owner of one run.
//!
//! All token, context, and barrier mutation for a run happens inside this
//! actor's message loop, so every mutation caused by one message is atomic
//! from the actor's perspective. Task execution is the only work that
//! leaves the actor: it is spawned onto the shared worker pool (bounded by
//! a semaphore) and re-enters through the inbox as a `TaskFinished`
//! message. Late results for tokens that were cancelled or timed out are
//! dropped with a `late_result` trace event.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::context::ContextStore;
use crate::dispatch::{EventDispatcher, EventSink, SnapshotPolicy};
use crate::error::{FailureKind, TaskFailure};
use crate::events::{EventPayload, Stream};
use crate::executor::TaskExecutor;
use crate::jsonpath;
use crate::loader::Definition;
use crate::resource::{ResourceService, RunRecord, RunStatus};
use crate::router::Router;
use crate::token::{TokenId, TokenManager, TokenStatus};

/// The actor's inbox. Run construction seeds the root token directly;
/// everything afterwards arrives here.
#[derive(Debug)]
pub enum ActorMsg {
    /// A worker picked the token up from the pool.
    TaskStarted { token_id: TokenId },
    /// A worker finished (or failed) the token's task.
    TaskFinished { token_id: TokenId, result: Result<Value, TaskFailure> },
    /// External cancellation.
    Cancel,
    /// Persist `(context, activeTokens)` to the resource service now.
    PersistSnapshot,
}

/// Externally observable run state, published through a watch channel.
#[derive(Debug, Clone)]
pub struct RunView {
    pub run_id: Arc<str>,
    pub status: RunStatus,
    pub failure: Option<TaskFailure>,
    pub output: Option<Value>,
}

/// Handle to a spawned run actor.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: Arc<str>,
    tx: mpsc::UnboundedSender<ActorMsg>,
    status: watch::Receiver<RunView>,
}

impl RunHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(ActorMsg::Cancel);
    }

    pub fn persist_snapshot(&self) {
        let _ = self.tx.send(ActorMsg::PersistSnapshot);
    }

    pub fn view(&self) -> RunView {
        self.status.borrow().clone()
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait(&self) -> RunView {
        let mut rx = self.status.clone();
        loop {
            {
                let view = rx.borrow().clone();
                if view.status.is_terminal() {
                    return view;
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

/// Options accepted by the run control surface.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub parent_run_id: Option<String>,
    pub parent_token_id: Option<String>,
    pub enable_trace_events: bool,
    pub timeout_ms: Option<u64>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            parent_run_id: None,
            parent_token_id: None,
            enable_trace_events: true,
            timeout_ms: None,
        }
    }
}

/// Shared services injected into every run actor.
#[derive(Clone)]
pub struct ActorDeps {
    pub resource: Arc<dyn ResourceService>,
    pub dispatcher: Arc<EventDispatcher>,
    pub executor: TaskExecutor,
    pub workers: Arc<Semaphore>,
    pub snapshot_policy: SnapshotPolicy,
}

/// Spawn a run actor onto the runtime. The returned handle observes and
/// controls it; the actor itself owns all run state.
pub fn spawn_run(
    def: Arc<Definition>,
    input: Value,
    options: StartOptions,
    deps: ActorDeps,
) -> RunHandle {
    let run_id: Arc<str> = Arc::from(Ulid::new().to_string());
    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(RunView {
        run_id: Arc::clone(&run_id),
        status: RunStatus::Running,
        failure: None,
        output: None,
    });

    let sink = EventSink::new(
        Arc::clone(&run_id),
        Arc::clone(&deps.dispatcher),
        options.enable_trace_events,
        deps.snapshot_policy.clone(),
    );
    let actor = RunActor {
        run_id: Arc::clone(&run_id),
        def,
        options,
        deps,
        inbox: rx,
        self_tx: tx.clone(),
        tokens: TokenManager::new(Arc::clone(&run_id)),
        ctx: ContextStore::new(input),
        router: Router::new(),
        sink,
        status_tx,
        outstanding: 0,
    };
    tokio::spawn(actor.run());

    RunHandle { run_id, tx, status: status_rx }
}

struct RunActor {
    run_id: Arc<str>,
    def: Arc<Definition>,
    options: StartOptions,
    deps: ActorDeps,
    inbox: mpsc::UnboundedReceiver<ActorMsg>,
    self_tx: mpsc::UnboundedSender<ActorMsg>,
    tokens: TokenManager,
    ctx: ContextStore,
    router: Router,
    sink: EventSink,
    status_tx: watch::Sender<RunView>,
    /// Workers spawned but not yet reported back.
    outstanding: usize,
}

impl RunActor {
    async fn run(mut self) {
        info!(run_id = %self.run_id, reference = %self.def.reference, "run starting");
        let record = RunRecord {
            run_id: self.run_id.to_string(),
            reference: self.def.reference.to_string(),
            version: self.def.version,
            status: RunStatus::Running,
            parent_run_id: self.options.parent_run_id.clone(),
            parent_token_id: self.options.parent_token_id.clone(),
            created_at_ms: epoch_ms(),
            completed_at_ms: None,
        };
        if let Err(e) = self.deps.resource.create_run(&record).await {
            warn!(run_id = %self.run_id, error = %e, "createRun failed");
        }

        self.sink.emit(
            EventPayload::WorkflowStarted {
                reference: self.def.reference.to_string(),
                version: self.def.version,
            },
            None,
            None,
        );
        self.sink.emit(
            EventPayload::ContextInitialized { input: self.ctx.input().clone() },
            None,
            None,
        );
        self.sink.force_snapshot(&self.ctx);

        let root = self
            .tokens
            .create_root(self.def.initial, Arc::clone(&self.def.node(self.def.initial).node_ref));
        self.emit_created(&root);
        let failures = self.dispatch_all(vec![root]);
        self.process_failures(failures).await;
        self.flush_events().await;

        let mut deadline = self
            .options
            .timeout_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));

        loop {
            if self.settled() {
                break;
            }

            let msg = match deadline {
                Some(at) => tokio::select! {
                    msg = self.inbox.recv() => msg,
                    _ = tokio::time::sleep_until(at) => {
                        deadline = None;
                        self.fail_run(
                            TaskFailure::timed_out("run exceeded its timeoutMs"),
                            None,
                            None,
                        )
                        .await;
                        continue;
                    }
                },
                None => self.inbox.recv().await,
            };
            let Some(msg) = msg else { break };

            match msg {
                ActorMsg::TaskStarted { token_id } => self.handle_started(&token_id),
                ActorMsg::TaskFinished { token_id, result } => {
                    self.outstanding = self.outstanding.saturating_sub(1);
                    let terminal = self
                        .tokens
                        .get(&token_id)
                        .map(|t| t.status.is_terminal())
                        .unwrap_or(true);
                    if terminal || self.terminal() {
                        // The token was cancelled or the run already ended.
                        self.sink.emit(EventPayload::LateResult {}, Some(&token_id), None);
                    } else {
                        match result {
                            Ok(output) => self.handle_success(&token_id, output).await,
                            Err(failure) => {
                                self.process_failures(vec![(token_id, failure)]).await
                            }
                        }
                    }
                }
                ActorMsg::Cancel => {
                    if !self.terminal() {
                        self.fail_run(TaskFailure::cancelled(), None, None).await;
                    }
                }
                ActorMsg::PersistSnapshot => self.persist().await,
            }

            if !self.terminal() && self.tokens.is_quiescent() && self.outstanding == 0 {
                self.complete_run().await;
            }
            self.flush_events().await;
        }

        self.flush_events().await;
        info!(run_id = %self.run_id, status = ?self.status_tx.borrow().status, "run actor exiting");
    }

    /// Nothing left to do: the run is terminal and every worker reported in.
    fn settled(&self) -> bool {
        self.terminal() && self.outstanding == 0
    }

    fn terminal(&self) -> bool {
        self.status_tx.borrow().status.is_terminal()
    }

    fn handle_started(&mut self, token_id: &TokenId) {
        let Some(token) = self.tokens.get(token_id) else { return };
        if token.status != TokenStatus::Dispatched {
            // Cancelled while queued; the finish message will be dropped too.
            return;
        }
        let node_ref = Arc::clone(&token.node_ref);
        if self.tokens.transition(token_id, TokenStatus::Executing).is_ok() {
            self.emit_status(token_id, TokenStatus::Dispatched, TokenStatus::Executing);
            self.sink
                .emit(EventPayload::NodeStarted {}, Some(token_id), Some(&node_ref));
        }
    }

    async fn handle_success(&mut self, token_id: &TokenId, task_output: Value) {
        let Some(token) = self.tokens.get(token_id) else { return };
        let node_ix = token.node;
        let node_ref = Arc::clone(&token.node_ref);
        let node = self.def.node(node_ix);

        self.sink.emit(
            EventPayload::NodeCompleted { output: task_output.clone() },
            Some(token_id),
            Some(&node_ref),
        );

        // Node output mapping: task output into the run context, applied
        // here so no worker thread ever writes context.
        let writes = self.ctx.apply_mapping(&node.output_mapping, Some(token_id.as_ref()), |_, path| {
            Ok(jsonpath::resolve(&task_output, path)?)
        });
        let writes = match writes {
            Ok(writes) => writes,
            Err(e) => {
                let failure = TaskFailure::mapping(format!("node '{node_ref}' outputMapping: {e}"));
                self.process_failures(vec![(Arc::clone(token_id), failure)]).await;
                return;
            }
        };
        for record in &writes {
            self.sink.record_write(record, &self.ctx);
        }

        match self.router.route_token(
            token_id,
            &self.def,
            &mut self.tokens,
            &mut self.ctx,
            &mut self.sink,
        ) {
            Ok(created) => {
                let failures = self.dispatch_all(created);
                self.process_failures(failures).await;
            }
            Err(run_failure) => {
                self.fail_run(run_failure, Some(token_id), Some(&node_ref)).await;
            }
        }
    }

    /// Drain a worklist of token failures: each failure is recorded, may
    /// fire barriers (dispatching survivors), and may surface new dispatch
    /// failures, which loop back into the list.
    async fn process_failures(&mut self, mut queue: Vec<(TokenId, TaskFailure)>) {
        while let Some((token_id, failure)) = queue.pop() {
            if self.terminal() {
                return;
            }
            let Some(token) = self.tokens.get(&token_id) else { continue };
            if token.status.is_terminal() {
                continue;
            }
            let from = token.status;
            let node_ref = Arc::clone(&token.node_ref);
            let to = if failure.kind == FailureKind::TimedOut {
                TokenStatus::TimedOut
            } else {
                TokenStatus::Failed
            };
            // dispatched → timed_out is not a legal edge; a timeout before
            // execution is recorded as a plain failure.
            let to = if from == TokenStatus::Dispatched { TokenStatus::Failed } else { to };
            if self.tokens.transition(&token_id, to).is_err() {
                continue;
            }
            self.emit_status(&token_id, from, to);
            self.sink.emit(
                EventPayload::NodeFailed { kind: failure.kind, message: failure.message.clone() },
                Some(&token_id),
                Some(&node_ref),
            );

            match self.router.note_failure(
                &token_id,
                &failure,
                &self.def,
                &mut self.tokens,
                &mut self.ctx,
                &mut self.sink,
            ) {
                Ok(created) => queue.extend(self.dispatch_all(created)),
                Err(run_failure) => {
                    self.fail_run(run_failure, Some(&token_id), Some(&node_ref)).await;
                    return;
                }
            }
        }
    }

    /// Dispatch freshly created tokens to the worker pool, in the order the
    /// router created them (ascending branch index for siblings). Returns
    /// dispatch-time failures for the caller's worklist.
    fn dispatch_all(&mut self, created: Vec<TokenId>) -> Vec<(TokenId, TaskFailure)> {
        let mut failures = Vec::new();
        for token_id in created {
            if let Err(failure) = self.dispatch_token(&token_id) {
                failures.push((token_id, failure));
            }
        }
        failures
    }

    fn dispatch_token(&mut self, token_id: &TokenId) -> Result<(), TaskFailure> {
        let Some(token) = self.tokens.get(token_id) else {
            return Err(TaskFailure::invariant(format!("dispatching unknown token '{token_id}'")));
        };
        let node_ix = token.node;
        self.tokens.transition(token_id, TokenStatus::Dispatched)?;
        self.emit_status(token_id, TokenStatus::Pending, TokenStatus::Dispatched);

        // Node input mapping over {input, state, output, _branch}.
        let node = self.def.node(node_ix);
        let mut task_input = Value::Object(serde_json::Map::new());
        for (target, source) in &node.input_mapping {
            let value = self
                .ctx
                .read(source, Some(token_id.as_ref()))
                .map_err(|e| TaskFailure::mapping(format!("inputMapping '{target}': {e}")))?;
            let Some(value) = value else { continue };
            let segments = jsonpath::parse_writable(target)
                .map_err(|e| TaskFailure::mapping(format!("inputMapping '{target}': {e}")))?;
            jsonpath::write(&mut task_input, &segments, value)
                .map_err(|e| TaskFailure::mapping(format!("inputMapping '{target}': {e}")))?;
        }

        self.outstanding += 1;
        let executor = self.deps.executor.clone();
        let def = Arc::clone(&self.def);
        let workers = Arc::clone(&self.deps.workers);
        let tx = self.self_tx.clone();
        let tid = Arc::clone(token_id);
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                let _ = tx.send(ActorMsg::TaskFinished {
                    token_id: tid,
                    result: Err(TaskFailure::invariant("worker pool closed")),
                });
                return;
            };
            let _ = tx.send(ActorMsg::TaskStarted { token_id: Arc::clone(&tid) });

            let node = def.node(node_ix);
            let result = match node.task.timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, executor.execute(node, task_input)).await {
                        Ok(result) => result,
                        Err(_) => Err(TaskFailure::timed_out(format!(
                            "task exceeded {}ms",
                            timeout.as_millis()
                        ))),
                    }
                }
                None => executor.execute(node, task_input).await,
            };
            let _ = tx.send(ActorMsg::TaskFinished { token_id: tid, result });
        });
        debug!(run_id = %self.run_id, token = %token_id, "token dispatched");
        Ok(())
    }

    /// Terminal output mapping, final snapshot, `workflow.completed`.
    async fn complete_run(&mut self) {
        for (target, source) in &self.def.output_mapping.clone() {
            let value = match self.ctx.read(source, None) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    let failure = TaskFailure::mapping(format!("outputMapping '{target}': {e}"));
                    self.fail_run(failure, None, None).await;
                    return;
                }
            };
            let target = normalize_output_target(target);
            match self.ctx.write(&target, value, None) {
                Ok(record) => self.sink.record_write(&record, &self.ctx),
                Err(e) => {
                    let failure = TaskFailure::mapping(format!("outputMapping '{target}': {e}"));
                    self.fail_run(failure, None, None).await;
                    return;
                }
            }
        }

        if let Some(schema) = &self.def.output_schema {
            if let Err(detail) = schema.check(self.ctx.output()) {
                let failure = TaskFailure::validation(format!("workflow output: {detail}"));
                self.fail_run(failure, None, None).await;
                return;
            }
        }

        self.sink.force_snapshot(&self.ctx);
        let output = self.ctx.output().clone();
        self.sink.emit(
            EventPayload::WorkflowCompleted { output: output.clone() },
            None,
            None,
        );
        self.status_tx.send_replace(RunView {
            run_id: Arc::clone(&self.run_id),
            status: RunStatus::Completed,
            failure: None,
            output: Some(output),
        });
        if let Err(e) = self
            .deps
            .resource
            .update_run_status(&self.run_id, RunStatus::Completed, Some(epoch_ms()))
            .await
        {
            warn!(run_id = %self.run_id, error = %e, "updateRunStatus failed");
        }
        self.persist().await;
        info!(run_id = %self.run_id, "run completed");
    }

    /// Cancel every non-terminal token, emit `workflow.failed`, persist.
    async fn fail_run(
        &mut self,
        failure: TaskFailure,
        token_id: Option<&TokenId>,
        node_ref: Option<&Arc<str>>,
    ) {
        if self.terminal() {
            return;
        }
        for id in self.tokens.non_terminal_ids() {
            let from = self.tokens.get(&id).map(|t| t.status).unwrap_or(TokenStatus::Pending);
            if self.tokens.transition(&id, TokenStatus::Cancelled).is_ok() {
                self.emit_status(&id, from, TokenStatus::Cancelled);
            }
            self.ctx.drop_branch(&id);
        }

        self.sink.emit(
            EventPayload::WorkflowFailed {
                kind: failure.kind,
                message: failure.message.clone(),
                token_id: token_id.map(|t| t.to_string()),
                node_ref: node_ref.map(|n| n.to_string()),
            },
            token_id,
            node_ref,
        );
        self.status_tx.send_replace(RunView {
            run_id: Arc::clone(&self.run_id),
            status: RunStatus::Failed,
            failure: Some(failure.clone()),
            output: None,
        });
        if let Err(e) = self
            .deps
            .resource
            .update_run_status(&self.run_id, RunStatus::Failed, Some(epoch_ms()))
            .await
        {
            warn!(run_id = %self.run_id, error = %e, "updateRunStatus failed");
        }
        self.persist().await;
        info!(run_id = %self.run_id, kind = %failure.kind, "run failed");
    }

    async fn persist(&mut self) {
        let active: Vec<_> = self
            .tokens
            .iter()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        if let Err(e) = self
            .deps
            .resource
            .persist_snapshot(&self.run_id, &self.ctx.snapshot(), &active)
            .await
        {
            warn!(run_id = %self.run_id, error = %e, "persistSnapshot failed");
        }
    }

    async fn flush_events(&mut self) {
        let pending = self.sink.take_pending();
        if pending.is_empty() {
            return;
        }
        let (events, trace): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|e| e.stream() == Stream::Events);
        for (stream, batch) in [(Stream::Events, events), (Stream::Trace, trace)] {
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = self
                .deps
                .resource
                .append_events(&self.run_id, stream, &batch)
                .await
            {
                warn!(run_id = %self.run_id, error = %e, "appendEvents failed");
            }
        }
    }

    fn emit_created(&mut self, token_id: &TokenId) {
        let Some(token) = self.tokens.get(token_id) else { return };
        let node_ref = Arc::clone(&token.node_ref);
        let payload = EventPayload::TokenCreated {
            parent: token.parent.as_ref().map(|p| p.to_string()),
            sibling_group: token.sibling_group.as_ref().map(|g| g.to_string()),
            branch_index: token.branch_index,
            branch_total: token.branch_total,
        };
        self.sink.emit(payload, Some(token_id), Some(&node_ref));
    }

    fn emit_status(&mut self, token_id: &TokenId, from: TokenStatus, to: TokenStatus) {
        let node_ref = self.tokens.get(token_id).map(|t| Arc::clone(&t.node_ref));
        self.sink.emit(
            EventPayload::TokenStatusChanged { from, to },
            Some(token_id),
            node_ref.as_ref(),
        );
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Terminal output-mapping targets are output fields; accept already
/// namespaced paths as-is.
fn normalize_output_target(target: &str) -> String {
    let bare = target.strip_prefix("$.").unwrap_or(target);
    if bare == "output" || bare.starts_with("output.") || bare.starts_with("output[") {
        bare.to_string()
    } else {
        format!("output.{bare}")
    }
}
