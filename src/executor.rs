//! Step/task executor.
//!
//! Runs one node's task against the action executor: ordered steps, each
//! with its own input/output mapping, optional guard condition, per-step
//! deadline, and the task-level retry policy. Executes on worker tasks;
//! given a deterministic action executor it is a pure function of the
//! frozen task and the task input. Context writes never happen here: the
//! run actor applies node output mappings when the result message arrives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, instrument};

use crate::action::{ActionExecutor, ActionOutcome};
use crate::context::apply_mapping_into;
use crate::definition::{Backoff, OnFailure, RetryPolicy, StepDirective};
use crate::error::{FailureKind, TaskFailure};
use crate::jsonpath;
use crate::loader::{FrozenNode, FrozenStep, FrozenTask};

/// Deadline handed to actions when the task declares no `timeoutMs`.
const DEFAULT_ACTION_DEADLINE: Duration = Duration::from_secs(60);

/// Exponential backoff is capped here regardless of attempt count.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Delay before retry number `attempt + 1`, where `attempt` counts
/// completed attempts (1-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let initial = Duration::from_millis(policy.initial_delay_ms);
    let delay = match policy.backoff {
        Backoff::None => Duration::ZERO,
        Backoff::Linear => initial * attempt,
        Backoff::Exponential => initial * 2u32.saturating_pow(attempt.saturating_sub(1)),
    };
    delay.min(BACKOFF_CAP)
}

/// Executes tasks against the injected action executor.
#[derive(Clone)]
pub struct TaskExecutor {
    actions: Arc<dyn ActionExecutor>,
}

enum StepFlow {
    /// Step finished (ran or skipped); continue with the next one.
    Next,
    /// `succeed` directive: finish the task with the current scope.
    FinishTask,
    /// Restart the task from step 0 (`onFailure: retry`).
    RestartTask(TaskFailure),
}

impl TaskExecutor {
    pub fn new(actions: Arc<dyn ActionExecutor>) -> Self {
        Self { actions }
    }

    /// Run a node's task to completion. `task_input` was produced by the
    /// actor from the node's `inputMapping`.
    #[instrument(skip_all, fields(node = %node.node_ref))]
    pub async fn execute(&self, node: &FrozenNode, task_input: Value) -> Result<Value, TaskFailure> {
        let task = &node.task;

        if let Some(schema) = &task.input_schema {
            schema
                .check(&task_input)
                .map_err(|detail| TaskFailure::validation(format!("task input: {detail}")))?;
        }

        let started = Instant::now();
        let mut task_attempt: u32 = 1;

        'task: loop {
            let mut scope = task_input.clone();

            for step in &task.steps {
                match self.run_step(task, step, &mut scope, started).await? {
                    StepFlow::Next => {}
                    StepFlow::FinishTask => break,
                    StepFlow::RestartTask(failure) => {
                        if task_attempt < task.retry.max_attempts {
                            task_attempt += 1;
                            debug!(attempt = task_attempt, "restarting task from step 0");
                            continue 'task;
                        }
                        return Err(failure);
                    }
                }
            }

            if let Some(schema) = &task.output_schema {
                schema
                    .check(&scope)
                    .map_err(|detail| TaskFailure::validation(format!("task output: {detail}")))?;
            }
            return Ok(scope);
        }
    }

    async fn run_step(
        &self,
        task: &FrozenTask,
        step: &FrozenStep,
        scope: &mut Value,
        started: Instant,
    ) -> Result<StepFlow, TaskFailure> {
        // Guard condition over the task scope.
        if let Some(guard) = &step.condition {
            let directive = if guard.when.eval(|path| {
                jsonpath::resolve(scope, path).ok().flatten()
            }) {
                guard.then
            } else {
                guard.else_
            };
            match directive {
                StepDirective::Continue => {}
                StepDirective::Skip => {
                    // Action not executed; the step output is {}.
                    apply_step_output(step, scope, &Value::Object(serde_json::Map::new()))?;
                    return Ok(StepFlow::Next);
                }
                StepDirective::Succeed => return Ok(StepFlow::FinishTask),
                StepDirective::Fail => {
                    return Err(TaskFailure::new(
                        FailureKind::ConditionFailed,
                        format!("step '{}' condition directed fail", step.step_ref),
                    ));
                }
            }
        }

        let mut action_input = Value::Object(serde_json::Map::new());
        apply_mapping_into(&mut action_input, &step.input_mapping, |path| {
            jsonpath::resolve(scope, path)
        })
        .map_err(|e| TaskFailure::mapping(format!("step '{}' input: {e}", step.step_ref)))?;

        match self.invoke_with_retry(task, step, action_input, started).await {
            Ok(output) => {
                apply_step_output(step, scope, &output)?;
                Ok(StepFlow::Next)
            }
            Err(failure) if failure.kind == FailureKind::TimedOut => Err(failure),
            Err(failure) => match step.on_failure {
                OnFailure::Abort => Err(failure),
                OnFailure::Continue => {
                    debug!(step = %step.step_ref, error = %failure, "ignoring step failure");
                    Ok(StepFlow::Next)
                }
                OnFailure::Retry => Ok(StepFlow::RestartTask(failure)),
            },
        }
    }

    /// One step's action, retried per the task policy on transient errors.
    async fn invoke_with_retry(
        &self,
        task: &FrozenTask,
        step: &FrozenStep,
        action_input: Value,
        started: Instant,
    ) -> Result<Value, TaskFailure> {
        let max_attempts = task.retry.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let deadline = remaining_deadline(task, started)?;

            match self
                .actions
                .run(&step.action, action_input.clone(), deadline)
                .await
            {
                ActionOutcome::Ok(output) => return Ok(output),
                ActionOutcome::Transient(reason) if attempt < max_attempts => {
                    let delay = backoff_delay(&task.retry, attempt);
                    debug!(
                        step = %step.step_ref,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient action failure, backing off"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                ActionOutcome::Transient(reason) => {
                    return Err(TaskFailure::new(
                        FailureKind::ActionTransient,
                        format!(
                            "step '{}' exhausted {max_attempts} attempts: {reason}",
                            step.step_ref
                        ),
                    ));
                }
                ActionOutcome::Fatal(reason) => {
                    return Err(TaskFailure::new(
                        FailureKind::ActionFatal,
                        format!("step '{}': {reason}", step.step_ref),
                    ));
                }
            }
        }
    }
}

/// Remaining wall-clock budget, or a timeout failure once the task budget
/// (including retries) is spent.
fn remaining_deadline(task: &FrozenTask, started: Instant) -> Result<Duration, TaskFailure> {
    match task.timeout {
        Some(timeout) => {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                Err(TaskFailure::timed_out(format!(
                    "task exceeded {}ms",
                    timeout.as_millis()
                )))
            } else {
                Ok(timeout - elapsed)
            }
        }
        None => Ok(DEFAULT_ACTION_DEADLINE),
    }
}

fn apply_step_output(
    step: &FrozenStep,
    scope: &mut Value,
    output: &Value,
) -> Result<(), TaskFailure> {
    apply_mapping_into(scope, &step.output_mapping, |path| {
        jsonpath::resolve(output, path)
    })
    .map_err(|e| TaskFailure::mapping(format!("step '{}' output: {e}", step.step_ref)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::MockActionExecutor;
    use crate::loader::{freeze, Definition};
    use serde_json::json;

    /// Freeze a one-node workflow and hand back its node for direct
    /// executor tests.
    fn node_from_yaml(task_yaml: &str) -> Definition {
        let yaml = format!(
            r#"
reference: exec-test
initialNodeRef: only
nodes:
  - ref: only
    task:
{task_yaml}
"#
        );
        freeze(serde_yaml::from_str(&yaml).unwrap()).unwrap()
    }

    fn executor() -> (TaskExecutor, Arc<MockActionExecutor>) {
        let mock = Arc::new(MockActionExecutor::new(7));
        (TaskExecutor::new(mock.clone()), mock)
    }

    #[tokio::test]
    async fn steps_run_in_ordinal_order() {
        let def = node_from_yaml(
            r#"
      steps:
        - ref: second
          ordinal: 2
          action:
            kind: mock
            implementation: { output: { tag: "late" } }
          outputMapping:
            order[1]: "$.tag"
        - ref: first
          ordinal: 1
          action:
            kind: mock
            implementation: { output: { tag: "early" } }
          outputMapping:
            order[0]: "$.tag"
"#,
        );
        let (exec, _) = executor();
        let scope = exec.execute(def.node(0), json!({})).await.unwrap();
        assert_eq!(scope["order"], json!(["early", "late"]));
    }

    #[tokio::test]
    async fn step_mappings_flow_through_scope() {
        let def = node_from_yaml(
            r#"
      steps:
        - ref: produce
          ordinal: 0
          action:
            kind: mock
            implementation: { output: { text: "hello" } }
          outputMapping:
            greeting: "$.text"
        - ref: consume
          ordinal: 1
          action:
            kind: mock
            implementation: { echo: true }
          inputMapping:
            message: "$.greeting"
          outputMapping:
            echoed: "$.message"
"#,
        );
        let (exec, mock) = executor();
        let scope = exec.execute(def.node(0), json!({})).await.unwrap();
        assert_eq!(scope["echoed"], "hello");
        // The second invocation saw the mapped input.
        assert_eq!(mock.invocations()[1].input, json!({"message": "hello"}));
    }

    #[tokio::test]
    async fn input_schema_validation_fails_token() {
        let def = node_from_yaml(
            r#"
      inputSchema:
        type: object
        required: [city]
      steps: []
"#,
        );
        let (exec, _) = executor();
        let err = exec.execute(def.node(0), json!({})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Validation);
    }

    #[tokio::test]
    async fn output_schema_validation() {
        let def = node_from_yaml(
            r#"
      outputSchema:
        type: object
        required: [code]
      steps:
        - ref: emit
          ordinal: 0
          action:
            kind: mock
            implementation: { output: { code: "X" } }
          outputMapping:
            code: "$.code"
"#,
        );
        let (exec, _) = executor();
        assert!(exec.execute(def.node(0), json!({})).await.is_ok());

        let bad = node_from_yaml(
            r#"
      outputSchema:
        type: object
        required: [code]
      steps: []
"#,
        );
        let err = exec.execute(bad.node(0), json!({})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Validation);
    }

    #[tokio::test]
    async fn retry_with_exponential_backoff() {
        let def = node_from_yaml(
            r#"
      retry:
        maxAttempts: 3
        backoff: exponential
        initialDelayMs: 10
      steps:
        - ref: flaky
          ordinal: 0
          action:
            kind: mock
            implementation:
              transientFailures: 2
              output: { ok: true }
          outputMapping:
            ok: "$.ok"
"#,
        );
        let (exec, mock) = executor();
        let scope = exec.execute(def.node(0), json!({})).await.unwrap();
        assert_eq!(scope["ok"], true);

        let records = mock.invocations();
        assert_eq!(records.len(), 3);
        // Exponential: >=10ms between 1 and 2, >=20ms between 2 and 3.
        assert!(records[1].at_ms - records[0].at_ms >= 10);
        assert!(records[2].at_ms - records[1].at_ms >= 20);
    }

    #[tokio::test]
    async fn retries_exhausted_is_transient_failure() {
        let def = node_from_yaml(
            r#"
      retry:
        maxAttempts: 2
        backoff: none
      steps:
        - ref: flaky
          ordinal: 0
          action:
            kind: mock
            implementation:
              transientFailures: 10
"#,
        );
        let (exec, mock) = executor();
        let err = exec.execute(def.node(0), json!({})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ActionTransient);
        assert_eq!(mock.invocation_count(), 2);
    }

    #[tokio::test]
    async fn fatal_error_aborts_by_default() {
        let def = node_from_yaml(
            r#"
      steps:
        - ref: broken
          ordinal: 0
          action:
            kind: mock
            implementation: { fatal: "nope" }
"#,
        );
        let (exec, _) = executor();
        let err = exec.execute(def.node(0), json!({})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::ActionFatal);
    }

    #[tokio::test]
    async fn on_failure_continue_moves_on() {
        let def = node_from_yaml(
            r#"
      steps:
        - ref: broken
          ordinal: 0
          onFailure: continue
          action:
            kind: mock
            implementation: { fatal: "nope" }
          outputMapping:
            never: "$.x"
        - ref: works
          ordinal: 1
          action:
            kind: mock
            implementation: { output: { fine: true } }
          outputMapping:
            fine: "$.fine"
"#,
        );
        let (exec, _) = executor();
        let scope = exec.execute(def.node(0), json!({})).await.unwrap();
        assert_eq!(scope["fine"], true);
        assert!(scope.get("never").is_none());
    }

    #[tokio::test]
    async fn on_failure_retry_restarts_from_step_zero() {
        // Step 1 succeeds, step 2 fails transiently once with
        // onFailure: retry, so the whole task restarts, so step 1 runs twice.
        let def = node_from_yaml(
            r#"
      retry:
        maxAttempts: 2
        backoff: none
      steps:
        - ref: first
          ordinal: 0
          action:
            kind: mock
            implementation: { output: { n: 1 } }
          outputMapping:
            n: "$.n"
        - ref: then-fails
          ordinal: 1
          onFailure: retry
          action:
            kind: mock
            implementation:
              transientFailures: 2
              output: { done: true }
          outputMapping:
            done: "$.done"
"#,
        );
        let (exec, mock) = executor();
        let scope = exec.execute(def.node(0), json!({})).await.unwrap();
        assert_eq!(scope["done"], true);

        let firsts = mock
            .invocations()
            .iter()
            .filter(|r| r.input == json!({}))
            .count();
        // Both steps take empty input here; first ran twice, the flaky one
        // ran twice within attempt budgets plus once after restart.
        assert!(firsts >= 4);
    }

    #[tokio::test]
    async fn condition_skip_produces_empty_output() {
        let def = node_from_yaml(
            r#"
      steps:
        - ref: guarded
          ordinal: 0
          condition:
            if: "$.mode == 'run'"
            then: continue
            else: skip
          action:
            kind: mock
            implementation: { output: { ran: true } }
          outputMapping:
            ran: "$.ran"
"#,
        );
        let (exec, mock) = executor();
        let scope = exec.execute(def.node(0), json!({"mode": "off"})).await.unwrap();
        assert!(scope.get("ran").is_none());
        assert_eq!(mock.invocation_count(), 0);

        let scope = exec.execute(def.node(0), json!({"mode": "run"})).await.unwrap();
        assert_eq!(scope["ran"], true);
    }

    #[tokio::test]
    async fn condition_succeed_abandons_remaining_steps() {
        let def = node_from_yaml(
            r#"
      steps:
        - ref: early-exit
          ordinal: 0
          condition:
            if: "$.done == true"
            then: succeed
            else: continue
          action:
            kind: mock
            implementation: { output: {} }
        - ref: unreachable
          ordinal: 1
          action:
            kind: mock
            implementation: { output: { late: true } }
          outputMapping:
            late: "$.late"
"#,
        );
        let (exec, mock) = executor();
        let scope = exec.execute(def.node(0), json!({"done": true})).await.unwrap();
        assert!(scope.get("late").is_none());
        assert_eq!(mock.invocation_count(), 0);
    }

    #[tokio::test]
    async fn condition_fail_fails_task() {
        let def = node_from_yaml(
            r#"
      steps:
        - ref: guard
          ordinal: 0
          condition:
            if: "exists($.forbidden)"
            then: fail
            else: continue
          action:
            kind: mock
            implementation: { output: {} }
"#,
        );
        let (exec, _) = executor();
        let err = exec
            .execute(def.node(0), json!({"forbidden": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ConditionFailed);
    }

    #[tokio::test]
    async fn task_timeout_yields_timed_out() {
        let def = node_from_yaml(
            r#"
      timeoutMs: 30
      retry:
        maxAttempts: 5
        backoff: none
      steps:
        - ref: slow
          ordinal: 0
          action:
            kind: mock
            implementation:
              delayMs: 25
              transientFailures: 5
"#,
        );
        let (exec, _) = executor();
        let err = exec.execute(def.node(0), json!({})).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::TimedOut);
    }

    #[test]
    fn backoff_shapes() {
        let none = RetryPolicy { max_attempts: 3, backoff: Backoff::None, initial_delay_ms: 10 };
        assert_eq!(backoff_delay(&none, 1), Duration::ZERO);

        let linear = RetryPolicy { max_attempts: 3, backoff: Backoff::Linear, initial_delay_ms: 10 };
        assert_eq!(backoff_delay(&linear, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(&linear, 3), Duration::from_millis(30));

        let exp = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Exponential,
            initial_delay_ms: 10,
        };
        assert_eq!(backoff_delay(&exp, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(&exp, 2), Duration::from_millis(20));
        assert_eq!(backoff_delay(&exp, 3), Duration::from_millis(40));
    }

    #[test]
    fn backoff_is_capped() {
        let exp = RetryPolicy {
            max_attempts: 64,
            backoff: Backoff::Exponential,
            initial_delay_ms: 10_000,
        };
        assert_eq!(backoff_delay(&exp, 32), BACKOFF_CAP);
    }
}
