//! Workflow definition documents as they arrive over the wire.
//!
//! These are the serde models for the YAML/JSON documents stored by the
//! resource service: workflow graphs, task definitions, and action
//! definitions. Field names are camelCase to match the platform's document
//! format. The loader turns these into frozen, validated graphs; nothing in
//! the runtime touches the wire types after freezing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `target ← source-path` mapping. `BTreeMap` gives the deterministic
/// lexicographic application order the context store promises.
pub type Mapping = BTreeMap<String, String>;

/// Definition kinds resolvable through the resource service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Workflow,
    Task,
    Action,
}

impl std::fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefinitionKind::Workflow => f.write_str("workflow"),
            DefinitionKind::Task => f.write_str("task"),
            DefinitionKind::Action => f.write_str("action"),
        }
    }
}

/// A resolved definition document of any kind.
///
/// Adjacently tagged (`kind` + `spec`) so the document tag never collides
/// with an action's own `kind` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "snake_case")]
pub enum DefinitionDocument {
    Workflow(WorkflowDef),
    Task(TaskDef),
    Action(ActionDef),
}

impl DefinitionDocument {
    pub fn kind(&self) -> DefinitionKind {
        match self {
            DefinitionDocument::Workflow(_) => DefinitionKind::Workflow,
            DefinitionDocument::Task(_) => DefinitionKind::Task,
            DefinitionDocument::Action(_) => DefinitionKind::Action,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            DefinitionDocument::Workflow(d) => &d.reference,
            DefinitionDocument::Task(d) => &d.reference,
            DefinitionDocument::Action(d) => &d.reference,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            DefinitionDocument::Workflow(d) => d.version,
            DefinitionDocument::Task(d) => d.version,
            DefinitionDocument::Action(d) => d.version,
        }
    }
}

fn default_version() -> u32 {
    1
}

/// A workflow graph document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDef {
    pub reference: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub state_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    /// `outputField ← JSONPath` over the final `state`/`output` namespaces.
    #[serde(default)]
    pub output_mapping: Mapping,
    pub initial_node_ref: String,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
}

/// A node: one vertex of the graph, executing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDef {
    #[serde(rename = "ref")]
    pub node_ref: String,
    pub task: TaskRef,
    /// taskInputField ← context JSONPath.
    #[serde(default)]
    pub input_mapping: Mapping,
    /// context path (`state.*` / `output.*` / `_branch.*`) ← task-output JSONPath.
    #[serde(default)]
    pub output_mapping: Mapping,
    #[serde(default)]
    pub resource_bindings: BTreeMap<String, String>,
}

/// A `(reference, version)` pointer to a stored definition.
///
/// `deny_unknown_fields` keeps the untagged enums below unambiguous: any
/// document carrying more than these two fields is an inline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefRef {
    pub reference: String,
    #[serde(default)]
    pub version: Option<u32>,
}

/// Task embedded inline or referenced by `(reference, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskRef {
    Reference(DefRef),
    Inline(TaskDef),
}

/// A task definition: ordered steps plus retry/timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDef {
    #[serde(default)]
    pub reference: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Retry policy for a task's action invocations and step-level restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1, backoff: Backoff::None, initial_delay_ms: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    None,
    Linear,
    Exponential,
}

/// A step: one action invocation inside a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDef {
    #[serde(rename = "ref")]
    pub step_ref: String,
    pub ordinal: u32,
    pub action: ActionRef,
    /// actionInputField ← task-scope JSONPath.
    #[serde(default)]
    pub input_mapping: Mapping,
    /// task-scope path ← action-output JSONPath.
    #[serde(default)]
    pub output_mapping: Mapping,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub condition: Option<StepCondition>,
}

/// Action embedded inline or referenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionRef {
    Reference(DefRef),
    Inline(ActionDef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Fail the task (default).
    #[default]
    Abort,
    /// Restart the task from step 0; counts against `retry.maxAttempts`.
    Retry,
    /// Ignore the failure and move to the next step.
    Continue,
}

/// Conditional guard on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    #[serde(rename = "if")]
    pub if_expr: String,
    pub then: StepDirective,
    #[serde(rename = "else")]
    pub else_: StepDirective,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDirective {
    /// Proceed to the step's action.
    Continue,
    /// Do not execute the action; the step output is `{}`.
    Skip,
    /// Abandon remaining steps; the task completes with the current scope.
    Succeed,
    /// Terminate the task with `ConditionFailed`.
    Fail,
}

/// An action definition. The `implementation` block is opaque to the
/// coordinator; only the executor behind the `ActionExecutor` trait
/// interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDef {
    #[serde(default)]
    pub reference: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(rename = "kind", default)]
    pub action_kind: ActionKind,
    #[serde(default)]
    pub implementation: Value,
    #[serde(default)]
    pub requires: Option<Value>,
    #[serde(default)]
    pub produces: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Llm,
    Mcp,
    Http,
    Human,
    Context,
    Artifact,
    Vector,
    Metric,
    #[default]
    Mock,
}

/// A transition: a directed edge, optionally conditional, optionally
/// fan-out or fan-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionDef {
    #[serde(rename = "ref")]
    pub transition_ref: String,
    pub from_node_ref: String,
    pub to_node_ref: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub spawn_count: Option<usize>,
    #[serde(default)]
    pub foreach: Option<ForeachDef>,
    #[serde(default)]
    pub synchronization: Option<SyncDef>,
    /// Group identifier stamped on fan-out children; defaults to the
    /// transition's own ref.
    #[serde(default)]
    pub sibling_group: Option<String>,
}

impl TransitionDef {
    pub fn is_fan_out(&self) -> bool {
        self.spawn_count.is_some() || self.foreach.is_some()
    }

    pub fn is_fan_in(&self) -> bool {
        self.synchronization.is_some()
    }
}

/// Fan-out over a collection: one child per item, the item bound to
/// `_branch.<itemVar>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeachDef {
    /// JSONPath to the collection, evaluated in the completing token's view.
    pub collection: String,
    pub item_var: String,
}

/// Fan-in synchronization declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDef {
    pub strategy: SyncStrategy,
    /// Parameter for `m_of_n`.
    #[serde(default)]
    pub m: Option<usize>,
    /// The fan-out transition ref whose siblings rendezvous here.
    pub sibling_group: String,
    #[serde(default)]
    pub merge: Option<MergeDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    All,
    Any,
    MOfN,
}

/// How arriving branch outputs combine into the run context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeDef {
    /// Evaluated in the arriving branch's scope (`$._branch.…`).
    pub source: String,
    /// Written to `state.*` or `output.*`.
    pub target: String,
    pub strategy: MergeStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Append,
    Concat,
    Last,
    First,
    Sum,
    Set,
}
