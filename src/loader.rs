//! Definition loader: resolves and freezes workflow graphs.
//!
//! Turns `(kind, reference, version)` into a validated, immutable
//! [`Definition`]. Nodes and transitions are arena-allocated into vectors
//! and addressed by index, so cyclic graphs need no cyclic ownership. JSON
//! schemas and condition expressions are compiled once here; the run actor
//! never re-parses anything on the hot path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::condition::{Condition, ConditionError};
use crate::context::Namespace;
use crate::definition::{
    ActionDef, ActionRef, DefinitionDocument, DefinitionKind, Mapping, MergeStrategy, NodeDef,
    OnFailure, RetryPolicy, StepDef, StepDirective, SyncStrategy, TaskDef, TaskRef, TransitionDef,
    WorkflowDef,
};
use crate::jsonpath::{self, Segment};
use crate::resource::{ResourceError, ResourceService};

pub type NodeIx = usize;
pub type TransitionIx = usize;

/// Upper bound on fan-out width. A `spawnCount` or `foreach` collection
/// above this fails rather than flooding the worker pool.
pub const MAX_FAN_OUT: usize = 10_000;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("definition '{reference}' is a {actual}, expected {expected}")]
    WrongKind { reference: String, expected: DefinitionKind, actual: DefinitionKind },

    #[error("duplicate node ref '{0}'")]
    DuplicateNode(String),

    #[error("duplicate transition ref '{0}'")]
    DuplicateTransition(String),

    #[error("initial node '{0}' is not declared")]
    UnknownInitialNode(String),

    #[error("transition '{transition}' references undeclared node '{node_ref}'")]
    UnknownEndpoint { transition: String, node_ref: String },

    #[error("node '{0}' is unreachable from the initial node")]
    UnreachableNode(String),

    #[error("transition '{transition}' declares both spawnCount and foreach")]
    SpawnAndForeach { transition: String },

    #[error("transition '{transition}' spawnCount {count} exceeds the fan-out bound {MAX_FAN_OUT}")]
    FanOutTooWide { transition: String, count: usize },

    #[error("transition '{transition}' synchronizes on group '{group}' which matches no fan-out transition")]
    FanInWithoutFanOut { transition: String, group: String },

    #[error("transition '{transition}' uses m_of_n without a usable m")]
    BadMParameter { transition: String },

    #[error("{place}: path '{path}' is invalid: {reason}")]
    BadPath { place: String, path: String, reason: String },

    #[error("{place}: path '{path}' must target {expected}")]
    BadTarget { place: String, path: String, expected: &'static str },

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error("{place}: schema failed to compile: {reason}")]
    BadSchema { place: String, reason: String },

    #[error("task for node '{node}' repeats ordinal {ordinal}")]
    DuplicateOrdinal { node: String, ordinal: u32 },
}

/// A compiled JSON schema paired with its source document.
pub struct CompiledSchema {
    raw: Value,
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    fn compile(raw: &Value, place: &str) -> Result<Self, LoaderError> {
        let validator = jsonschema::validator_for(raw).map_err(|e| LoaderError::BadSchema {
            place: place.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { raw: raw.clone(), validator })
    }

    /// All validation errors joined, or `Ok` on conformance.
    pub fn check(&self, instance: &Value) -> Result<(), String> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema").field("raw", &self.raw).finish()
    }
}

/// Fan-out flavor of a transition.
#[derive(Debug, Clone)]
pub enum FanOutSpec {
    Count(usize),
    Foreach { collection: String, item_var: String },
}

/// Merge declaration with pre-parsed paths. `source` is relative to the
/// arriving branch's scope; `target` is a full `state.*`/`output.*` path.
#[derive(Debug)]
pub struct FrozenMerge {
    pub source: Vec<Segment>,
    pub target: String,
    pub strategy: MergeStrategy,
}

#[derive(Debug)]
pub struct FrozenSync {
    pub strategy: SyncStrategy,
    pub m: Option<usize>,
    pub group: Arc<str>,
    pub merge: Option<FrozenMerge>,
}

#[derive(Debug)]
pub struct FrozenTransition {
    pub transition_ref: Arc<str>,
    pub from: NodeIx,
    pub to: NodeIx,
    pub priority: i32,
    pub condition: Option<Condition>,
    pub fan_out: Option<FanOutSpec>,
    pub sync: Option<FrozenSync>,
}

#[derive(Debug)]
pub struct FrozenStepCondition {
    pub when: Condition,
    pub then: StepDirective,
    pub else_: StepDirective,
}

#[derive(Debug)]
pub struct FrozenStep {
    pub step_ref: Arc<str>,
    pub ordinal: u32,
    pub action: Arc<ActionDef>,
    pub input_mapping: Mapping,
    pub output_mapping: Mapping,
    pub on_failure: OnFailure,
    pub condition: Option<FrozenStepCondition>,
}

#[derive(Debug)]
pub struct FrozenTask {
    pub reference: Arc<str>,
    pub version: u32,
    pub input_schema: Option<CompiledSchema>,
    pub output_schema: Option<CompiledSchema>,
    /// Sorted by ascending ordinal.
    pub steps: Vec<FrozenStep>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct FrozenNode {
    pub node_ref: Arc<str>,
    pub task: FrozenTask,
    pub input_mapping: Mapping,
    pub output_mapping: Mapping,
}

/// A validated, immutable workflow graph. The run actor shares this
/// read-only; nothing mutates it after freezing.
#[derive(Debug)]
pub struct Definition {
    pub reference: Arc<str>,
    pub version: u32,
    pub input_schema: Option<CompiledSchema>,
    pub state_schema: Option<CompiledSchema>,
    pub output_schema: Option<CompiledSchema>,
    pub output_mapping: Mapping,
    pub initial: NodeIx,
    nodes: Vec<FrozenNode>,
    transitions: Vec<FrozenTransition>,
    /// Per node, outgoing transitions sorted by descending priority, ties
    /// broken by ref ascending.
    outgoing: Vec<Vec<TransitionIx>>,
    node_index: HashMap<Arc<str>, NodeIx>,
    /// Fan-in transitions grouped by the fan-out ref they synchronize on.
    sync_by_group: HashMap<Arc<str>, Vec<TransitionIx>>,
}

impl Definition {
    pub fn node(&self, ix: NodeIx) -> &FrozenNode {
        &self.nodes[ix]
    }

    pub fn transition(&self, ix: TransitionIx) -> &FrozenTransition {
        &self.transitions[ix]
    }

    pub fn node_ix(&self, node_ref: &str) -> Option<NodeIx> {
        self.node_index.get(node_ref).copied()
    }

    pub fn outgoing(&self, node: NodeIx) -> &[TransitionIx] {
        &self.outgoing[node]
    }

    /// Fan-in transitions synchronizing on `group`.
    pub fn sync_transitions(&self, group: &str) -> &[TransitionIx] {
        static EMPTY: &[TransitionIx] = &[];
        self.sync_by_group.get(group).map(|v| v.as_slice()).unwrap_or(EMPTY)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Resolves definition references through the resource service and freezes
/// the result.
pub struct DefinitionLoader {
    resource: Arc<dyn ResourceService>,
}

impl DefinitionLoader {
    pub fn new(resource: Arc<dyn ResourceService>) -> Self {
        Self { resource }
    }

    /// Resolve `(workflow, reference, version)` into a frozen graph.
    pub async fn load(
        &self,
        reference: &str,
        version: Option<u32>,
    ) -> Result<Arc<Definition>, LoaderError> {
        let doc = self
            .resource
            .resolve_definition(DefinitionKind::Workflow, reference, version)
            .await?;
        let DefinitionDocument::Workflow(mut def) = doc else {
            return Err(LoaderError::WrongKind {
                reference: reference.to_string(),
                expected: DefinitionKind::Workflow,
                actual: doc.kind(),
            });
        };
        self.inline_references(&mut def).await?;
        Ok(Arc::new(freeze(def)?))
    }

    /// Replace every task/action reference with the resolved inline
    /// definition.
    async fn inline_references(&self, def: &mut WorkflowDef) -> Result<(), LoaderError> {
        for node in &mut def.nodes {
            if let TaskRef::Reference(r) = &node.task {
                let doc = self
                    .resource
                    .resolve_definition(DefinitionKind::Task, &r.reference, r.version)
                    .await?;
                let DefinitionDocument::Task(task) = doc else {
                    return Err(LoaderError::WrongKind {
                        reference: r.reference.clone(),
                        expected: DefinitionKind::Task,
                        actual: doc.kind(),
                    });
                };
                node.task = TaskRef::Inline(task);
            }
            let TaskRef::Inline(task) = &mut node.task else { unreachable!() };
            for step in &mut task.steps {
                if let ActionRef::Reference(r) = &step.action {
                    let doc = self
                        .resource
                        .resolve_definition(DefinitionKind::Action, &r.reference, r.version)
                        .await?;
                    let DefinitionDocument::Action(action) = doc else {
                        return Err(LoaderError::WrongKind {
                            reference: r.reference.clone(),
                            expected: DefinitionKind::Action,
                            actual: doc.kind(),
                        });
                    };
                    step.action = ActionRef::Inline(action);
                }
            }
        }
        Ok(())
    }
}

/// Validate and freeze a fully-inlined workflow document.
pub fn freeze(def: WorkflowDef) -> Result<Definition, LoaderError> {
    // Node arena and ref → index map.
    let mut node_index: HashMap<Arc<str>, NodeIx> = HashMap::with_capacity(def.nodes.len());
    for (ix, node) in def.nodes.iter().enumerate() {
        let key: Arc<str> = Arc::from(node.node_ref.as_str());
        if node_index.insert(Arc::clone(&key), ix).is_some() {
            return Err(LoaderError::DuplicateNode(node.node_ref.clone()));
        }
    }

    let initial = *node_index
        .get(def.initial_node_ref.as_str())
        .ok_or_else(|| LoaderError::UnknownInitialNode(def.initial_node_ref.clone()))?;

    // Transition arena.
    let mut seen_transitions: HashSet<&str> = HashSet::new();
    let fan_out_refs: HashSet<&str> = def
        .transitions
        .iter()
        .filter(|t| t.is_fan_out())
        .map(|t| t.transition_ref.as_str())
        .collect();

    let mut transitions = Vec::with_capacity(def.transitions.len());
    let mut sync_by_group: HashMap<Arc<str>, Vec<TransitionIx>> = HashMap::new();
    for t in &def.transitions {
        if !seen_transitions.insert(t.transition_ref.as_str()) {
            return Err(LoaderError::DuplicateTransition(t.transition_ref.clone()));
        }
        let ix = transitions.len();
        let frozen = freeze_transition(t, &node_index, &fan_out_refs)?;
        if let Some(sync) = &frozen.sync {
            sync_by_group
                .entry(Arc::clone(&sync.group))
                .or_default()
                .push(ix);
        }
        transitions.push(frozen);
    }

    // Outgoing adjacency, priority-descending with ref tiebreak.
    let mut outgoing: Vec<Vec<TransitionIx>> = vec![Vec::new(); def.nodes.len()];
    for (ix, t) in transitions.iter().enumerate() {
        outgoing[t.from].push(ix);
    }
    for list in &mut outgoing {
        list.sort_by(|&a, &b| {
            let (ta, tb) = (&transitions[a], &transitions[b]);
            tb.priority
                .cmp(&ta.priority)
                .then_with(|| ta.transition_ref.cmp(&tb.transition_ref))
        });
    }

    // Reachability from the initial node.
    let mut reachable = vec![false; def.nodes.len()];
    let mut queue = VecDeque::from([initial]);
    reachable[initial] = true;
    while let Some(current) = queue.pop_front() {
        for &tix in &outgoing[current] {
            let to = transitions[tix].to;
            if !reachable[to] {
                reachable[to] = true;
                queue.push_back(to);
            }
        }
    }
    for (ix, node) in def.nodes.iter().enumerate() {
        if !reachable[ix] {
            return Err(LoaderError::UnreachableNode(node.node_ref.clone()));
        }
    }

    // Nodes with compiled tasks.
    let mut nodes = Vec::with_capacity(def.nodes.len());
    for node in &def.nodes {
        nodes.push(freeze_node(node)?);
    }

    // Top-level schemas and output mapping.
    let place = format!("workflow '{}'", def.reference);
    let input_schema = compile_opt(&def.input_schema, &format!("{place} inputSchema"))?;
    let state_schema = compile_opt(&def.state_schema, &format!("{place} stateSchema"))?;
    let output_schema = compile_opt(&def.output_schema, &format!("{place} outputSchema"))?;
    for (target, source) in &def.output_mapping {
        check_writable(target, &format!("{place} outputMapping"))?;
        check_namespaced_source(source, &format!("{place} outputMapping"), &[
            Namespace::State,
            Namespace::Output,
        ])?;
    }

    Ok(Definition {
        reference: Arc::from(def.reference.as_str()),
        version: def.version,
        input_schema,
        state_schema,
        output_schema,
        output_mapping: def.output_mapping,
        initial,
        nodes,
        transitions,
        outgoing,
        node_index,
        sync_by_group,
    })
}

fn compile_opt(schema: &Option<Value>, place: &str) -> Result<Option<CompiledSchema>, LoaderError> {
    schema
        .as_ref()
        .map(|raw| CompiledSchema::compile(raw, place))
        .transpose()
}

fn check_path(path: &str, place: &str) -> Result<Vec<Segment>, LoaderError> {
    jsonpath::parse(path).map_err(|e| LoaderError::BadPath {
        place: place.to_string(),
        path: path.to_string(),
        reason: e.to_string(),
    })
}

fn check_writable(path: &str, place: &str) -> Result<Vec<Segment>, LoaderError> {
    jsonpath::parse_writable(path).map_err(|e| LoaderError::BadPath {
        place: place.to_string(),
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Validate that a source path starts with one of the allowed namespaces.
fn check_namespaced_source(
    path: &str,
    place: &str,
    allowed: &[Namespace],
) -> Result<(), LoaderError> {
    let segments = check_path(path, place)?;
    let ns = match segments.first() {
        Some(Segment::Field(name)) => Namespace::from_segment(name),
        _ => None,
    };
    match ns {
        Some(ns) if allowed.contains(&ns) => Ok(()),
        _ => Err(LoaderError::BadTarget {
            place: place.to_string(),
            path: path.to_string(),
            expected: "a context namespace",
        }),
    }
}

fn freeze_transition(
    t: &TransitionDef,
    node_index: &HashMap<Arc<str>, NodeIx>,
    fan_out_refs: &HashSet<&str>,
) -> Result<FrozenTransition, LoaderError> {
    let place = format!("transition '{}'", t.transition_ref);
    let endpoint = |node_ref: &str| {
        node_index
            .get(node_ref)
            .copied()
            .ok_or_else(|| LoaderError::UnknownEndpoint {
                transition: t.transition_ref.clone(),
                node_ref: node_ref.to_string(),
            })
    };
    let from = endpoint(&t.from_node_ref)?;
    let to = endpoint(&t.to_node_ref)?;

    if t.spawn_count.is_some() && t.foreach.is_some() {
        return Err(LoaderError::SpawnAndForeach { transition: t.transition_ref.clone() });
    }

    let fan_out = match (&t.spawn_count, &t.foreach) {
        (Some(count), None) => {
            if *count > MAX_FAN_OUT {
                return Err(LoaderError::FanOutTooWide {
                    transition: t.transition_ref.clone(),
                    count: *count,
                });
            }
            Some(FanOutSpec::Count(*count))
        }
        (None, Some(foreach)) => {
            check_namespaced_source(&foreach.collection, &format!("{place} foreach"), &[
                Namespace::Input,
                Namespace::State,
                Namespace::Output,
                Namespace::Branch,
            ])?;
            Some(FanOutSpec::Foreach {
                collection: foreach.collection.clone(),
                item_var: foreach.item_var.clone(),
            })
        }
        (None, None) => None,
        (Some(_), Some(_)) => unreachable!(),
    };

    let sync = match &t.synchronization {
        Some(sync) => {
            if !fan_out_refs.contains(sync.sibling_group.as_str()) {
                return Err(LoaderError::FanInWithoutFanOut {
                    transition: t.transition_ref.clone(),
                    group: sync.sibling_group.clone(),
                });
            }
            let m = match sync.strategy {
                SyncStrategy::MOfN => match sync.m {
                    Some(m) if m >= 1 => Some(m),
                    _ => {
                        return Err(LoaderError::BadMParameter {
                            transition: t.transition_ref.clone(),
                        })
                    }
                },
                _ => None,
            };
            let merge = match &sync.merge {
                Some(merge) => {
                    let source_place = format!("{place} merge.source");
                    let segments = check_path(&merge.source, &source_place)?;
                    let Some(Segment::Field(first)) = segments.first() else {
                        return Err(LoaderError::BadTarget {
                            place: source_place,
                            path: merge.source.clone(),
                            expected: "the _branch namespace",
                        });
                    };
                    if Namespace::from_segment(first) != Some(Namespace::Branch) {
                        return Err(LoaderError::BadTarget {
                            place: source_place,
                            path: merge.source.clone(),
                            expected: "the _branch namespace",
                        });
                    }
                    let target_place = format!("{place} merge.target");
                    check_writable(&merge.target, &target_place)?;
                    check_namespaced_source(&merge.target, &target_place, &[
                        Namespace::State,
                        Namespace::Output,
                    ])?;
                    Some(FrozenMerge {
                        source: segments[1..].to_vec(),
                        target: merge.target.clone(),
                        strategy: merge.strategy,
                    })
                }
                None => None,
            };
            Some(FrozenSync {
                strategy: sync.strategy,
                m,
                group: Arc::from(sync.sibling_group.as_str()),
                merge,
            })
        }
        None => None,
    };

    let condition = t
        .condition
        .as_deref()
        .map(Condition::parse)
        .transpose()?;

    Ok(FrozenTransition {
        transition_ref: Arc::from(t.transition_ref.as_str()),
        from,
        to,
        priority: t.priority,
        condition,
        fan_out,
        sync,
    })
}

fn freeze_node(node: &NodeDef) -> Result<FrozenNode, LoaderError> {
    let TaskRef::Inline(task) = &node.task else {
        return Err(LoaderError::BadSchema {
            place: format!("node '{}'", node.node_ref),
            reason: "task reference was not resolved before freezing".to_string(),
        });
    };
    let place = format!("node '{}'", node.node_ref);

    // inputMapping: taskInputField ← context path.
    for (target, source) in &node.input_mapping {
        check_writable(target, &format!("{place} inputMapping"))?;
        check_namespaced_source(source, &format!("{place} inputMapping"), &[
            Namespace::Input,
            Namespace::State,
            Namespace::Output,
            Namespace::Branch,
        ])?;
    }

    // outputMapping: context path (state/output/_branch) ← task-output path.
    for (target, source) in &node.output_mapping {
        check_path(source, &format!("{place} outputMapping"))?;
        let segments = check_writable(target, &format!("{place} outputMapping"))?;
        let ns = match segments.first() {
            Some(Segment::Field(name)) => Namespace::from_segment(name),
            _ => None,
        };
        if !matches!(ns, Some(Namespace::State | Namespace::Output | Namespace::Branch)) {
            return Err(LoaderError::BadTarget {
                place: format!("{place} outputMapping"),
                path: target.clone(),
                expected: "state.*, output.*, or _branch.*",
            });
        }
    }

    Ok(FrozenNode {
        node_ref: Arc::from(node.node_ref.as_str()),
        task: freeze_task(task, &node.node_ref)?,
        input_mapping: node.input_mapping.clone(),
        output_mapping: node.output_mapping.clone(),
    })
}

fn freeze_task(task: &TaskDef, node_ref: &str) -> Result<FrozenTask, LoaderError> {
    let place = format!("task for node '{node_ref}'");
    let mut seen_ordinals = HashSet::new();
    let mut steps = Vec::with_capacity(task.steps.len());

    for step in &task.steps {
        if !seen_ordinals.insert(step.ordinal) {
            return Err(LoaderError::DuplicateOrdinal {
                node: node_ref.to_string(),
                ordinal: step.ordinal,
            });
        }
        steps.push(freeze_step(step, &place)?);
    }
    steps.sort_by_key(|s| s.ordinal);

    Ok(FrozenTask {
        reference: Arc::from(task.reference.as_str()),
        version: task.version,
        input_schema: compile_opt(&task.input_schema, &format!("{place} inputSchema"))?,
        output_schema: compile_opt(&task.output_schema, &format!("{place} outputSchema"))?,
        steps,
        retry: task.retry.clone().unwrap_or_default(),
        timeout: task.timeout_ms.map(Duration::from_millis),
    })
}

fn freeze_step(step: &StepDef, task_place: &str) -> Result<FrozenStep, LoaderError> {
    let place = format!("{task_place} step '{}'", step.step_ref);
    let ActionRef::Inline(action) = &step.action else {
        return Err(LoaderError::BadSchema {
            place,
            reason: "action reference was not resolved before freezing".to_string(),
        });
    };

    for (target, source) in &step.input_mapping {
        check_writable(target, &format!("{place} inputMapping"))?;
        check_path(source, &format!("{place} inputMapping"))?;
    }
    for (target, source) in &step.output_mapping {
        check_writable(target, &format!("{place} outputMapping"))?;
        check_path(source, &format!("{place} outputMapping"))?;
    }

    let condition = match &step.condition {
        Some(c) => Some(FrozenStepCondition {
            when: Condition::parse(&c.if_expr)?,
            then: c.then,
            else_: c.else_,
        }),
        None => None,
    };

    Ok(FrozenStep {
        step_ref: Arc::from(step.step_ref.as_str()),
        ordinal: step.ordinal,
        action: Arc::new(action.clone()),
        input_mapping: step.input_mapping.clone(),
        output_mapping: step.output_mapping.clone(),
        on_failure: step.on_failure,
        condition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDef;

    fn parse_def(yaml: &str) -> WorkflowDef {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn two_node_yaml(extra_transitions: &str) -> String {
        format!(
            r#"
reference: demo
initialNodeRef: first
nodes:
  - ref: first
    task:
      steps: []
  - ref: second
    task:
      steps: []
transitions:
  - ref: t1
    fromNodeRef: first
    toNodeRef: second
{extra_transitions}"#
        )
    }

    #[test]
    fn freezes_minimal_graph() {
        let def = freeze(parse_def(&two_node_yaml(""))).unwrap();
        assert_eq!(def.node_count(), 2);
        assert_eq!(def.initial, def.node_ix("first").unwrap());
        assert_eq!(def.outgoing(def.initial).len(), 1);
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let yaml = r#"
reference: demo
initialNodeRef: a
nodes:
  - ref: a
    task: { steps: [] }
  - ref: a
    task: { steps: [] }
"#;
        assert!(matches!(
            freeze(parse_def(yaml)),
            Err(LoaderError::DuplicateNode(_))
        ));
    }

    #[test]
    fn rejects_unknown_initial() {
        let yaml = r#"
reference: demo
initialNodeRef: nope
nodes:
  - ref: a
    task: { steps: [] }
"#;
        assert!(matches!(
            freeze(parse_def(yaml)),
            Err(LoaderError::UnknownInitialNode(_))
        ));
    }

    #[test]
    fn rejects_unknown_endpoint() {
        let yaml = r#"
reference: demo
initialNodeRef: a
nodes:
  - ref: a
    task: { steps: [] }
transitions:
  - ref: t1
    fromNodeRef: a
    toNodeRef: ghost
"#;
        assert!(matches!(
            freeze(parse_def(yaml)),
            Err(LoaderError::UnknownEndpoint { .. })
        ));
    }

    #[test]
    fn rejects_unreachable_node() {
        let yaml = r#"
reference: demo
initialNodeRef: a
nodes:
  - ref: a
    task: { steps: [] }
  - ref: island
    task: { steps: [] }
"#;
        assert!(matches!(
            freeze(parse_def(yaml)),
            Err(LoaderError::UnreachableNode(n)) if n == "island"
        ));
    }

    #[test]
    fn rejects_fan_in_without_fan_out() {
        let extra = r#"
  - ref: t2
    fromNodeRef: second
    toNodeRef: first
    synchronization:
      strategy: all
      siblingGroup: no-such-fan-out
"#;
        assert!(matches!(
            freeze(parse_def(&two_node_yaml(extra))),
            Err(LoaderError::FanInWithoutFanOut { .. })
        ));
    }

    #[test]
    fn accepts_matched_fan_in() {
        let yaml = r#"
reference: demo
initialNodeRef: init
nodes:
  - ref: init
    task: { steps: [] }
  - ref: worker
    task: { steps: [] }
  - ref: done
    task: { steps: [] }
transitions:
  - ref: spread
    fromNodeRef: init
    toNodeRef: worker
    spawnCount: 3
  - ref: gather
    fromNodeRef: worker
    toNodeRef: done
    synchronization:
      strategy: all
      siblingGroup: spread
      merge:
        source: "$._branch.value"
        target: "$.state.results"
        strategy: append
"#;
        let def = freeze(parse_def(yaml)).unwrap();
        let gather_group = def.sync_transitions("spread");
        assert_eq!(gather_group.len(), 1);
        let t = def.transition(gather_group[0]);
        let sync = t.sync.as_ref().unwrap();
        assert_eq!(sync.strategy, SyncStrategy::All);
        let merge = sync.merge.as_ref().unwrap();
        assert_eq!(merge.target, "$.state.results");
        assert_eq!(merge.source, vec![Segment::Field("value".to_string())]);
    }

    #[test]
    fn rejects_merge_source_outside_branch() {
        let yaml = r#"
reference: demo
initialNodeRef: init
nodes:
  - ref: init
    task: { steps: [] }
  - ref: worker
    task: { steps: [] }
transitions:
  - ref: spread
    fromNodeRef: init
    toNodeRef: worker
    spawnCount: 2
  - ref: gather
    fromNodeRef: worker
    toNodeRef: init
    synchronization:
      strategy: all
      siblingGroup: spread
      merge:
        source: "$.state.value"
        target: "$.state.results"
        strategy: append
"#;
        assert!(matches!(
            freeze(parse_def(yaml)),
            Err(LoaderError::BadTarget { .. })
        ));
    }

    #[test]
    fn rejects_merge_target_outside_state_output() {
        let yaml = r#"
reference: demo
initialNodeRef: init
nodes:
  - ref: init
    task: { steps: [] }
  - ref: worker
    task: { steps: [] }
transitions:
  - ref: spread
    fromNodeRef: init
    toNodeRef: worker
    spawnCount: 2
  - ref: gather
    fromNodeRef: worker
    toNodeRef: init
    synchronization:
      strategy: all
      siblingGroup: spread
      merge:
        source: "$._branch.value"
        target: "$.input.results"
        strategy: append
"#;
        assert!(matches!(
            freeze(parse_def(yaml)),
            Err(LoaderError::BadTarget { .. })
        ));
    }

    #[test]
    fn rejects_spawn_and_foreach_together() {
        let extra = r#"
  - ref: t2
    fromNodeRef: second
    toNodeRef: first
    spawnCount: 2
    foreach:
      collection: "$.state.items"
      itemVar: item
"#;
        assert!(matches!(
            freeze(parse_def(&two_node_yaml(extra))),
            Err(LoaderError::SpawnAndForeach { .. })
        ));
    }

    #[test]
    fn rejects_m_of_n_without_m() {
        let yaml = r#"
reference: demo
initialNodeRef: init
nodes:
  - ref: init
    task: { steps: [] }
  - ref: worker
    task: { steps: [] }
transitions:
  - ref: spread
    fromNodeRef: init
    toNodeRef: worker
    spawnCount: 3
  - ref: gather
    fromNodeRef: worker
    toNodeRef: init
    synchronization:
      strategy: m_of_n
      siblingGroup: spread
"#;
        assert!(matches!(
            freeze(parse_def(yaml)),
            Err(LoaderError::BadMParameter { .. })
        ));
    }

    #[test]
    fn rejects_node_output_mapping_outside_context() {
        let yaml = r#"
reference: demo
initialNodeRef: a
nodes:
  - ref: a
    task: { steps: [] }
    outputMapping:
      result: "$.value"
"#;
        assert!(matches!(
            freeze(parse_def(yaml)),
            Err(LoaderError::BadTarget { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_ordinals() {
        let yaml = r#"
reference: demo
initialNodeRef: a
nodes:
  - ref: a
    task:
      steps:
        - ref: s1
          ordinal: 0
          action: { kind: mock }
        - ref: s2
          ordinal: 0
          action: { kind: mock }
"#;
        assert!(matches!(
            freeze(parse_def(yaml)),
            Err(LoaderError::DuplicateOrdinal { .. })
        ));
    }

    #[test]
    fn rejects_bad_condition() {
        let extra = r#"
  - ref: t2
    fromNodeRef: second
    toNodeRef: first
    condition: "$.state.x =="
"#;
        assert!(matches!(
            freeze(parse_def(&two_node_yaml(extra))),
            Err(LoaderError::Condition(_))
        ));
    }

    #[test]
    fn rejects_wide_spawn_count() {
        let extra = format!(
            r#"
  - ref: t2
    fromNodeRef: second
    toNodeRef: first
    spawnCount: {}
"#,
            MAX_FAN_OUT + 1
        );
        assert!(matches!(
            freeze(parse_def(&two_node_yaml(&extra))),
            Err(LoaderError::FanOutTooWide { .. })
        ));
    }

    #[test]
    fn outgoing_sorted_by_priority_then_ref() {
        let yaml = r#"
reference: demo
initialNodeRef: a
nodes:
  - ref: a
    task: { steps: [] }
  - ref: b
    task: { steps: [] }
transitions:
  - ref: t-low
    fromNodeRef: a
    toNodeRef: b
    priority: 1
  - ref: t-b
    fromNodeRef: a
    toNodeRef: b
    priority: 5
  - ref: t-a
    fromNodeRef: a
    toNodeRef: b
    priority: 5
"#;
        let def = freeze(parse_def(yaml)).unwrap();
        let refs: Vec<&str> = def
            .outgoing(def.initial)
            .iter()
            .map(|&ix| def.transition(ix).transition_ref.as_ref())
            .collect();
        assert_eq!(refs, vec!["t-a", "t-b", "t-low"]);
    }

    #[test]
    fn steps_sorted_by_ordinal() {
        let yaml = r#"
reference: demo
initialNodeRef: a
nodes:
  - ref: a
    task:
      steps:
        - ref: later
          ordinal: 5
          action: { kind: mock }
        - ref: earlier
          ordinal: 1
          action: { kind: mock }
"#;
        let def = freeze(parse_def(yaml)).unwrap();
        let steps = &def.node(def.initial).task.steps;
        assert_eq!(steps[0].step_ref.as_ref(), "earlier");
        assert_eq!(steps[1].step_ref.as_ref(), "later");
    }

    #[test]
    fn schemas_compile_and_check() {
        let yaml = r#"
reference: demo
initialNodeRef: a
inputSchema:
  type: object
  required: [city]
  properties:
    city: { type: string }
nodes:
  - ref: a
    task: { steps: [] }
"#;
        let def = freeze(parse_def(yaml)).unwrap();
        let schema = def.input_schema.as_ref().unwrap();
        assert!(schema.check(&serde_json::json!({"city": "Paris"})).is_ok());
        assert!(schema.check(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn loader_resolves_task_and_action_references() {
        use crate::definition::{ActionDef, ActionKind, TaskDef};
        use crate::resource::InMemoryResourceService;

        let svc = Arc::new(InMemoryResourceService::new());
        svc.register(DefinitionDocument::Action(ActionDef {
            reference: "emit".into(),
            version: 1,
            action_kind: ActionKind::Mock,
            implementation: serde_json::json!({"output": {"ok": true}}),
            requires: None,
            produces: None,
        }));
        svc.register(DefinitionDocument::Task(TaskDef {
            reference: "shared".into(),
            version: 1,
            input_schema: None,
            output_schema: None,
            steps: vec![serde_yaml::from_str(
                "ref: s1\nordinal: 0\naction:\n  reference: emit\n",
            )
            .unwrap()],
            retry: None,
            timeout_ms: None,
        }));
        svc.register(DefinitionDocument::Workflow(
            serde_yaml::from_str(
                r#"
reference: demo
initialNodeRef: a
nodes:
  - ref: a
    task:
      reference: shared
"#,
            )
            .unwrap(),
        ));

        let loader = DefinitionLoader::new(svc);
        let def = loader.load("demo", None).await.unwrap();
        let step = &def.node(def.initial).task.steps[0];
        assert_eq!(step.action.reference, "emit");
        assert_eq!(step.action.implementation["output"]["ok"], true);
    }
}
