//! Fluent builders for constructing workflow definitions programmatically.
//!
//! Definitions normally arrive as YAML/JSON documents; the builders exist
//! for tests and embedding callers that assemble graphs in code.

use serde_json::Value;

use crate::definition::{
    ActionDef, ActionKind, ActionRef, Backoff, ForeachDef, Mapping, MergeDef, MergeStrategy,
    NodeDef, RetryPolicy, StepCondition, StepDef, StepDirective, SyncDef, SyncStrategy, TaskDef,
    TaskRef, TransitionDef, WorkflowDef,
};

/// Fluent builder for a workflow graph document.
pub struct WorkflowBuilder {
    def: WorkflowDef,
}

impl WorkflowBuilder {
    pub fn new(reference: &str, initial_node_ref: &str) -> Self {
        Self {
            def: WorkflowDef {
                reference: reference.to_string(),
                version: 1,
                input_schema: None,
                state_schema: None,
                output_schema: None,
                output_mapping: Mapping::new(),
                initial_node_ref: initial_node_ref.to_string(),
                nodes: Vec::new(),
                transitions: Vec::new(),
            },
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.def.version = version;
        self
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.def.input_schema = Some(schema);
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.def.output_schema = Some(schema);
        self
    }

    /// Terminal mapping: `outputField ← JSONPath`.
    pub fn output(mut self, field: &str, source: &str) -> Self {
        self.def.output_mapping.insert(field.to_string(), source.to_string());
        self
    }

    pub fn node(mut self, node: NodeBuilder) -> Self {
        self.def.nodes.push(node.build());
        self
    }

    pub fn transition(mut self, transition: TransitionBuilder) -> Self {
        self.def.transitions.push(transition.build());
        self
    }

    pub fn build(self) -> WorkflowDef {
        self.def
    }
}

/// Builder for one node and its inline task.
pub struct NodeBuilder {
    node: NodeDef,
    task: TaskDef,
}

impl NodeBuilder {
    pub fn new(node_ref: &str) -> Self {
        Self {
            node: NodeDef {
                node_ref: node_ref.to_string(),
                task: TaskRef::Inline(empty_task()),
                input_mapping: Mapping::new(),
                output_mapping: Mapping::new(),
                resource_bindings: Default::default(),
            },
            task: empty_task(),
        }
    }

    /// taskInputField ← context path.
    pub fn input(mut self, field: &str, source: &str) -> Self {
        self.node.input_mapping.insert(field.to_string(), source.to_string());
        self
    }

    /// context path ← task-output path.
    pub fn output(mut self, target: &str, source: &str) -> Self {
        self.node.output_mapping.insert(target.to_string(), source.to_string());
        self
    }

    pub fn step(mut self, step: StepBuilder) -> Self {
        self.task.steps.push(step.build());
        self
    }

    pub fn task_input_schema(mut self, schema: Value) -> Self {
        self.task.input_schema = Some(schema);
        self
    }

    pub fn task_output_schema(mut self, schema: Value) -> Self {
        self.task.output_schema = Some(schema);
        self
    }

    pub fn retry(mut self, max_attempts: u32, backoff: Backoff, initial_delay_ms: u64) -> Self {
        self.task.retry = Some(RetryPolicy { max_attempts, backoff, initial_delay_ms });
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.task.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn build(mut self) -> NodeDef {
        self.node.task = TaskRef::Inline(self.task);
        self.node
    }
}

/// Builder for one step with a mock action.
pub struct StepBuilder {
    step: StepDef,
}

impl StepBuilder {
    pub fn mock(step_ref: &str, ordinal: u32, implementation: Value) -> Self {
        Self {
            step: StepDef {
                step_ref: step_ref.to_string(),
                ordinal,
                action: ActionRef::Inline(ActionDef {
                    reference: step_ref.to_string(),
                    version: 1,
                    action_kind: ActionKind::Mock,
                    implementation,
                    requires: None,
                    produces: None,
                }),
                input_mapping: Mapping::new(),
                output_mapping: Mapping::new(),
                on_failure: Default::default(),
                condition: None,
            },
        }
    }

    /// actionInputField ← task-scope path.
    pub fn input(mut self, field: &str, source: &str) -> Self {
        self.step.input_mapping.insert(field.to_string(), source.to_string());
        self
    }

    /// task-scope path ← action-output path.
    pub fn output(mut self, target: &str, source: &str) -> Self {
        self.step.output_mapping.insert(target.to_string(), source.to_string());
        self
    }

    pub fn on_failure(mut self, on_failure: crate::definition::OnFailure) -> Self {
        self.step.on_failure = on_failure;
        self
    }

    pub fn condition(mut self, if_expr: &str, then: StepDirective, else_: StepDirective) -> Self {
        self.step.condition = Some(StepCondition { if_expr: if_expr.to_string(), then, else_ });
        self
    }

    pub fn build(self) -> StepDef {
        self.step
    }
}

/// Builder for a transition.
pub struct TransitionBuilder {
    transition: TransitionDef,
}

impl TransitionBuilder {
    pub fn new(transition_ref: &str, from: &str, to: &str) -> Self {
        Self {
            transition: TransitionDef {
                transition_ref: transition_ref.to_string(),
                from_node_ref: from.to_string(),
                to_node_ref: to.to_string(),
                priority: 0,
                condition: None,
                spawn_count: None,
                foreach: None,
                synchronization: None,
                sibling_group: None,
            },
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.transition.priority = priority;
        self
    }

    pub fn condition(mut self, condition: &str) -> Self {
        self.transition.condition = Some(condition.to_string());
        self
    }

    pub fn spawn(mut self, count: usize) -> Self {
        self.transition.spawn_count = Some(count);
        self
    }

    pub fn foreach(mut self, collection: &str, item_var: &str) -> Self {
        self.transition.foreach = Some(ForeachDef {
            collection: collection.to_string(),
            item_var: item_var.to_string(),
        });
        self
    }

    /// Fan-in on `group` with a merge.
    pub fn fan_in(
        mut self,
        strategy: SyncStrategy,
        m: Option<usize>,
        group: &str,
        merge: Option<(&str, &str, MergeStrategy)>,
    ) -> Self {
        self.transition.synchronization = Some(SyncDef {
            strategy,
            m,
            sibling_group: group.to_string(),
            merge: merge.map(|(source, target, strategy)| MergeDef {
                source: source.to_string(),
                target: target.to_string(),
                strategy,
            }),
        });
        self
    }

    pub fn build(self) -> TransitionDef {
        self.transition
    }
}

fn empty_task() -> TaskDef {
    TaskDef {
        reference: String::new(),
        version: 1,
        input_schema: None,
        output_schema: None,
        steps: Vec::new(),
        retry: None,
        timeout_ms: None,
    }
}
