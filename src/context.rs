//! Run context store.
//!
//! Four namespaces, addressed by the first JSONPath segment:
//! - `input`   - immutable after initialization
//! - `state`   - per-run mutable scratch, survives fan-out/fan-in
//! - `output`  - final workflow output
//! - `_branch` - per-token scratch for a branch's task outputs; flushed when
//!   the branch terminates but exposed to synchronization merges
//!
//! Values are plain JSON only. Reads of missing paths yield `None`, never an
//! error; writes into `input.*` are refused. All mutation happens on the run
//! actor, so the store itself needs no locking.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::jsonpath::{self, PathError, Segment};

/// Context namespace addressed by a path's first segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Input,
    State,
    Output,
    Branch,
}

impl Namespace {
    pub fn from_segment(name: &str) -> Option<Self> {
        match name {
            "input" => Some(Namespace::Input),
            "state" => Some(Namespace::State),
            "output" => Some(Namespace::Output),
            "_branch" => Some(Namespace::Branch),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    #[error("path '{path}' does not start with input, state, output, or _branch")]
    UnknownNamespace { path: String },

    #[error("namespace 'input' is read-only (path '{path}')")]
    ReadOnly { path: String },

    #[error("path '{path}' addresses a branch scope but no branch is bound")]
    MissingBranch { path: String },

    #[error(transparent)]
    Path(#[from] PathError),
}

/// A write that went through the store: which namespace it hit and the
/// canonical path, for `context.field_set` emission.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub namespace: Namespace,
    pub path: String,
    pub value: Value,
}

/// The run's context document plus per-token branch scopes.
#[derive(Debug, Clone)]
pub struct ContextStore {
    input: Value,
    state: Value,
    output: Value,
    branches: HashMap<Arc<str>, Value>,
}

impl ContextStore {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            state: Value::Object(serde_json::Map::new()),
            output: Value::Object(serde_json::Map::new()),
            branches: HashMap::new(),
        }
    }

    /// Read a namespaced path, optionally binding `_branch` to a token's
    /// scope. Missing keys resolve to `None`.
    pub fn read(&self, path: &str, branch: Option<&str>) -> Result<Option<Value>, ContextError> {
        let segments = jsonpath::parse(path)?;
        let (ns, rest) = self.split_namespace(path, &segments)?;
        let doc = match ns {
            Namespace::Input => &self.input,
            Namespace::State => &self.state,
            Namespace::Output => &self.output,
            Namespace::Branch => match branch.and_then(|id| self.branches.get(id)) {
                Some(doc) => doc,
                None => return Ok(None),
            },
        };
        Ok(jsonpath::read(doc, rest))
    }

    /// Write a namespaced path. Creates intermediates; refuses `input.*`.
    pub fn write(
        &mut self,
        path: &str,
        value: Value,
        branch: Option<&str>,
    ) -> Result<WriteRecord, ContextError> {
        let segments = jsonpath::parse_writable(path)?;
        let (ns, rest) = self.split_namespace(path, &segments)?;
        let rest = rest.to_vec();
        let doc = match ns {
            Namespace::Input => {
                return Err(ContextError::ReadOnly { path: path.to_string() });
            }
            Namespace::State => &mut self.state,
            Namespace::Output => &mut self.output,
            Namespace::Branch => {
                let id = branch.ok_or_else(|| ContextError::MissingBranch {
                    path: path.to_string(),
                })?;
                self.branches.entry(Arc::from(id)).or_insert(Value::Null)
            }
        };
        jsonpath::write(doc, &rest, value.clone())?;
        Ok(WriteRecord {
            namespace: ns,
            path: jsonpath::display(&rest),
            value,
        })
    }

    /// Apply a `target ← source-path` mapping onto the context.
    ///
    /// Entries are applied in lexicographic target order (the `BTreeMap`
    /// iteration order) and earlier writes are visible to later sources.
    /// Entries whose source resolves to nothing are skipped.
    pub fn apply_mapping<F>(
        &mut self,
        mapping: &std::collections::BTreeMap<String, String>,
        branch: Option<&str>,
        mut resolve: F,
    ) -> Result<Vec<WriteRecord>, ContextError>
    where
        F: FnMut(&ContextStore, &str) -> Result<Option<Value>, ContextError>,
    {
        let mut writes = Vec::with_capacity(mapping.len());
        for (target, source) in mapping {
            let Some(value) = resolve(self, source)? else {
                continue;
            };
            writes.push(self.write(target, value, branch)?);
        }
        Ok(writes)
    }

    /// Deep, immutable view of `{input, state, output}`. Branch scopes are
    /// excluded: they are ephemeral and never part of the persisted context.
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "input": self.input.clone(),
            "state": self.state.clone(),
            "output": self.output.clone(),
        })
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn output(&self) -> &Value {
        &self.output
    }

    // ── branch scope management ──────────────────────────────────────

    /// Create a fresh branch scope, optionally seeded with a fan-out item
    /// variable.
    pub fn init_branch(&mut self, token: &Arc<str>, seed: Option<(&str, Value)>) {
        let mut doc = Value::Object(serde_json::Map::new());
        if let Some((var, value)) = seed {
            let map = doc.as_object_mut().expect("fresh object");
            map.insert(var.to_string(), value);
        }
        self.branches.insert(Arc::clone(token), doc);
    }

    /// Deep-copy a branch scope onto a continuation token so outputs
    /// accumulated along the branch survive to the fan-in merge.
    pub fn fork_branch(&mut self, from: &str, to: &Arc<str>) {
        let doc = self
            .branches
            .get(from)
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        self.branches.insert(Arc::clone(to), doc);
    }

    /// Drop a terminated token's scope.
    pub fn drop_branch(&mut self, token: &str) {
        self.branches.remove(token);
    }

    pub fn branch(&self, token: &str) -> Option<&Value> {
        self.branches.get(token)
    }

    fn split_namespace<'s>(
        &self,
        path: &str,
        segments: &'s [Segment],
    ) -> Result<(Namespace, &'s [Segment]), ContextError> {
        match segments.first() {
            Some(Segment::Field(name)) => match Namespace::from_segment(name) {
                Some(ns) => Ok((ns, &segments[1..])),
                None => Err(ContextError::UnknownNamespace { path: path.to_string() }),
            },
            _ => Err(ContextError::UnknownNamespace { path: path.to_string() }),
        }
    }
}

/// Apply a `target-field ← source-path` mapping onto a plain document (task
/// input, action input, task scope). Same ordering and skip rules as
/// [`ContextStore::apply_mapping`].
pub fn apply_mapping_into<F>(
    doc: &mut Value,
    mapping: &std::collections::BTreeMap<String, String>,
    mut resolve: F,
) -> Result<(), PathError>
where
    F: FnMut(&str) -> Result<Option<Value>, PathError>,
{
    for (target, source) in mapping {
        let segments = jsonpath::parse_writable(target)?;
        let Some(value) = resolve(source)? else {
            continue;
        };
        jsonpath::write(doc, &segments, value)?;
    }
    Ok(())
}
