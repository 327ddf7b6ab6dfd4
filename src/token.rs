//! Tokens: moving cursors over the workflow graph.
//!
//! Every in-flight branch of a run is one token. The token manager owns all
//! tokens for a run (it lives inside the run actor, so no locking), enforces
//! the lifecycle state machine, and answers lineage queries for fan-in
//! barrier membership.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::TaskFailure;

pub type TokenId = Arc<str>;

/// Token lifecycle. `pending → dispatched → executing → terminal`, with
/// `waiting_at_fan_in` inserted before `completed` for tokens whose
/// completion was absorbed into a barrier. Cancellation is reachable from
/// any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Pending,
    Dispatched,
    Executing,
    WaitingAtFanIn,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TokenStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TokenStatus::Completed
                | TokenStatus::Failed
                | TokenStatus::Cancelled
                | TokenStatus::TimedOut
        )
    }

    /// The legal lifecycle edges. Anything else is a coordinator bug.
    pub fn can_transition_to(self, next: TokenStatus) -> bool {
        use TokenStatus::*;
        match (self, next) {
            (Pending, Dispatched) => true,
            // Arrival tokens enter the barrier without executing a task.
            (Pending, WaitingAtFanIn) => true,
            (Dispatched, Executing) => true,
            // Mapping failures can surface before the worker starts.
            (Dispatched, Failed) => true,
            (Executing, Completed | Failed | TimedOut | WaitingAtFanIn) => true,
            (WaitingAtFanIn, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TokenStatus::Pending => "pending",
            TokenStatus::Dispatched => "dispatched",
            TokenStatus::Executing => "executing",
            TokenStatus::WaitingAtFanIn => "waiting_at_fan_in",
            TokenStatus::Completed => "completed",
            TokenStatus::Failed => "failed",
            TokenStatus::Cancelled => "cancelled",
            TokenStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// One in-flight (or finished) branch cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub run_id: Arc<str>,
    /// Frozen-graph node index.
    pub node: usize,
    pub node_ref: Arc<str>,
    pub status: TokenStatus,
    pub parent: Option<TokenId>,
    /// Set on fan-out children: the transition that spawned this token.
    pub fan_out_transition: Option<Arc<str>>,
    pub sibling_group: Option<Arc<str>>,
    pub branch_index: usize,
    pub branch_total: usize,
    /// Monotonic creation ordinal within the run (actor-assigned).
    pub created_at: u64,
    pub updated_at: u64,
}

/// Owns and orders every token of one run.
#[derive(Debug)]
pub struct TokenManager {
    run_id: Arc<str>,
    tokens: HashMap<TokenId, Token>,
    order: Vec<TokenId>,
    clock: u64,
}

impl TokenManager {
    pub fn new(run_id: Arc<str>) -> Self {
        Self { run_id, tokens: HashMap::new(), order: Vec::new(), clock: 0 }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, token: Token) -> TokenId {
        let id = Arc::clone(&token.id);
        self.order.push(Arc::clone(&id));
        self.tokens.insert(Arc::clone(&id), token);
        id
    }

    /// The root token of the run: no parent, a sibling group of one.
    pub fn create_root(&mut self, node: usize, node_ref: Arc<str>) -> TokenId {
        let now = self.tick();
        let token = Token {
            id: Arc::from(Ulid::new().to_string()),
            run_id: Arc::clone(&self.run_id),
            node,
            node_ref,
            status: TokenStatus::Pending,
            parent: None,
            fan_out_transition: None,
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            created_at: now,
            updated_at: now,
        };
        self.insert(token)
    }

    /// A plain continuation: single successor of a completed token.
    pub fn create_continuation(
        &mut self,
        parent: &TokenId,
        node: usize,
        node_ref: Arc<str>,
    ) -> TokenId {
        let now = self.tick();
        let token = Token {
            id: Arc::from(Ulid::new().to_string()),
            run_id: Arc::clone(&self.run_id),
            node,
            node_ref,
            status: TokenStatus::Pending,
            parent: Some(Arc::clone(parent)),
            fan_out_transition: None,
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            created_at: now,
            updated_at: now,
        };
        self.insert(token)
    }

    /// An arrival token: the branch's presence at a fan-in barrier. Created
    /// `pending` and immediately moved to `waiting_at_fan_in` by the
    /// router; it completes when the barrier fires.
    pub fn create_arrival(
        &mut self,
        parent: &TokenId,
        node: usize,
        node_ref: Arc<str>,
        sibling_group: &Arc<str>,
        branch_index: usize,
        branch_total: usize,
    ) -> TokenId {
        let now = self.tick();
        let token = Token {
            id: Arc::from(Ulid::new().to_string()),
            run_id: Arc::clone(&self.run_id),
            node,
            node_ref,
            status: TokenStatus::Pending,
            parent: Some(Arc::clone(parent)),
            fan_out_transition: None,
            sibling_group: Some(Arc::clone(sibling_group)),
            branch_index,
            branch_total,
            created_at: now,
            updated_at: now,
        };
        self.insert(token)
    }

    /// `count` sibling tokens sharing one fan-out transition. Returned in
    /// ascending `branch_index` order so dispatch is deterministic.
    pub fn fan_out(
        &mut self,
        parent: &TokenId,
        transition_ref: &Arc<str>,
        node: usize,
        node_ref: &Arc<str>,
        count: usize,
    ) -> Vec<TokenId> {
        (0..count)
            .map(|index| {
                let now = self.tick();
                let token = Token {
                    id: Arc::from(Ulid::new().to_string()),
                    run_id: Arc::clone(&self.run_id),
                    node,
                    node_ref: Arc::clone(node_ref),
                    status: TokenStatus::Pending,
                    parent: Some(Arc::clone(parent)),
                    fan_out_transition: Some(Arc::clone(transition_ref)),
                    sibling_group: Some(Arc::clone(transition_ref)),
                    branch_index: index,
                    branch_total: count,
                    created_at: now,
                    updated_at: now,
                };
                self.insert(token)
            })
            .collect()
    }

    /// Apply a lifecycle transition. An illegal edge is a coordinator bug
    /// and fails fatally.
    pub fn transition(&mut self, id: &str, next: TokenStatus) -> Result<TokenStatus, TaskFailure> {
        let now = self.tick();
        let token = self
            .tokens
            .get_mut(id)
            .ok_or_else(|| TaskFailure::invariant(format!("unknown token '{id}'")))?;
        let prev = token.status;
        if !prev.can_transition_to(next) {
            return Err(TaskFailure::invariant(format!(
                "illegal token transition {prev} -> {next} for '{id}'"
            )));
        }
        token.status = next;
        token.updated_at = now;
        Ok(prev)
    }

    pub fn get(&self, id: &str) -> Option<&Token> {
        self.tokens.get(id)
    }

    /// All tokens in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.order.iter().filter_map(|id| self.tokens.get(id))
    }

    /// Tokens currently in `status`.
    pub fn query(&self, status: TokenStatus) -> impl Iterator<Item = &Token> {
        self.iter().filter(move |t| t.status == status)
    }

    /// Ids of every non-terminal token, in creation order.
    pub fn non_terminal_ids(&self) -> Vec<TokenId> {
        self.iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| Arc::clone(&t.id))
            .collect()
    }

    /// True when nothing is pending, dispatched, executing, or waiting.
    pub fn is_quiescent(&self) -> bool {
        self.iter().all(|t| t.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Walk the lineage from `id` (inclusive) to the nearest token spawned
    /// by the fan-out transition `group`: the innermost enclosing branch
    /// root. Its parent and branch fields define barrier membership.
    pub fn branch_root(&self, id: &str, group: &str) -> Option<&Token> {
        let mut current = self.tokens.get(id)?;
        loop {
            if current.fan_out_transition.as_deref() == Some(group) {
                return Some(current);
            }
            current = self.tokens.get(current.parent.as_deref()?)?;
        }
    }

    /// Innermost enclosing fan-out group of a token, if any. Used to decide
    /// whether a failed token can be absorbed by a barrier adjustment.
    pub fn enclosing_group(&self, id: &str) -> Option<&Token> {
        let mut current = self.tokens.get(id)?;
        loop {
            if current.fan_out_transition.is_some() {
                return Some(current);
            }
            current = self.tokens.get(current.parent.as_deref()?)?;
        }
    }
}
