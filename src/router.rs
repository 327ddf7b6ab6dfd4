//! Router and synchronizer.
//!
//! Invoked by the run actor whenever a token's task succeeds or fails.
//! Routing picks the first matching outgoing transition (priority
//! descending, ref ascending on ties), then dispatches on its flavor:
//! plain continuation, fan-out (spawnCount or foreach), or fan-in barrier.
//!
//! A completing token at a fan-in transition produces an **arrival token**
//! that waits at the barrier; barriers accumulate arrivals per
//! `(parent token, transition)` and fire per their strategy. Merges apply
//! in ascending branch index regardless of completion order. Failed tokens
//! shrink their barrier's expected count so surviving siblings can still
//! rendezvous.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::context::ContextStore;
use crate::definition::{MergeStrategy, SyncStrategy};
use crate::dispatch::EventSink;
use crate::error::{FailureKind, TaskFailure};
use crate::events::EventPayload;
use crate::jsonpath;
use crate::loader::{Definition, FanOutSpec, FrozenMerge, FrozenTransition, MAX_FAN_OUT};
use crate::token::{TokenId, TokenManager, TokenStatus};

/// One recorded barrier arrival: the waiting arrival token plus the branch
/// index of the sibling it represents.
#[derive(Debug, Clone)]
struct Arrival {
    branch_index: usize,
    token_id: TokenId,
}

#[derive(Debug, Default)]
struct BarrierState {
    /// Sibling count at fan-out time.
    expected_total: usize,
    fired: bool,
    arrivals: Vec<Arrival>,
}

/// Barrier key: the siblings' common parent and the fan-in transition.
type BarrierKey = (TokenId, Arc<str>);
/// Failure key: the siblings' common parent and the fan-out group.
type GroupKey = (TokenId, Arc<str>);

/// Per-run routing state. Lives inside the run actor.
#[derive(Debug, Default)]
pub struct Router {
    barriers: HashMap<BarrierKey, BarrierState>,
    group_failures: HashMap<GroupKey, usize>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a token whose task just succeeded. The caller has already
    /// applied the node's output mapping. Returns freshly created tokens
    /// that need dispatching; `Err` fails the whole run.
    pub fn route_token(
        &mut self,
        token_id: &TokenId,
        def: &Definition,
        tokens: &mut TokenManager,
        ctx: &mut ContextStore,
        sink: &mut EventSink,
    ) -> Result<Vec<TokenId>, TaskFailure> {
        let (node_ix, node_ref) = {
            let token = tokens
                .get(token_id)
                .ok_or_else(|| TaskFailure::invariant(format!("routing unknown token '{token_id}'")))?;
            (token.node, Arc::clone(&token.node_ref))
        };
        sink.emit(EventPayload::RoutingStarted {}, Some(token_id), Some(&node_ref));

        // Step A: candidate selection. Outgoing transitions are pre-sorted
        // by descending priority with ref tiebreak; the first whose
        // condition passes wins.
        let matched = def
            .outgoing(node_ix)
            .iter()
            .map(|&tix| def.transition(tix))
            .find(|t| match &t.condition {
                Some(condition) => {
                    condition.eval(|path| ctx.read(path, Some(token_id.as_ref())).ok().flatten())
                }
                None => true,
            });

        let created = match matched {
            None => {
                self.complete_token(token_id, tokens, ctx, sink, true)?;
                Vec::new()
            }
            Some(t) if t.sync.is_some() => {
                self.arrive_at_barrier(token_id, t, def, tokens, ctx, sink)?
            }
            Some(t) if t.fan_out.is_some() => self.fan_out(token_id, t, def, tokens, ctx, sink)?,
            Some(t) => {
                // Plain transition: one continuation carrying the branch
                // scope forward so downstream merges see the whole branch.
                let to_ref = Arc::clone(&def.node(t.to).node_ref);
                let cont = tokens.create_continuation(token_id, t.to, to_ref);
                ctx.fork_branch(token_id, &cont);
                self.complete_token(token_id, tokens, ctx, sink, true)?;
                self.emit_created(&cont, tokens, sink);
                vec![cont]
            }
        };

        sink.emit(
            EventPayload::RoutingCompleted { continuations: created.len() },
            Some(token_id),
            Some(&node_ref),
        );
        Ok(created)
    }

    /// Record a failed (or timed-out) token. A failure inside a sibling
    /// group shrinks the matching barriers; a failure with no enclosing
    /// group fails the run. `Err` fails the run.
    pub fn note_failure(
        &mut self,
        token_id: &TokenId,
        failure: &TaskFailure,
        def: &Definition,
        tokens: &mut TokenManager,
        ctx: &mut ContextStore,
        sink: &mut EventSink,
    ) -> Result<Vec<TokenId>, TaskFailure> {
        ctx.drop_branch(token_id);

        let Some(root) = tokens.enclosing_group(token_id) else {
            return Err(failure.clone());
        };
        let group = Arc::clone(root.fan_out_transition.as_ref().expect("enclosing group"));
        let parent = Arc::clone(root.parent.as_ref().expect("fan-out child has a parent"));
        let expected_total = root.branch_total;

        let failures = self
            .group_failures
            .entry((Arc::clone(&parent), Arc::clone(&group)))
            .or_insert(0);
        *failures += 1;
        let failures = *failures;
        debug!(%group, failures, "sibling failure absorbed into barrier accounting");

        // Re-evaluate every barrier synchronizing on this group: the
        // survivors may now satisfy it, or it may have become unsatisfiable.
        let mut created = Vec::new();
        for &tix in def.sync_transitions(&group) {
            let t = def.transition(tix);
            let key = (Arc::clone(&parent), Arc::clone(&t.transition_ref));
            let barrier = self.barriers.entry(key.clone()).or_insert_with(|| BarrierState {
                expected_total,
                ..Default::default()
            });
            if barrier.fired {
                continue;
            }
            let survivors = expected_total.saturating_sub(failures);
            let arrivals = barrier.arrivals.len();
            let sync = t.sync.as_ref().expect("sync transition");
            let satisfied = match sync.strategy {
                SyncStrategy::All => arrivals >= survivors,
                SyncStrategy::Any => arrivals >= 1,
                SyncStrategy::MOfN => {
                    let m = sync.m.unwrap_or(1);
                    if survivors < m && arrivals < m {
                        return Err(TaskFailure::new(
                            failure.kind,
                            format!(
                                "barrier '{}' unsatisfiable: {survivors} of {expected_total} siblings survive, {m} required",
                                t.transition_ref
                            ),
                        ));
                    }
                    arrivals >= m
                }
            };
            if satisfied {
                created.extend(self.fire_barrier(&key, t, def, tokens, ctx, sink)?);
            } else if matches!(sync.strategy, SyncStrategy::Any) && survivors == 0 {
                return Err(TaskFailure::new(
                    failure.kind,
                    format!("barrier '{}' unsatisfiable: all siblings failed", t.transition_ref),
                ));
            }
        }
        Ok(created)
    }

    // ── flavors ──────────────────────────────────────────────────────

    fn fan_out(
        &mut self,
        token_id: &TokenId,
        t: &FrozenTransition,
        def: &Definition,
        tokens: &mut TokenManager,
        ctx: &mut ContextStore,
        sink: &mut EventSink,
    ) -> Result<Vec<TokenId>, TaskFailure> {
        let spec = t.fan_out.as_ref().expect("fan-out transition");
        let (count, items) = match spec {
            FanOutSpec::Count(n) => (*n, None),
            FanOutSpec::Foreach { collection, item_var } => {
                let value = ctx
                    .read(collection, Some(token_id.as_ref()))
                    .map_err(|e| TaskFailure::mapping(e.to_string()))?;
                let items = match value {
                    Some(Value::Array(items)) => items,
                    Some(other) => {
                        return Err(TaskFailure::mapping(format!(
                            "foreach collection '{collection}' is not an array: {other}"
                        )))
                    }
                    None => Vec::new(),
                };
                if items.len() > MAX_FAN_OUT {
                    return Err(TaskFailure::invariant(format!(
                        "foreach over {} items exceeds the fan-out bound {MAX_FAN_OUT}",
                        items.len()
                    )));
                }
                (items.len(), Some((item_var.clone(), items)))
            }
        };

        // The fan-out parent's branch scope stays alive: an enclosing
        // branch's outputs must survive until the join forks them onward.
        self.complete_token(token_id, tokens, ctx, sink, false)?;

        if count == 0 {
            // No children: barriers for this group fire immediately with
            // empty arrivals.
            let mut created = Vec::new();
            for &tix in def.sync_transitions(&t.transition_ref) {
                let sync_t = def.transition(tix);
                let key = (Arc::clone(token_id), Arc::clone(&sync_t.transition_ref));
                self.barriers.insert(
                    key.clone(),
                    BarrierState { expected_total: 0, ..Default::default() },
                );
                created.extend(self.fire_barrier(&key, sync_t, def, tokens, ctx, sink)?);
            }
            return Ok(created);
        }

        let to_ref = Arc::clone(&def.node(t.to).node_ref);
        let children = tokens.fan_out(token_id, &t.transition_ref, t.to, &to_ref, count);
        for (index, child) in children.iter().enumerate() {
            let seed = items
                .as_ref()
                .map(|(var, values)| (var.as_str(), values[index].clone()));
            ctx.init_branch(child, seed);
            self.emit_created(child, tokens, sink);
        }
        Ok(children)
    }

    /// A completing token reached a fan-in transition: complete it, park an
    /// arrival token at the barrier, maybe fire.
    fn arrive_at_barrier(
        &mut self,
        token_id: &TokenId,
        t: &FrozenTransition,
        def: &Definition,
        tokens: &mut TokenManager,
        ctx: &mut ContextStore,
        sink: &mut EventSink,
    ) -> Result<Vec<TokenId>, TaskFailure> {
        let sync = t.sync.as_ref().expect("fan-in transition");
        let root = tokens.branch_root(token_id, &sync.group).ok_or_else(|| {
            TaskFailure::invariant(format!(
                "token '{token_id}' reached fan-in '{}' outside sibling group '{}'",
                t.transition_ref, sync.group
            ))
        })?;
        let branch_index = root.branch_index;
        let branch_total = root.branch_total;
        let parent = Arc::clone(root.parent.as_ref().expect("fan-out child has a parent"));

        // The branch's outputs move onto the arrival token, which the merge
        // reads when the barrier fires.
        let to_ref = Arc::clone(&def.node(t.to).node_ref);
        let arrival = tokens.create_arrival(
            token_id,
            t.to,
            to_ref,
            &sync.group,
            branch_index,
            branch_total,
        );
        ctx.fork_branch(token_id, &arrival);
        self.complete_token(token_id, tokens, ctx, sink, true)?;
        self.emit_created(&arrival, tokens, sink);
        tokens.transition(&arrival, TokenStatus::WaitingAtFanIn)?;
        self.emit_status(&arrival, TokenStatus::Pending, TokenStatus::WaitingAtFanIn, tokens, sink);

        let key = (Arc::clone(&parent), Arc::clone(&t.transition_ref));
        let already_fired = self.barriers.get(&key).map(|b| b.fired).unwrap_or(false);
        if already_fired {
            // Late arrival for any/m_of_n: recorded, no further continuation.
            sink.emit(
                EventPayload::FanInLateArrival {
                    transition: t.transition_ref.to_string(),
                    group: sync.group.to_string(),
                },
                Some(&arrival),
                None,
            );
            tokens.transition(&arrival, TokenStatus::Completed)?;
            self.emit_status(&arrival, TokenStatus::WaitingAtFanIn, TokenStatus::Completed, tokens, sink);
            ctx.drop_branch(&arrival);
            return Ok(Vec::new());
        }

        let barrier = self.barriers.entry(key.clone()).or_insert_with(|| BarrierState {
            expected_total: branch_total,
            ..Default::default()
        });
        barrier.arrivals.push(Arrival {
            branch_index,
            token_id: Arc::clone(&arrival),
        });
        let arrivals = barrier.arrivals.len();
        let failures = self
            .group_failures
            .get(&(Arc::clone(&parent), Arc::clone(&sync.group)))
            .copied()
            .unwrap_or(0);
        let survivors = branch_total.saturating_sub(failures);
        sink.emit(
            EventPayload::FanInArrival {
                transition: t.transition_ref.to_string(),
                group: sync.group.to_string(),
                arrivals,
                expected: survivors,
            },
            Some(&arrival),
            None,
        );

        let satisfied = match sync.strategy {
            SyncStrategy::All => arrivals >= survivors,
            SyncStrategy::Any => true,
            SyncStrategy::MOfN => arrivals >= sync.m.unwrap_or(1),
        };
        if satisfied {
            self.fire_barrier(&key, t, def, tokens, ctx, sink)
        } else {
            Ok(Vec::new())
        }
    }

    /// Step B: merge in ascending branch index, complete the waiting
    /// arrivals, create the single continuation token.
    fn fire_barrier(
        &mut self,
        key: &BarrierKey,
        t: &FrozenTransition,
        def: &Definition,
        tokens: &mut TokenManager,
        ctx: &mut ContextStore,
        sink: &mut EventSink,
    ) -> Result<Vec<TokenId>, TaskFailure> {
        let sync = t.sync.as_ref().expect("sync transition");
        let barrier = self.barriers.get_mut(key).expect("barrier exists when firing");
        barrier.fired = true;
        let mut arrivals = barrier.arrivals.clone();
        arrivals.sort_by_key(|a| a.branch_index);

        if let Some(merge) = &sync.merge {
            apply_merge(merge, &arrivals, ctx, sink)?;
        }

        sink.emit(
            EventPayload::FanInFired {
                transition: t.transition_ref.to_string(),
                group: sync.group.to_string(),
                arrivals: arrivals.len(),
            },
            None,
            None,
        );
        // One snapshot per barrier firing.
        sink.force_snapshot(ctx);

        for arrival in &arrivals {
            tokens.transition(&arrival.token_id, TokenStatus::Completed)?;
            self.emit_status(
                &arrival.token_id,
                TokenStatus::WaitingAtFanIn,
                TokenStatus::Completed,
                tokens,
                sink,
            );
            ctx.drop_branch(&arrival.token_id);
        }

        let parent = &key.0;
        let to_ref = Arc::clone(&def.node(t.to).node_ref);
        let cont = tokens.create_continuation(parent, t.to, to_ref);
        ctx.fork_branch(parent, &cont);
        self.emit_created(&cont, tokens, sink);
        Ok(vec![cont])
    }

    // ── helpers ──────────────────────────────────────────────────────

    fn complete_token(
        &mut self,
        token_id: &TokenId,
        tokens: &mut TokenManager,
        ctx: &mut ContextStore,
        sink: &mut EventSink,
        drop_branch: bool,
    ) -> Result<(), TaskFailure> {
        tokens.transition(token_id, TokenStatus::Completed)?;
        self.emit_status(token_id, TokenStatus::Executing, TokenStatus::Completed, tokens, sink);
        if drop_branch {
            ctx.drop_branch(token_id);
        }
        Ok(())
    }

    fn emit_created(&self, token_id: &TokenId, tokens: &TokenManager, sink: &mut EventSink) {
        let Some(token) = tokens.get(token_id) else { return };
        let node_ref = Arc::clone(&token.node_ref);
        sink.emit(
            EventPayload::TokenCreated {
                parent: token.parent.as_ref().map(|p| p.to_string()),
                sibling_group: token.sibling_group.as_ref().map(|g| g.to_string()),
                branch_index: token.branch_index,
                branch_total: token.branch_total,
            },
            Some(token_id),
            Some(&node_ref),
        );
    }

    fn emit_status(
        &self,
        token_id: &TokenId,
        from: TokenStatus,
        to: TokenStatus,
        tokens: &TokenManager,
        sink: &mut EventSink,
    ) {
        let node_ref = tokens.get(token_id).map(|t| Arc::clone(&t.node_ref));
        sink.emit(
            EventPayload::TokenStatusChanged { from, to },
            Some(token_id),
            node_ref.as_ref(),
        );
    }
}

/// Combine arrival branch values into the merge target. Arrivals are
/// already sorted by ascending branch index; arrivals whose source path is
/// undefined contribute nothing.
fn apply_merge(
    merge: &FrozenMerge,
    arrivals: &[Arrival],
    ctx: &mut ContextStore,
    sink: &mut EventSink,
) -> Result<(), TaskFailure> {
    let sources: Vec<Value> = arrivals
        .iter()
        .filter_map(|a| {
            ctx.branch(&a.token_id)
                .and_then(|doc| jsonpath::read(doc, &merge.source))
        })
        .collect();

    let current = ctx
        .read(&merge.target, None)
        .map_err(|e| TaskFailure::mapping(e.to_string()))?;

    let type_error = |detail: String| TaskFailure::new(FailureKind::MergeType, detail);

    let merged: Option<Value> = match merge.strategy {
        MergeStrategy::Append => {
            let mut items = match current {
                Some(Value::Array(items)) => items,
                None => Vec::new(),
                Some(other) => {
                    return Err(type_error(format!(
                        "append target '{}' is not an array: {other}",
                        merge.target
                    )))
                }
            };
            items.extend(sources);
            Some(Value::Array(items))
        }
        MergeStrategy::Concat => {
            let mut items = match current {
                Some(Value::Array(items)) => items,
                None => Vec::new(),
                Some(other) => {
                    return Err(type_error(format!(
                        "concat target '{}' is not an array: {other}",
                        merge.target
                    )))
                }
            };
            for source in sources {
                match source {
                    Value::Array(mut chunk) => items.append(&mut chunk),
                    other => {
                        return Err(type_error(format!("concat source is not an array: {other}")))
                    }
                }
            }
            Some(Value::Array(items))
        }
        MergeStrategy::Last => sources.into_iter().next_back(),
        MergeStrategy::First => sources.into_iter().next(),
        MergeStrategy::Sum => {
            let mut total = match &current {
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                _ => 0.0,
            };
            let mut integral = current
                .as_ref()
                .map(|v| v.as_i64().is_some())
                .unwrap_or(true);
            for source in &sources {
                let Value::Number(n) = source else {
                    return Err(type_error(format!("sum source is not numeric: {source}")));
                };
                integral &= n.as_i64().is_some();
                total += n.as_f64().unwrap_or(0.0);
            }
            if integral {
                Some(Value::Number((total as i64).into()))
            } else {
                serde_json::Number::from_f64(total).map(Value::Number)
            }
        }
        MergeStrategy::Set => {
            let mut items = match current {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            for source in sources {
                if !items.contains(&source) {
                    items.push(source);
                }
            }
            Some(Value::Array(items))
        }
    };

    // last/first over zero defined sources write nothing, which is
    // permitted for empty barriers.
    if let Some(value) = merged {
        let record = ctx
            .write(&merge.target, value, None)
            .map_err(|e| TaskFailure::mapping(e.to_string()))?;
        sink.record_write(&record, ctx);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{EventDispatcher, SnapshotPolicy};
    use crate::loader::freeze;
    use serde_json::json;

    struct Fixture {
        def: Definition,
        tokens: TokenManager,
        ctx: ContextStore,
        sink: EventSink,
        router: Router,
    }

    fn fixture(yaml: &str) -> Fixture {
        let def = freeze(serde_yaml::from_str(yaml).unwrap()).unwrap();
        Fixture {
            def,
            tokens: TokenManager::new(Arc::from("run-1")),
            ctx: ContextStore::new(json!({})),
            sink: EventSink::new(
                Arc::from("run-1"),
                Arc::new(EventDispatcher::default()),
                true,
                SnapshotPolicy::default(),
            ),
            router: Router::new(),
        }
    }

    impl Fixture {
        /// Create a root token at a node and walk it to `executing`.
        fn executing_root(&mut self, node_ref: &str) -> TokenId {
            let ix = self.def.node_ix(node_ref).unwrap();
            let id = self
                .tokens
                .create_root(ix, Arc::clone(&self.def.node(ix).node_ref));
            self.tokens.transition(&id, TokenStatus::Dispatched).unwrap();
            self.tokens.transition(&id, TokenStatus::Executing).unwrap();
            id
        }

        fn advance(&mut self, id: &TokenId) {
            self.tokens.transition(id, TokenStatus::Dispatched).unwrap();
            self.tokens.transition(id, TokenStatus::Executing).unwrap();
        }

        fn route(&mut self, id: &TokenId) -> Vec<TokenId> {
            self.router
                .route_token(id, &self.def, &mut self.tokens, &mut self.ctx, &mut self.sink)
                .unwrap()
        }

        fn event_types(&self) -> Vec<&'static str> {
            self.sink.log().events().iter().map(|e| e.event_type()).collect()
        }
    }

    const FAN_YAML: &str = r#"
reference: fan
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

    #[test]
    fn plain_transition_creates_continuation() {
        let yaml = r#"
reference: plain
initialNodeRef: a
nodes:
  - ref: a
    task: { steps: [] }
  - ref: b
    task: { steps: [] }
transitions:
  - ref: t1
    fromNodeRef: a
    toNodeRef: b
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("a");
        let created = fx.route(&root);

        assert_eq!(created.len(), 1);
        let cont = fx.tokens.get(&created[0]).unwrap();
        assert_eq!(cont.node_ref.as_ref(), "b");
        assert_eq!(cont.parent.as_deref(), Some(root.as_ref()));
        assert_eq!(cont.branch_total, 1);
        assert!(cont.sibling_group.is_none());
        assert_eq!(fx.tokens.get(&root).unwrap().status, TokenStatus::Completed);
    }

    #[test]
    fn plain_continuation_inherits_branch_scope() {
        let yaml = r#"
reference: chain
initialNodeRef: init
nodes:
  - ref: init
    task: { steps: [] }
  - ref: worker
    task: { steps: [] }
  - ref: refine
    task: { steps: [] }
transitions:
  - ref: spread
    fromNodeRef: init
    toNodeRef: worker
    spawnCount: 1
  - ref: onward
    fromNodeRef: worker
    toNodeRef: refine
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        fx.advance(&children[0]);
        fx.ctx
            .write("$._branch.partial", json!("kept"), Some(children[0].as_ref()))
            .unwrap();

        let created = fx.route(&children[0]);
        assert_eq!(
            fx.ctx.read("$._branch.partial", Some(created[0].as_ref())).unwrap(),
            Some(json!("kept"))
        );
    }

    #[test]
    fn no_matching_transition_completes_token() {
        let yaml = r#"
reference: terminal
initialNodeRef: a
nodes:
  - ref: a
    task: { steps: [] }
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("a");
        let created = fx.route(&root);
        assert!(created.is_empty());
        assert!(fx.tokens.is_quiescent());
    }

    #[test]
    fn condition_routes_by_priority() {
        let yaml = r#"
reference: cond
initialNodeRef: a
nodes:
  - ref: a
    task: { steps: [] }
  - ref: fast
    task: { steps: [] }
  - ref: slow
    task: { steps: [] }
transitions:
  - ref: to-fast
    fromNodeRef: a
    toNodeRef: fast
    priority: 10
    condition: "$.state.mode == 'fast'"
  - ref: to-slow
    fromNodeRef: a
    toNodeRef: slow
    priority: 1
"#;
        let mut fx = fixture(yaml);
        fx.ctx.write("$.state.mode", json!("fast"), None).unwrap();
        let root = fx.executing_root("a");
        let created = fx.route(&root);
        assert_eq!(fx.tokens.get(&created[0]).unwrap().node_ref.as_ref(), "fast");

        // With the condition false, the lower-priority default matches.
        let mut fx = fixture(yaml);
        fx.ctx.write("$.state.mode", json!("slow"), None).unwrap();
        let root = fx.executing_root("a");
        let created = fx.route(&root);
        assert_eq!(fx.tokens.get(&created[0]).unwrap().node_ref.as_ref(), "slow");
    }

    #[test]
    fn fan_out_creates_siblings_in_order() {
        let mut fx = fixture(FAN_YAML);
        let root = fx.executing_root("init");
        let children = fx.route(&root);

        assert_eq!(children.len(), 3);
        for (i, child) in children.iter().enumerate() {
            let token = fx.tokens.get(child).unwrap();
            assert_eq!(token.branch_index, i);
            assert_eq!(token.branch_total, 3);
            assert_eq!(token.node_ref.as_ref(), "worker");
            assert_eq!(token.fan_out_transition.as_deref(), Some("spread"));
        }
    }

    #[test]
    fn foreach_binds_item_to_branch_scope() {
        let yaml = r#"
reference: foreach
initialNodeRef: init
nodes:
  - ref: init
    task: { steps: [] }
  - ref: worker
    task: { steps: [] }
transitions:
  - ref: per-item
    fromNodeRef: init
    toNodeRef: worker
    foreach:
      collection: "$.state.items"
      itemVar: item
"#;
        let mut fx = fixture(yaml);
        fx.ctx
            .write("$.state.items", json!(["a", "b"]), None)
            .unwrap();
        let root = fx.executing_root("init");
        let children = fx.route(&root);

        assert_eq!(children.len(), 2);
        assert_eq!(
            fx.ctx.read("$._branch.item", Some(children[0].as_ref())).unwrap(),
            Some(json!("a"))
        );
        assert_eq!(
            fx.ctx.read("$._branch.item", Some(children[1].as_ref())).unwrap(),
            Some(json!("b"))
        );
    }

    #[test]
    fn foreach_non_array_is_mapping_error() {
        let yaml = r#"
reference: foreach-bad
initialNodeRef: init
nodes:
  - ref: init
    task: { steps: [] }
  - ref: worker
    task: { steps: [] }
transitions:
  - ref: per-item
    fromNodeRef: init
    toNodeRef: worker
    foreach:
      collection: "$.state.items"
      itemVar: item
"#;
        let mut fx = fixture(yaml);
        fx.ctx.write("$.state.items", json!(42), None).unwrap();
        let root = fx.executing_root("init");
        let err = fx
            .router
            .route_token(&root, &fx.def, &mut fx.tokens, &mut fx.ctx, &mut fx.sink)
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Mapping);
    }

    #[test]
    fn all_barrier_waits_then_fires_in_branch_order() {
        let mut fx = fixture(FAN_YAML);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        for child in &children {
            fx.advance(child);
        }
        for (i, child) in children.iter().enumerate() {
            fx.ctx
                .write("$._branch.value", json!(format!("v{i}")), Some(child.as_ref()))
                .unwrap();
        }

        // Scrambled completion order; merge must still apply in ascending
        // branch index.
        assert!(fx.route(&children[1]).is_empty());
        assert_eq!(
            fx.tokens.get(&children[1]).unwrap().status,
            TokenStatus::Completed
        );
        assert_eq!(fx.tokens.query(TokenStatus::WaitingAtFanIn).count(), 1);
        assert!(fx.route(&children[2]).is_empty());

        let created = fx.route(&children[0]);
        assert_eq!(created.len(), 1);
        assert_eq!(fx.tokens.get(&created[0]).unwrap().node_ref.as_ref(), "done");
        // Continuation hangs off the siblings' common parent.
        assert_eq!(
            fx.tokens.get(&created[0]).unwrap().parent.as_deref(),
            Some(root.as_ref())
        );
        assert_eq!(
            fx.ctx.read("$.state.results", None).unwrap(),
            Some(json!(["v0", "v1", "v2"]))
        );
        // 1 root + 3 workers + 3 arrivals + 1 continuation.
        assert_eq!(fx.tokens.len(), 8);
        assert!(fx.tokens.iter().all(|t| t.status.is_terminal()
            || t.id == created[0]));
        assert!(fx.event_types().contains(&"fan_in.fired"));
    }

    #[test]
    fn any_barrier_fires_first_and_absorbs_late() {
        let yaml = r#"
reference: race
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
  - ref: first-wins
    fromNodeRef: worker
    toNodeRef: done
    synchronization:
      strategy: any
      siblingGroup: spread
      merge:
        source: "$._branch.value"
        target: "$.state.winner"
        strategy: last
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        for child in &children {
            fx.advance(child);
        }
        for (i, child) in children.iter().enumerate() {
            fx.ctx
                .write("$._branch.value", json!(format!("b{i}")), Some(child.as_ref()))
                .unwrap();
        }

        // Branch 1 completes first and wins.
        let created = fx.route(&children[1]);
        assert_eq!(created.len(), 1);
        assert_eq!(fx.ctx.read("$.state.winner", None).unwrap(), Some(json!("b1")));

        // Late arrivals absorb without re-firing.
        assert!(fx.route(&children[0]).is_empty());
        assert!(fx.route(&children[2]).is_empty());
        assert_eq!(fx.ctx.read("$.state.winner", None).unwrap(), Some(json!("b1")));
        let late = fx
            .event_types()
            .iter()
            .filter(|t| **t == "fan_in.late_arrival")
            .count();
        assert_eq!(late, 2);
        let fired = fx
            .event_types()
            .iter()
            .filter(|t| **t == "fan_in.fired")
            .count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn m_of_n_fires_at_threshold() {
        let yaml = r#"
reference: quorum
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
  - ref: quorum
    fromNodeRef: worker
    toNodeRef: done
    synchronization:
      strategy: m_of_n
      m: 2
      siblingGroup: spread
      merge:
        source: "$._branch.n"
        target: "$.state.total"
        strategy: sum
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        for child in &children {
            fx.advance(child);
        }
        for (i, child) in children.iter().enumerate() {
            fx.ctx
                .write("$._branch.n", json!(i + 1), Some(child.as_ref()))
                .unwrap();
        }

        assert!(fx.route(&children[2]).is_empty());
        let created = fx.route(&children[0]);
        assert_eq!(created.len(), 1);
        // Ascending branch order: branch 0 (1) + branch 2 (3).
        assert_eq!(fx.ctx.read("$.state.total", None).unwrap(), Some(json!(4)));
    }

    #[test]
    fn spawn_zero_fires_barrier_with_empty_arrivals() {
        let yaml = r#"
reference: empty-fan
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
    spawnCount: 0
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
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let created = fx.route(&root);

        // No workers: the continuation appears directly at the join.
        assert_eq!(created.len(), 1);
        assert_eq!(fx.tokens.get(&created[0]).unwrap().node_ref.as_ref(), "done");
        assert_eq!(fx.ctx.read("$.state.results", None).unwrap(), Some(json!([])));
    }

    #[test]
    fn failed_sibling_shrinks_all_barrier() {
        let mut fx = fixture(FAN_YAML);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        for child in &children {
            fx.advance(child);
        }
        for (i, child) in children.iter().enumerate() {
            fx.ctx
                .write("$._branch.value", json!(i), Some(child.as_ref()))
                .unwrap();
        }

        assert!(fx.route(&children[0]).is_empty());
        assert!(fx.route(&children[2]).is_empty());

        // Branch 1 fails; survivors (0 and 2) now satisfy `all`.
        fx.tokens.transition(&children[1], TokenStatus::Failed).unwrap();
        let failure = TaskFailure::new(FailureKind::ActionFatal, "boom");
        let created = fx
            .router
            .note_failure(&children[1], &failure, &fx.def, &mut fx.tokens, &mut fx.ctx, &mut fx.sink)
            .unwrap();

        assert_eq!(created.len(), 1);
        // The failed branch contributed nothing to the merge.
        assert_eq!(
            fx.ctx.read("$.state.results", None).unwrap(),
            Some(json!([0, 2]))
        );
    }

    #[test]
    fn m_of_n_unsatisfiable_fails_run() {
        let yaml = r#"
reference: quorum-fail
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
    spawnCount: 2
  - ref: quorum
    fromNodeRef: worker
    toNodeRef: done
    synchronization:
      strategy: m_of_n
      m: 2
      siblingGroup: spread
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        for child in &children {
            fx.advance(child);
        }

        fx.tokens.transition(&children[0], TokenStatus::Failed).unwrap();
        let failure = TaskFailure::new(FailureKind::ActionFatal, "boom");
        let err = fx
            .router
            .note_failure(&children[0], &failure, &fx.def, &mut fx.tokens, &mut fx.ctx, &mut fx.sink)
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ActionFatal);
        assert!(err.message.contains("unsatisfiable"));
    }

    #[test]
    fn failure_outside_any_group_fails_run() {
        let yaml = r#"
reference: solo
initialNodeRef: a
nodes:
  - ref: a
    task: { steps: [] }
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("a");
        fx.tokens.transition(&root, TokenStatus::Failed).unwrap();
        let failure = TaskFailure::new(FailureKind::ActionFatal, "boom");
        let err = fx
            .router
            .note_failure(&root, &failure, &fx.def, &mut fx.tokens, &mut fx.ctx, &mut fx.sink)
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::ActionFatal);
    }

    #[test]
    fn concat_merge_extends_arrays() {
        let yaml = r#"
reference: concat
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
    spawnCount: 2
  - ref: gather
    fromNodeRef: worker
    toNodeRef: done
    synchronization:
      strategy: all
      siblingGroup: spread
      merge:
        source: "$._branch.items"
        target: "$.state.all"
        strategy: concat
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        for child in &children {
            fx.advance(child);
        }
        fx.ctx
            .write("$._branch.items", json!([1, 2]), Some(children[0].as_ref()))
            .unwrap();
        fx.ctx
            .write("$._branch.items", json!([3]), Some(children[1].as_ref()))
            .unwrap();

        fx.route(&children[0]);
        fx.route(&children[1]);
        assert_eq!(
            fx.ctx.read("$.state.all", None).unwrap(),
            Some(json!([1, 2, 3]))
        );
    }

    #[test]
    fn sum_over_non_numeric_is_merge_type_error() {
        let yaml = r#"
reference: badsum
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
    spawnCount: 1
  - ref: gather
    fromNodeRef: worker
    toNodeRef: done
    synchronization:
      strategy: all
      siblingGroup: spread
      merge:
        source: "$._branch.v"
        target: "$.state.total"
        strategy: sum
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        fx.advance(&children[0]);
        fx.ctx
            .write("$._branch.v", json!("not a number"), Some(children[0].as_ref()))
            .unwrap();
        let err = fx
            .router
            .route_token(&children[0], &fx.def, &mut fx.tokens, &mut fx.ctx, &mut fx.sink)
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::MergeType);
    }

    #[test]
    fn set_merge_dedupes_first_seen() {
        let yaml = r#"
reference: uniq
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
        source: "$._branch.tag"
        target: "$.state.tags"
        strategy: set
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        for child in &children {
            fx.advance(child);
        }
        for (tag, child) in ["x", "y", "x"].iter().zip(&children) {
            fx.ctx
                .write("$._branch.tag", json!(tag), Some(child.as_ref()))
                .unwrap();
        }
        for child in &children {
            fx.route(child);
        }
        assert_eq!(
            fx.ctx.read("$.state.tags", None).unwrap(),
            Some(json!(["x", "y"]))
        );
    }

    #[test]
    fn spawn_one_behaves_like_plain_but_keeps_barrier() {
        let yaml = r#"
reference: single
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
    spawnCount: 1
  - ref: gather
    fromNodeRef: worker
    toNodeRef: done
    synchronization:
      strategy: all
      siblingGroup: spread
      merge:
        source: "$._branch.v"
        target: "$.state.results"
        strategy: append
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let children = fx.route(&root);
        assert_eq!(children.len(), 1);
        assert_eq!(fx.tokens.get(&children[0]).unwrap().branch_total, 1);

        fx.advance(&children[0]);
        fx.ctx
            .write("$._branch.v", json!("only"), Some(children[0].as_ref()))
            .unwrap();
        let created = fx.route(&children[0]);
        assert_eq!(created.len(), 1);
        assert_eq!(
            fx.ctx.read("$.state.results", None).unwrap(),
            Some(json!(["only"]))
        );
    }

    #[test]
    fn nested_fan_in_matches_innermost_group() {
        let yaml = r#"
reference: nested
initialNodeRef: init
nodes:
  - ref: init
    task: { steps: [] }
  - ref: mid
    task: { steps: [] }
  - ref: leaf
    task: { steps: [] }
  - ref: inner-done
    task: { steps: [] }
transitions:
  - ref: outer
    fromNodeRef: init
    toNodeRef: mid
    spawnCount: 2
  - ref: inner
    fromNodeRef: mid
    toNodeRef: leaf
    spawnCount: 2
  - ref: join-inner
    fromNodeRef: leaf
    toNodeRef: inner-done
    synchronization:
      strategy: all
      siblingGroup: inner
      merge:
        source: "$._branch.v"
        target: "$.state.inner_results"
        strategy: append
"#;
        let mut fx = fixture(yaml);
        let root = fx.executing_root("init");
        let mids = fx.route(&root);
        assert_eq!(mids.len(), 2);

        // Only the first mid branch fans out to leaves here.
        fx.advance(&mids[0]);
        let leaves = fx.route(&mids[0]);
        assert_eq!(leaves.len(), 2);

        for leaf in &leaves {
            fx.advance(leaf);
            fx.ctx
                .write("$._branch.v", json!("leaf"), Some(leaf.as_ref()))
                .unwrap();
        }

        // Inner join only needs the two leaves of THIS mid branch, not the
        // sibling mid branch.
        assert!(fx.route(&leaves[0]).is_empty());
        let created = fx.route(&leaves[1]);
        assert_eq!(created.len(), 1);
        assert_eq!(
            fx.tokens.get(&created[0]).unwrap().node_ref.as_ref(),
            "inner-done"
        );
        assert_eq!(
            fx.ctx.read("$.state.inner_results", None).unwrap(),
            Some(json!(["leaf", "leaf"]))
        );
    }
}
