//! Run events: envelope, payloads, append-only log, replay.
//!
//! Two streams per run: semantic events (`workflow.*`, `node.*`) for
//! clients, trace events for tests and observability. Every event carries a
//! run-local `sequence` assigned by the run actor before release; sequences
//! are contiguous from 1 and define causal truth regardless of delivery
//! order. A run is reconstructible from `{definition, input, events}`:
//! [`replay`] rebuilds `(context, tokens)` from the log.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailureKind;
use crate::token::TokenStatus;

/// Which stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Events,
    Trace,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Events => f.write_str("events"),
            Stream::Trace => f.write_str("trace"),
        }
    }
}

/// Event envelope. `timestamp_ms` is measured from run start so replays and
/// fixed-seed runs stay comparable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub run_id: Arc<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<Arc<str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<Arc<str>>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn stream(&self) -> Stream {
        self.payload.stream()
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Tagged event payloads for both streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventPayload {
    // ── semantic stream ──────────────────────────────────────────────
    #[serde(rename = "workflow.started")]
    WorkflowStarted { reference: String, version: u32 },
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted { output: Value },
    #[serde(rename = "workflow.failed")]
    WorkflowFailed {
        kind: FailureKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_ref: Option<String>,
    },
    #[serde(rename = "node.started")]
    NodeStarted {},
    #[serde(rename = "node.completed")]
    NodeCompleted { output: Value },
    #[serde(rename = "node.failed")]
    NodeFailed { kind: FailureKind, message: String },

    // ── trace stream ─────────────────────────────────────────────────
    #[serde(rename = "token.created")]
    TokenCreated {
        #[serde(skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sibling_group: Option<String>,
        branch_index: usize,
        branch_total: usize,
    },
    #[serde(rename = "token.status_changed")]
    TokenStatusChanged { from: TokenStatus, to: TokenStatus },
    #[serde(rename = "context.initialized")]
    ContextInitialized { input: Value },
    #[serde(rename = "context.field_set")]
    ContextFieldSet { namespace: String, path: String, value: Value },
    #[serde(rename = "routing.started")]
    RoutingStarted {},
    #[serde(rename = "routing.completed")]
    RoutingCompleted { continuations: usize },
    #[serde(rename = "fan_in.arrival")]
    FanInArrival { transition: String, group: String, arrivals: usize, expected: usize },
    #[serde(rename = "fan_in.fired")]
    FanInFired { transition: String, group: String, arrivals: usize },
    #[serde(rename = "fan_in.late_arrival")]
    FanInLateArrival { transition: String, group: String },
    #[serde(rename = "snapshot.taken")]
    SnapshotTaken { context: Value },
    #[serde(rename = "late_result")]
    LateResult {},
}

impl EventPayload {
    pub fn stream(&self) -> Stream {
        match self {
            EventPayload::WorkflowStarted { .. }
            | EventPayload::WorkflowCompleted { .. }
            | EventPayload::WorkflowFailed { .. }
            | EventPayload::NodeStarted {}
            | EventPayload::NodeCompleted { .. }
            | EventPayload::NodeFailed { .. } => Stream::Events,
            _ => Stream::Trace,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::WorkflowStarted { .. } => "workflow.started",
            EventPayload::WorkflowCompleted { .. } => "workflow.completed",
            EventPayload::WorkflowFailed { .. } => "workflow.failed",
            EventPayload::NodeStarted {} => "node.started",
            EventPayload::NodeCompleted { .. } => "node.completed",
            EventPayload::NodeFailed { .. } => "node.failed",
            EventPayload::TokenCreated { .. } => "token.created",
            EventPayload::TokenStatusChanged { .. } => "token.status_changed",
            EventPayload::ContextInitialized { .. } => "context.initialized",
            EventPayload::ContextFieldSet { .. } => "context.field_set",
            EventPayload::RoutingStarted {} => "routing.started",
            EventPayload::RoutingCompleted { .. } => "routing.completed",
            EventPayload::FanInArrival { .. } => "fan_in.arrival",
            EventPayload::FanInFired { .. } => "fan_in.fired",
            EventPayload::FanInLateArrival { .. } => "fan_in.late_arrival",
            EventPayload::SnapshotTaken { .. } => "snapshot.taken",
            EventPayload::LateResult {} => "late_result",
        }
    }
}

/// Thread-safe, append-only event log for one run.
///
/// The actor is the only writer; subscribers and recovery read concurrently.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event: Event) {
        self.events.write().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Events with `from_seq <= sequence <= to_seq`, for subscriber
    /// catch-up after a disconnect.
    pub fn range(&self, from_seq: u64, to_seq: u64) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.sequence >= from_seq && e.sequence <= to_seq)
            .cloned()
            .collect()
    }

    pub fn last_sequence(&self) -> u64 {
        self.events.read().last().map(|e| e.sequence).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}

// ── replay ───────────────────────────────────────────────────────────

/// A token as rebuilt from the trace stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedToken {
    pub node_ref: String,
    pub status: TokenStatus,
    pub parent: Option<String>,
    pub sibling_group: Option<String>,
    pub branch_index: usize,
    pub branch_total: usize,
}

/// Context and token state rebuilt by applying events in sequence order.
#[derive(Debug, Clone, Default)]
pub struct ReplayedRun {
    pub input: Value,
    pub state: Value,
    pub output: Value,
    pub tokens: HashMap<String, ReplayedToken>,
    pub completed: bool,
    pub failed: Option<FailureKind>,
}

impl ReplayedRun {
    /// `{input, state, output}` view matching `ContextStore::snapshot`.
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "input": self.input.clone(),
            "state": self.state.clone(),
            "output": self.output.clone(),
        })
    }
}

/// Rebuild run state from an event slice. Events must be provided in
/// sequence order; the function is total (unknown payloads are ignored) so
/// it can replay partial logs after a crash.
pub fn replay(events: &[Event]) -> ReplayedRun {
    let mut run = ReplayedRun {
        input: Value::Null,
        state: Value::Object(serde_json::Map::new()),
        output: Value::Object(serde_json::Map::new()),
        ..Default::default()
    };

    for event in events {
        match &event.payload {
            EventPayload::ContextInitialized { input } => {
                run.input = input.clone();
            }
            EventPayload::ContextFieldSet { namespace, path, value } => {
                let doc = match namespace.as_str() {
                    "state" => &mut run.state,
                    "output" => &mut run.output,
                    _ => continue,
                };
                if let Ok(segments) = crate::jsonpath::parse_writable(path) {
                    let _ = crate::jsonpath::write(doc, &segments, value.clone());
                }
            }
            EventPayload::TokenCreated { parent, sibling_group, branch_index, branch_total } => {
                let Some(id) = event.token_id.as_deref() else { continue };
                run.tokens.insert(
                    id.to_string(),
                    ReplayedToken {
                        node_ref: event.node_ref.as_deref().unwrap_or_default().to_string(),
                        status: TokenStatus::Pending,
                        parent: parent.clone(),
                        sibling_group: sibling_group.clone(),
                        branch_index: *branch_index,
                        branch_total: *branch_total,
                    },
                );
            }
            EventPayload::TokenStatusChanged { to, .. } => {
                if let Some(id) = event.token_id.as_deref() {
                    if let Some(token) = run.tokens.get_mut(id) {
                        token.status = *to;
                    }
                }
            }
            EventPayload::WorkflowCompleted { .. } => {
                run.completed = true;
            }
            EventPayload::WorkflowFailed { kind, .. } => {
                run.failed = Some(*kind);
            }
            _ => {}
        }
    }

    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(sequence: u64, payload: EventPayload) -> Event {
        Event {
            sequence,
            timestamp_ms: sequence,
            run_id: Arc::from("run-1"),
            token_id: None,
            node_ref: None,
            payload,
        }
    }

    #[test]
    fn payload_streams() {
        assert_eq!(
            EventPayload::WorkflowStarted { reference: "w".into(), version: 1 }.stream(),
            Stream::Events
        );
        assert_eq!(EventPayload::NodeStarted {}.stream(), Stream::Events);
        assert_eq!(
            EventPayload::TokenStatusChanged {
                from: TokenStatus::Pending,
                to: TokenStatus::Dispatched
            }
            .stream(),
            Stream::Trace
        );
        assert_eq!(EventPayload::LateResult {}.stream(), Stream::Trace);
    }

    #[test]
    fn event_serializes_with_dotted_type() {
        let e = event(
            1,
            EventPayload::WorkflowStarted { reference: "demo".into(), version: 2 },
        );
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["type"], "workflow.started");
        assert_eq!(value["payload"]["reference"], "demo");
        assert_eq!(value["sequence"], 1);
        // None fields are omitted from the wire shape.
        assert!(value.get("token_id").is_none());
    }

    #[test]
    fn event_roundtrips() {
        let e = event(
            7,
            EventPayload::ContextFieldSet {
                namespace: "state".into(),
                path: "seed".into(),
                value: json!("ALPHA"),
            },
        );
        let value = serde_json::to_value(&e).unwrap();
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back.sequence, 7);
        assert_eq!(back.payload, e.payload);
    }

    #[test]
    fn failure_kind_in_payload_uses_wire_name() {
        let e = event(
            3,
            EventPayload::WorkflowFailed {
                kind: FailureKind::Cancelled,
                message: "cancelled".into(),
                token_id: None,
                node_ref: None,
            },
        );
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["payload"]["kind"], "Cancelled");
    }

    #[test]
    fn log_appends_and_ranges() {
        let log = EventLog::new();
        for seq in 1..=5 {
            log.append(event(seq, EventPayload::RoutingStarted {}));
        }
        assert_eq!(log.len(), 5);
        assert_eq!(log.last_sequence(), 5);

        let slice = log.range(2, 4);
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0].sequence, 2);
        assert_eq!(slice[2].sequence, 4);
    }

    #[test]
    fn log_clone_shares_storage() {
        let log = EventLog::new();
        let clone = log.clone();
        log.append(event(1, EventPayload::RoutingStarted {}));
        assert_eq!(clone.len(), 1);
    }

    #[test]
    fn replay_rebuilds_context() {
        let mut events = vec![event(
            1,
            EventPayload::ContextInitialized { input: json!({"city": "Paris"}) },
        )];
        events.push(event(
            2,
            EventPayload::ContextFieldSet {
                namespace: "state".into(),
                path: "phase1.results".into(),
                value: json!(["a", "b"]),
            },
        ));
        events.push(event(
            3,
            EventPayload::ContextFieldSet {
                namespace: "output".into(),
                path: "code".into(),
                value: json!("XYZ"),
            },
        ));
        events.push(event(4, EventPayload::WorkflowCompleted { output: json!({}) }));

        let run = replay(&events);
        assert!(run.completed);
        assert_eq!(run.input["city"], "Paris");
        assert_eq!(run.state["phase1"]["results"], json!(["a", "b"]));
        assert_eq!(run.output["code"], "XYZ");
    }

    #[test]
    fn replay_tracks_tokens() {
        let mut e1 = event(
            1,
            EventPayload::TokenCreated {
                parent: None,
                sibling_group: None,
                branch_index: 0,
                branch_total: 1,
            },
        );
        e1.token_id = Some(Arc::from("tok-1"));
        e1.node_ref = Some(Arc::from("generate"));

        let mut e2 = event(
            2,
            EventPayload::TokenStatusChanged {
                from: TokenStatus::Pending,
                to: TokenStatus::Dispatched,
            },
        );
        e2.token_id = Some(Arc::from("tok-1"));

        let run = replay(&[e1, e2]);
        let token = run.tokens.get("tok-1").unwrap();
        assert_eq!(token.node_ref, "generate");
        assert_eq!(token.status, TokenStatus::Dispatched);
    }
}
