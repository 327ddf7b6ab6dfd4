//! Event dispatch: subscriber registry and the per-run event sink.
//!
//! Subscribers attach to a stream (`events` or `trace`) with optional
//! filters. Delivery is best-effort over bounded channels: a subscriber
//! that falls behind its channel capacity is disconnected rather than
//! blocking the run actor. Missed events can be recovered from the event
//! log by sequence range.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::context::{ContextStore, Namespace, WriteRecord};
use crate::events::{Event, EventLog, EventPayload, Stream};

/// Default per-subscriber channel capacity before disconnection.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Subscriber-side filters. All present filters must match.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub run_id: Option<String>,
    /// Single or multiple event types (`workflow.completed`, …).
    pub event_types: Option<Vec<String>>,
    /// Top-level payload-field equality; `runId`, `tokenId`, and `nodeRef`
    /// match the envelope.
    pub payload_eq: BTreeMap<String, Value>,
}

impl SubscriptionFilter {
    pub fn for_run(run_id: impl Into<String>) -> Self {
        Self { run_id: Some(run_id.into()), ..Default::default() }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(run_id) = &self.run_id {
            if event.run_id.as_ref() != run_id {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if !self.payload_eq.is_empty() {
            let payload = serde_json::to_value(&event.payload)
                .ok()
                .and_then(|v| v.get("payload").cloned())
                .unwrap_or(Value::Null);
            for (key, expected) in &self.payload_eq {
                let actual = match key.as_str() {
                    "runId" => Some(Value::String(event.run_id.to_string())),
                    "tokenId" => event.token_id.as_ref().map(|t| Value::String(t.to_string())),
                    "nodeRef" => event.node_ref.as_ref().map(|n| Value::String(n.to_string())),
                    field => payload.get(field).cloned(),
                };
                if actual.as_ref() != Some(expected) {
                    return false;
                }
            }
        }
        true
    }
}

struct Subscriber {
    stream: Stream,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Event>,
}

/// A live subscription handle. Dropping the receiver closes it server-side
/// on the next publish.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Consume the subscription as a stream, for SDK-style consumers.
    pub fn into_stream(self) -> tokio_stream::wrappers::ReceiverStream<Event> {
        tokio_stream::wrappers::ReceiverStream::new(self.rx)
    }
}

/// Fans events out to subscribers across all runs.
pub struct EventDispatcher {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        Self { subscribers: DashMap::new(), next_id: AtomicU64::new(1), capacity }
    }

    pub fn subscribe(&self, stream: Stream, filter: SubscriptionFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.insert(id, Subscriber { stream, filter, tx });
        debug!(subscription = id, %stream, "subscriber attached");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver to every matching subscriber. Slow or closed subscribers are
    /// disconnected; the actor never blocks here.
    pub fn publish(&self, event: &Event) {
        let stream = event.stream();
        let mut evict = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if subscriber.stream != stream || !subscriber.filter.matches(event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscription = *entry.key(), "subscriber fell behind, disconnecting");
                    evict.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evict.push(*entry.key());
                }
            }
        }

        for id in evict {
            self.subscribers.remove(&id);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// Snapshot cadence: unconditional snapshots are forced at initialization,
/// barrier firings, and completion; in between, at most one per
/// `every_n_writes` writes or per `min_interval`.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    pub every_n_writes: usize,
    pub min_interval: Duration,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self { every_n_writes: 16, min_interval: Duration::from_millis(250) }
    }
}

/// Per-run event sink owned by the actor: assigns sequences, appends to the
/// log, publishes to subscribers, and buffers for resource-service flushes.
pub struct EventSink {
    run_id: Arc<str>,
    sequence: u64,
    started: Instant,
    trace_enabled: bool,
    log: EventLog,
    dispatcher: Arc<EventDispatcher>,
    pending: Vec<Event>,
    snapshot_policy: SnapshotPolicy,
    writes_since_snapshot: usize,
    last_snapshot: Option<Instant>,
}

impl EventSink {
    pub fn new(
        run_id: Arc<str>,
        dispatcher: Arc<EventDispatcher>,
        trace_enabled: bool,
        snapshot_policy: SnapshotPolicy,
    ) -> Self {
        Self {
            run_id,
            sequence: 0,
            started: Instant::now(),
            trace_enabled,
            log: EventLog::new(),
            dispatcher,
            pending: Vec::new(),
            snapshot_policy,
            writes_since_snapshot: 0,
            last_snapshot: None,
        }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    /// Emit one event: sequence assignment, log append, subscriber publish.
    /// Trace events are dropped entirely when tracing is disabled.
    pub fn emit(
        &mut self,
        payload: EventPayload,
        token_id: Option<&Arc<str>>,
        node_ref: Option<&Arc<str>>,
    ) -> Option<u64> {
        if payload.stream() == Stream::Trace && !self.trace_enabled {
            return None;
        }
        self.sequence += 1;
        let event = Event {
            sequence: self.sequence,
            timestamp_ms: self.started.elapsed().as_millis() as u64,
            run_id: Arc::clone(&self.run_id),
            token_id: token_id.map(Arc::clone),
            node_ref: node_ref.map(Arc::clone),
            payload,
        };
        self.log.append(event.clone());
        self.dispatcher.publish(&event);
        self.pending.push(event);
        Some(self.sequence)
    }

    /// Buffered events since the last flush, for `appendEvents`.
    pub fn take_pending(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending)
    }

    /// Emit `context.field_set` for a `state`/`output` write and apply the
    /// snapshot cadence. Branch-scope writes are ephemeral and never logged.
    pub fn record_write(&mut self, record: &WriteRecord, ctx: &ContextStore) {
        let namespace = match record.namespace {
            Namespace::State => "state",
            Namespace::Output => "output",
            Namespace::Input | Namespace::Branch => return,
        };
        self.emit(
            EventPayload::ContextFieldSet {
                namespace: namespace.to_string(),
                path: record.path.clone(),
                value: record.value.clone(),
            },
            None,
            None,
        );
        self.maybe_snapshot(ctx);
    }

    /// Rate-limited snapshot after a `state`/`output` write.
    pub fn maybe_snapshot(&mut self, ctx: &ContextStore) {
        self.writes_since_snapshot += 1;
        let due_by_count = self.writes_since_snapshot >= self.snapshot_policy.every_n_writes;
        let due_by_time = self
            .last_snapshot
            .map(|at| at.elapsed() >= self.snapshot_policy.min_interval)
            .unwrap_or(true);
        if due_by_count || due_by_time {
            self.force_snapshot(ctx);
        }
    }

    /// Unconditional snapshot (initialization, barrier firing, completion).
    pub fn force_snapshot(&mut self, ctx: &ContextStore) {
        self.writes_since_snapshot = 0;
        self.last_snapshot = Some(Instant::now());
        self.emit(
            EventPayload::SnapshotTaken { context: ctx.snapshot() },
            None,
            None,
        );
    }
}
