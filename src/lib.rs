//! # Wonder Workflow Coordinator
//!
//! Token-based execution of declarative workflow graphs: fan-out, fan-in
//! synchronization with deterministic merges, a JSONPath context store, and
//! a causally-ordered event log streamed to subscribers.
//!
//! ## Overview
//!
//! A workflow definition is a directed graph of nodes (each executing a
//! task of ordered action steps) connected by transitions that may be
//! conditional, fan out into sibling branches, or fan in at barriers. Each
//! run is owned by a **run actor**: a logically single-threaded task that
//! serializes every mutation of the run's tokens, context, and barrier
//! state. Task execution happens on a bounded worker pool; results re-enter
//! the actor through its inbox.
//!
//! ## Architecture
//!
//! | Component | Module | Responsibility |
//! |-----------|--------|----------------|
//! | Definition loader | [`loader`] | Resolve + validate + freeze graphs |
//! | Context store | [`context`], [`jsonpath`] | `input`/`state`/`output`/`_branch` reads and writes |
//! | Token manager | [`token`] | Lifecycle, lineage, sibling groups |
//! | Step/task executor | [`executor`], [`action`] | Steps, retries, deadlines |
//! | Router & synchronizer | [`router`], [`condition`] | Transitions, fan-out, barriers, merges |
//! | Event log & dispatcher | [`events`], [`dispatch`] | Sequencing, streaming, replay |
//! | Run actor | [`actor`], [`coordinator`] | Per-run ownership and control surface |
//! | Resource service | [`resource`] | Definitions, runs, persistence boundary |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wonder::{Coordinator, CoordinatorConfig, MockActionExecutor, StartOptions};
//! use wonder::resource::InMemoryResourceService;
//!
//! let resource = Arc::new(InMemoryResourceService::new());
//! resource.register(my_workflow_document);
//!
//! let coordinator = Coordinator::new(
//!     resource,
//!     Arc::new(MockActionExecutor::new(42)),
//!     CoordinatorConfig::default(),
//! );
//! let run_id = coordinator
//!     .start_run("my-workflow", None, serde_json::json!({}), StartOptions::default())
//!     .await?;
//! let view = coordinator.wait(&run_id).await.unwrap();
//! # Ok::<(), wonder::CoordinatorError>(())
//! ```
//!
//! ## Guarantees
//!
//! - Event sequences are contiguous from 1 per run; replaying them in
//!   sequence order rebuilds `(context, activeTokens)`.
//! - Fan-in merges apply in ascending branch index regardless of
//!   completion order.
//! - With the seeded mock action executor and a fixed definition, the
//!   final context snapshot is bit-identical across runs.

pub mod action;
pub mod actor;
pub mod builders;
pub mod condition;
pub mod context;
pub mod coordinator;
pub mod definition;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod jsonpath;
pub mod loader;
pub mod resource;
pub mod router;
pub mod token;

pub use action::{ActionExecutor, ActionOutcome, MockActionExecutor};
pub use actor::{RunHandle, RunView, StartOptions};
pub use condition::Condition;
pub use context::ContextStore;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use definition::{DefinitionDocument, DefinitionKind, WorkflowDef};
pub use dispatch::{EventDispatcher, SnapshotPolicy, Subscription, SubscriptionFilter};
pub use error::{CoordinatorError, FailureKind, TaskFailure};
pub use events::{replay, Event, EventLog, EventPayload, Stream};
pub use executor::TaskExecutor;
pub use loader::{Definition, DefinitionLoader, LoaderError};
pub use resource::{
    FsResourceService, InMemoryResourceService, ResourceService, RunRecord, RunStatus,
};
pub use token::{Token, TokenManager, TokenStatus};
