//! Coordinator error taxonomy.
//!
//! Two layers:
//! - `FailureKind` + `TaskFailure`: runtime failures that travel with tokens
//!   and surface in `workflow.failed` / `node.failed` event payloads.
//! - `CoordinatorError`: top-level error wrapping module-specific errors
//!   (loader, context, resource service) for the control surface and CLI.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification carried by failed tokens and runs.
///
/// Serialized names match the wire payloads consumed by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Task input/output did not conform to its declared schema.
    #[serde(rename = "ValidationError")]
    Validation,
    /// Invalid JSONPath or a write into a read-only namespace.
    #[serde(rename = "MappingError")]
    Mapping,
    /// Action failed transiently and retries were exhausted.
    #[serde(rename = "ActionTransientError")]
    ActionTransient,
    /// Action failed fatally.
    #[serde(rename = "ActionFatalError")]
    ActionFatal,
    /// A step condition resolved to the `fail` directive.
    #[serde(rename = "ConditionFailed")]
    ConditionFailed,
    /// A synchronization merge hit an incompatible value shape.
    #[serde(rename = "MergeTypeError")]
    MergeType,
    /// Task or action deadline exceeded.
    #[serde(rename = "TimedOut")]
    TimedOut,
    /// The run was cancelled externally.
    #[serde(rename = "Cancelled")]
    Cancelled,
    /// A component observed impossible state. Always fatal for the run.
    #[serde(rename = "InternalInvariantError")]
    InternalInvariant,
}

impl FailureKind {
    /// Transient failures are retryable at the step level; everything else
    /// is subject to `onFailure` or fails outright.
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::ActionTransient)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Validation => "ValidationError",
            FailureKind::Mapping => "MappingError",
            FailureKind::ActionTransient => "ActionTransientError",
            FailureKind::ActionFatal => "ActionFatalError",
            FailureKind::ConditionFailed => "ConditionFailed",
            FailureKind::MergeType => "MergeTypeError",
            FailureKind::TimedOut => "TimedOut",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::InternalInvariant => "InternalInvariantError",
        };
        f.write_str(name)
    }
}

/// A classified runtime failure with a human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Mapping, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TimedOut, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "run cancelled")
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InternalInvariant, message)
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskFailure {}

/// Top-level error for the coordinator control surface.
///
/// Wraps the module-specific error types so callers get one `Result`
/// signature out of `Coordinator` and the CLI.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Definition failed to load, resolve, or validate.
    #[error("{0}")]
    Loader(#[from] crate::loader::LoaderError),

    /// Context store rejected a read or write.
    #[error("{0}")]
    Context(#[from] crate::context::ContextError),

    /// Condition expression failed to parse.
    #[error("{0}")]
    Condition(#[from] crate::condition::ConditionError),

    /// Resource service call failed.
    #[error("{0}")]
    Resource(#[from] crate::resource::ResourceError),

    /// Referenced run does not exist.
    #[error("unknown run: {0}")]
    UnknownRun(String),

    /// Run input did not conform to the workflow's input schema.
    #[error("input rejected: {0}")]
    InvalidInput(String),

    /// Coordinator bug: impossible state observed.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}
