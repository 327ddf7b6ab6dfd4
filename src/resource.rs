//! Resource service boundary.
//!
//! The coordinator consumes definitions, persists run records, snapshots,
//! and events through this trait; the real datastore lives in another
//! service. Two implementations ship here: an in-memory one (tests, and the
//! persistence side of the CLI) and a filesystem-backed one that resolves
//! definition documents from a directory of YAML/JSON files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::definition::{DefinitionDocument, DefinitionKind};
use crate::events::{Event, Stream};
use crate::token::Token;

#[derive(Error, Debug, Clone)]
pub enum ResourceError {
    #[error("{kind} '{reference}'{} not found", version.map(|v| format!(" v{v}")).unwrap_or_default())]
    NotFound { kind: DefinitionKind, reference: String, version: Option<u32> },

    #[error("failed to read '{path}': {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse '{path}': {reason}")]
    Parse { path: String, reason: String },

    #[error("unknown run '{0}'")]
    UnknownRun(String),
}

/// Run lifecycle as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Persisted run record. The context itself is reconstructible from the
/// event log; snapshots are derived views.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub reference: String,
    pub version: u32,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<String>,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

/// External persistence consumed by the coordinator.
#[async_trait]
pub trait ResourceService: Send + Sync {
    /// Resolve a definition; `version: None` means latest.
    async fn resolve_definition(
        &self,
        kind: DefinitionKind,
        reference: &str,
        version: Option<u32>,
    ) -> Result<DefinitionDocument, ResourceError>;

    async fn create_run(&self, record: &RunRecord) -> Result<(), ResourceError>;

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        completed_at_ms: Option<u64>,
    ) -> Result<(), ResourceError>;

    async fn persist_snapshot(
        &self,
        run_id: &str,
        context: &Value,
        active_tokens: &[Token],
    ) -> Result<(), ResourceError>;

    async fn append_events(
        &self,
        run_id: &str,
        stream: Stream,
        events: &[Event],
    ) -> Result<(), ResourceError>;
}

/// Latest-persisted snapshot of a run.
#[derive(Debug, Clone)]
pub struct PersistedSnapshot {
    pub context: Value,
    pub active_tokens: Vec<Token>,
}

/// In-memory resource service: definition registry plus run/event storage.
#[derive(Default)]
pub struct InMemoryResourceService {
    definitions: DashMap<(DefinitionKind, String), BTreeMap<u32, DefinitionDocument>>,
    runs: DashMap<String, RunRecord>,
    events: DashMap<String, Vec<Event>>,
    snapshots: DashMap<String, PersistedSnapshot>,
}

impl InMemoryResourceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition document, keyed by `(kind, reference, version)`.
    pub fn register(&self, doc: DefinitionDocument) {
        let key = (doc.kind(), doc.reference().to_string());
        self.definitions
            .entry(key)
            .or_default()
            .insert(doc.version(), doc);
    }

    /// Stored events for a run, in append order.
    pub fn events_for(&self, run_id: &str) -> Vec<Event> {
        self.events.get(run_id).map(|e| e.clone()).unwrap_or_default()
    }

    pub fn run(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.get(run_id).map(|r| r.clone())
    }

    pub fn snapshot_for(&self, run_id: &str) -> Option<PersistedSnapshot> {
        self.snapshots.get(run_id).map(|s| s.clone())
    }
}

#[async_trait]
impl ResourceService for InMemoryResourceService {
    async fn resolve_definition(
        &self,
        kind: DefinitionKind,
        reference: &str,
        version: Option<u32>,
    ) -> Result<DefinitionDocument, ResourceError> {
        let not_found = || ResourceError::NotFound {
            kind,
            reference: reference.to_string(),
            version,
        };
        let versions = self
            .definitions
            .get(&(kind, reference.to_string()))
            .ok_or_else(not_found)?;
        let doc = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };
        doc.cloned().ok_or_else(not_found)
    }

    async fn create_run(&self, record: &RunRecord) -> Result<(), ResourceError> {
        self.runs.insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        completed_at_ms: Option<u64>,
    ) -> Result<(), ResourceError> {
        let mut record = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| ResourceError::UnknownRun(run_id.to_string()))?;
        record.status = status;
        if completed_at_ms.is_some() {
            record.completed_at_ms = completed_at_ms;
        }
        Ok(())
    }

    async fn persist_snapshot(
        &self,
        run_id: &str,
        context: &Value,
        active_tokens: &[Token],
    ) -> Result<(), ResourceError> {
        self.snapshots.insert(
            run_id.to_string(),
            PersistedSnapshot {
                context: context.clone(),
                active_tokens: active_tokens.to_vec(),
            },
        );
        Ok(())
    }

    async fn append_events(
        &self,
        run_id: &str,
        _stream: Stream,
        events: &[Event],
    ) -> Result<(), ResourceError> {
        self.events
            .entry(run_id.to_string())
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }
}

/// Filesystem-backed definition resolution: scans a directory for
/// `.yaml`/`.yml`/`.json` documents with a top-level `kind` tag. Runs,
/// snapshots, and events delegate to an in-memory store.
pub struct FsResourceService {
    root: PathBuf,
    inner: InMemoryResourceService,
}

impl FsResourceService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), inner: InMemoryResourceService::new() }
    }

    pub fn inner(&self) -> &InMemoryResourceService {
        &self.inner
    }

    fn parse_document(path: &Path) -> Result<DefinitionDocument, ResourceError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| ResourceError::Io {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        let is_json = path.extension().map(|e| e == "json").unwrap_or(false);
        if is_json {
            serde_json::from_str(&text).map_err(|e| ResourceError::Parse {
                path: display,
                reason: e.to_string(),
            })
        } else {
            serde_yaml::from_str(&text).map_err(|e| ResourceError::Parse {
                path: display,
                reason: e.to_string(),
            })
        }
    }

    /// Load every parseable definition under the root into the registry.
    fn scan(&self) {
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !matches!(ext, "yaml" | "yml" | "json") {
                continue;
            }
            match Self::parse_document(path) {
                Ok(doc) => {
                    debug!(path = %path.display(), reference = doc.reference(), "loaded definition");
                    self.inner.register(doc);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unparseable definition");
                }
            }
        }
    }
}

#[async_trait]
impl ResourceService for FsResourceService {
    async fn resolve_definition(
        &self,
        kind: DefinitionKind,
        reference: &str,
        version: Option<u32>,
    ) -> Result<DefinitionDocument, ResourceError> {
        if let Ok(doc) = self.inner.resolve_definition(kind, reference, version).await {
            return Ok(doc);
        }
        self.scan();
        self.inner.resolve_definition(kind, reference, version).await
    }

    async fn create_run(&self, record: &RunRecord) -> Result<(), ResourceError> {
        self.inner.create_run(record).await
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        completed_at_ms: Option<u64>,
    ) -> Result<(), ResourceError> {
        self.inner.update_run_status(run_id, status, completed_at_ms).await
    }

    async fn persist_snapshot(
        &self,
        run_id: &str,
        context: &Value,
        active_tokens: &[Token],
    ) -> Result<(), ResourceError> {
        self.inner.persist_snapshot(run_id, context, active_tokens).await
    }

    async fn append_events(
        &self,
        run_id: &str,
        stream: Stream,
        events: &[Event],
    ) -> Result<(), ResourceError> {
        self.inner.append_events(run_id, stream, events).await
    }
}
