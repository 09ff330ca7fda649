use std::collections::HashMap;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::classify::looks_like_document_not_found;
use crate::classify::looks_like_index_not_ready;
use crate::classify::looks_like_query_fallback;
use crate::classify::prefers_lexical_search;
use crate::classify::update_reports_pending_vectors;
use crate::config::QmdConfig;
use crate::error::QmdError;
use crate::error::Result;
use crate::invoker::EngineInvoker;
use crate::lock::AdvisoryLock;
use crate::lock::FlockAdvisoryLock;
use crate::parse::SearchResult;
use crate::parse::parse_search_results;
use crate::registrar::index_file;
use crate::runner::CommandRunner;
use crate::runner::ProcessRunner;
use crate::scheduler::EmbedExclusions;
use crate::workspace::DocumentTarget;
use crate::workspace::WorkspaceResolver;
use crate::workspace::dir_exists;

const STATUS_SUMMARY_MAX_BYTES: usize = 800;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenResult {
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

/// Point-in-time view of a workspace's index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub workspace_id: String,
    pub workspace_path: PathBuf,
    pub workspace_exists: bool,
    pub pending: bool,
    pub indexed: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_indexed_at: Option<OffsetDateTime>,
    pub binary: String,
    pub index_file: PathBuf,
    pub index_exists: bool,
    pub summary: String,
    /// Set when the engine's `status` subcommand failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_error: Option<String>,
}

/// Index/search/open operations over per-workspace engine indexes.
///
/// Cheap to clone; clones share state. Must be created inside a Tokio
/// runtime, whose handle is used for debounced index timers.
#[derive(Clone)]
pub struct QmdService {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: QmdConfig,
    pub(crate) resolver: WorkspaceResolver,
    pub(crate) invoker: EngineInvoker,
    pub(crate) exclusions: EmbedExclusions,
    pub(crate) runtime: Handle,
    pub(crate) state: Mutex<ServiceState>,
}

#[derive(Default)]
pub(crate) struct ServiceState {
    pub(crate) workspaces: HashMap<String, WorkspaceIndexState>,
    pub(crate) collections: HashSet<PathBuf>,
    pub(crate) next_generation: u64,
    pub(crate) closed: bool,
}

#[derive(Default)]
pub(crate) struct WorkspaceIndexState {
    pub(crate) pending: Option<PendingIndex>,
    pub(crate) pending_embed: bool,
    pub(crate) indexed: bool,
    pub(crate) last_indexed_at: Option<OffsetDateTime>,
}

pub(crate) struct PendingIndex {
    pub(crate) generation: u64,
    pub(crate) handle: JoinHandle<()>,
}

impl QmdService {
    pub fn new(config: QmdConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(ProcessRunner), Arc::new(FlockAdvisoryLock))
    }

    pub fn with_parts(
        config: QmdConfig,
        runner: Arc<dyn CommandRunner>,
        advisory: Arc<dyn AdvisoryLock>,
    ) -> Result<Self> {
        let config = config.normalized();
        config.validate().map_err(QmdError::Config)?;
        let runtime = Handle::try_current()
            .map_err(|err| QmdError::Config(format!("qmd service needs a tokio runtime: {err}")))?;
        let exclusions = EmbedExclusions::new(&config.embed_exclude)?;
        let invoker = EngineInvoker::new(&config, runner, advisory)?;
        Ok(Self {
            inner: Arc::new(Inner {
                resolver: WorkspaceResolver::new(config.workspace_root.clone()),
                config,
                invoker,
                exclusions,
                runtime,
                state: Mutex::new(ServiceState::default()),
            }),
        })
    }

    pub fn config(&self) -> &QmdConfig {
        &self.inner.config
    }

    pub fn resolver(&self) -> &WorkspaceResolver {
        &self.inner.resolver
    }

    pub async fn search(&self, workspace_id: &str, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.ensure_open()?;
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let workspace_dir = self.inner.resolver.workspace_dir(workspace_id, false)?;
        if !dir_exists(&workspace_dir)? {
            return Ok(Vec::new());
        }

        let limit = if limit == 0 {
            self.inner.config.search_limit
        } else {
            limit
        };
        let limit = limit.to_string();
        let deadline = Instant::now() + self.inner.config.query_timeout();
        let result = if prefers_lexical_search(query) {
            self.run_engine(&workspace_dir, &query_args("search", query, &limit), deadline)
                .await
        } else {
            match self
                .run_engine(&workspace_dir, &query_args("query", query, &limit), deadline)
                .await
            {
                Err(err) if looks_like_query_fallback(&err.diagnostic_text()) => {
                    debug!(workspace_id, error = %err, "qmd query failed; falling back to search");
                    let deadline = Instant::now() + self.inner.config.query_timeout();
                    self.run_engine(&workspace_dir, &query_args("search", query, &limit), deadline)
                        .await
                }
                other => other,
            }
        };

        match result {
            Ok(output) => Ok(parse_search_results(&output)),
            Err(err) if looks_like_index_not_ready(&err.diagnostic_text()) => {
                debug!(workspace_id, error = %err, "qmd index not ready during search; queueing async index");
                self.queue_workspace_index(workspace_id);
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn open_markdown(&self, workspace_id: &str, target: &str) -> Result<OpenResult> {
        self.ensure_open()?;
        let workspace_dir = self.inner.resolver.workspace_dir(workspace_id, false)?;
        let max_bytes = self.inner.config.open_max_bytes;
        match self.inner.resolver.resolve_target(&workspace_dir, target)? {
            DocumentTarget::DocId(doc_id) => {
                if !dir_exists(&workspace_dir)? {
                    return Err(QmdError::NotFound);
                }
                let deadline = Instant::now() + self.inner.config.query_timeout();
                let output = match self
                    .run_engine(&workspace_dir, &["get", doc_id.as_str(), "--full"], deadline)
                    .await
                {
                    Ok(output) => output,
                    Err(err)
                        if matches!(
                            err,
                            QmdError::Command(_) | QmdError::Sidecar { detail: Some(_), .. }
                        ) && looks_like_document_not_found(&err.diagnostic_text()) =>
                    {
                        debug!(workspace_id, doc_id = %doc_id, error = %err, "qmd document lookup failed");
                        return Err(QmdError::NotFound);
                    }
                    Err(err) => return Err(err),
                };
                let (content, truncated) = truncate(&String::from_utf8_lossy(&output), max_bytes);
                if content.is_empty() {
                    return Err(QmdError::NotFound);
                }
                Ok(OpenResult {
                    path: doc_id,
                    content,
                    truncated,
                })
            }
            DocumentTarget::File { relative, absolute } => {
                let bytes = match tokio::fs::read(&absolute).await {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        return Err(QmdError::NotFound);
                    }
                    Err(err) => return Err(err.into()),
                };
                let (content, truncated) = truncate(&String::from_utf8_lossy(&bytes), max_bytes);
                Ok(OpenResult {
                    path: slash_path(&relative),
                    content,
                    truncated,
                })
            }
        }
    }

    /// Registers, updates and (when vectors are pending) embeds the
    /// workspace.
    pub async fn index_workspace(&self, workspace_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.run_index_pass(workspace_id, true).await
    }

    pub(crate) async fn run_index_pass(&self, workspace_id: &str, embed_requested: bool) -> Result<()> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.index_timeout();
        let workspace_id = workspace_id.trim();
        let workspace_dir = self.inner.resolver.workspace_dir(workspace_id, true)?;

        self.ensure_collection(&workspace_dir, deadline).await?;
        let update = self.run_engine(&workspace_dir, &["update"], deadline).await?;

        if config.auto_embed && embed_requested {
            if !update_reports_pending_vectors(&String::from_utf8_lossy(&update)) {
                debug!(workspace_id, reason = "no pending vectors", "qmd embed skipped");
            } else if let Err(err) = self.run_engine(&workspace_dir, &["embed"], deadline).await {
                if !self.is_tolerated_embed_failure(&err) {
                    return Err(err);
                }
                warn!(
                    workspace_id,
                    error = %err,
                    "qmd embed failed with a known crash; continuing without refreshed embeddings"
                );
            }
        } else if config.auto_embed {
            debug!(workspace_id, reason = "path excluded", "qmd embed skipped");
        }

        let mut state = self.state();
        let entry = state.workspaces.entry(workspace_id.to_string()).or_default();
        entry.indexed = true;
        entry.last_indexed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    pub async fn status(&self, workspace_id: &str) -> Result<Status> {
        self.ensure_open()?;
        let workspace_id = workspace_id.trim();
        let workspace_dir = self.inner.resolver.workspace_dir(workspace_id, false)?;
        let index_file = index_file(&workspace_dir);
        let mut status = Status {
            workspace_id: workspace_id.to_string(),
            workspace_path: workspace_dir.clone(),
            workspace_exists: false,
            pending: false,
            indexed: false,
            last_indexed_at: None,
            binary: self.inner.config.binary.clone(),
            index_file: index_file.clone(),
            index_exists: false,
            summary: String::new(),
            engine_error: None,
        };
        {
            let state = self.state();
            if let Some(entry) = state.workspaces.get(workspace_id) {
                status.pending = entry.pending.is_some();
                status.indexed = entry.indexed;
                status.last_indexed_at = entry.last_indexed_at;
            }
        }

        status.workspace_exists = dir_exists(&workspace_dir)?;
        if !status.workspace_exists {
            return Ok(status);
        }
        status.index_exists = index_file.is_file();

        let deadline = Instant::now() + self.inner.config.query_timeout();
        match self.run_engine(&workspace_dir, &["status"], deadline).await {
            Ok(output) => {
                status.summary = compact_line(&String::from_utf8_lossy(&output), STATUS_SUMMARY_MAX_BYTES);
            }
            Err(err) => {
                debug!(workspace_id, error = %err, "qmd status failed");
                status.engine_error = Some(err.to_string());
            }
        }
        Ok(status)
    }

    /// Cancels every pending index timer and rejects further work.
    /// Idempotent.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        for entry in state.workspaces.values_mut() {
            if let Some(pending) = entry.pending.take() {
                pending.handle.abort();
            }
            entry.pending_embed = false;
        }
        state.collections.clear();
    }

    /// Runs one engine subcommand for `workspace_dir` through the
    /// resilient invoker.
    pub async fn run_engine<S: AsRef<str>>(
        &self,
        workspace_dir: &Path,
        args: &[S],
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        let args: Vec<String> = args.iter().map(|arg| arg.as_ref().to_string()).collect();
        self.inner.invoker.run(workspace_dir, &args, deadline).await
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ServiceState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state().closed {
            return Err(QmdError::Closed);
        }
        Ok(())
    }

    fn is_tolerated_embed_failure(&self, err: &QmdError) -> bool {
        match err {
            QmdError::Command(command) => command.is_tolerated(),
            QmdError::Sidecar { .. } => {
                self.inner.invoker.classifier().is_tolerated(&err.diagnostic_text())
            }
            _ => false,
        }
    }
}

fn query_args<'a>(subcommand: &'a str, query: &'a str, limit: &'a str) -> [&'a str; 5] {
    [subcommand, query, "--json", "-n", limit]
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Trims `input` and caps it at `max_bytes` on a character boundary.
pub(crate) fn truncate(input: &str, max_bytes: usize) -> (String, bool) {
    let trimmed = input.trim();
    if trimmed.len() <= max_bytes {
        return (trimmed.to_string(), false);
    }
    let mut end = max_bytes;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    (trimmed[..end].trim().to_string(), true)
}

pub(crate) fn compact_line(input: &str, max_bytes: usize) -> String {
    let compact = input.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.len() <= max_bytes {
        return compact;
    }
    let mut end = max_bytes;
    while !compact.is_char_boundary(end) {
        end -= 1;
    }
    compact[..end].to_string()
}
