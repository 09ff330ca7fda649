//! Debounced index scheduling.
//!
//! Change notifications for a workspace are coalesced into a single index
//! pass that runs once the workspace has been quiet for the configured
//! debounce interval. Whether that pass embeds is the OR of every
//! notification folded into it.

use std::path::Path;
use std::path::PathBuf;

use globset::GlobBuilder;
use globset::GlobSet;
use globset::GlobSetBuilder;
use tracing::debug;
use tracing::error;

use crate::config::normalize_pattern;
use crate::error::QmdError;
use crate::error::Result;
use crate::service::PendingIndex;
use crate::service::QmdService;
use crate::workspace::clean_relative;
use crate::workspace::validate_workspace_id;

/// Workspace-relative path patterns whose changes never trigger `embed`.
///
/// `dir/**` excludes `dir` and everything below it; other patterns are
/// globs where `*` does not cross `/`.
#[derive(Debug, Clone)]
pub struct EmbedExclusions {
    prefixes: Vec<String>,
    globs: GlobSet,
    empty: bool,
}

impl EmbedExclusions {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut prefixes = Vec::new();
        let mut builder = GlobSetBuilder::new();
        let mut empty = true;
        for pattern in patterns {
            let pattern = normalize_pattern(pattern);
            if pattern.is_empty() {
                continue;
            }
            empty = false;
            if let Some(prefix) = pattern.strip_suffix("/**") {
                prefixes.push(prefix.trim_end_matches('/').to_string());
                continue;
            }
            let glob = GlobBuilder::new(&pattern)
                .literal_separator(true)
                .build()
                .map_err(|err| {
                    QmdError::Config(format!("invalid embed exclude pattern {pattern:?}: {err}"))
                })?;
            builder.add(glob);
        }
        let globs = builder
            .build()
            .map_err(|err| QmdError::Config(format!("invalid embed exclude patterns: {err}")))?;
        Ok(Self {
            prefixes,
            globs,
            empty,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// `relative_path` uses `/` separators and is relative to the workspace.
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        let relative_path = relative_path.trim_start_matches("./");
        let prefix_match = self.prefixes.iter().any(|prefix| {
            prefix.is_empty()
                || relative_path == prefix
                || relative_path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        });
        prefix_match || self.globs.is_match(relative_path)
    }
}

impl QmdService {
    /// Schedules a debounced index pass that also embeds.
    pub fn queue_workspace_index(&self, workspace_id: &str) {
        self.queue_workspace_index_for_path(workspace_id, "");
    }

    /// Schedules a debounced index pass for a change at `changed_path`
    /// (absolute, or relative to the workspace). An empty path requests
    /// embedding. No-op after `close`.
    pub fn queue_workspace_index_for_path(&self, workspace_id: &str, changed_path: &str) {
        let workspace_id = match validate_workspace_id(workspace_id) {
            Ok(id) => id.to_string(),
            Err(err) => {
                debug!(error = %err, "qmd index not queued");
                return;
            }
        };
        let embed_requested = self.embed_requested_for_path(&workspace_id, changed_path);
        let debounce = self.inner.config.debounce();

        let mut state = self.state();
        if state.closed {
            return;
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        let entry = state.workspaces.entry(workspace_id.clone()).or_default();
        entry.pending_embed |= embed_requested;
        if let Some(previous) = entry.pending.take() {
            previous.handle.abort();
        }

        let service = self.clone();
        let timer_workspace = workspace_id.clone();
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            service.run_queued_index(&timer_workspace, generation).await;
        });
        entry.pending = Some(PendingIndex { generation, handle });
        debug!(
            workspace_id = %workspace_id,
            embed_requested,
            debounce_ms = debounce.as_millis() as u64,
            "qmd index queued"
        );
    }

    fn embed_requested_for_path(&self, workspace_id: &str, changed_path: &str) -> bool {
        let exclusions = &self.inner.exclusions;
        if exclusions.is_empty() {
            return true;
        }
        let changed_path = changed_path.trim();
        if changed_path.is_empty() {
            return true;
        }
        match self.workspace_relative(workspace_id, changed_path) {
            Some(relative) => !exclusions.is_excluded(&slash(&relative)),
            None => true,
        }
    }

    fn workspace_relative(&self, workspace_id: &str, changed_path: &str) -> Option<PathBuf> {
        let path = Path::new(changed_path);
        if path.is_absolute() {
            let (owner, relative) = self.inner.resolver.split_workspace_path(path)?;
            if owner != workspace_id || relative.as_os_str().is_empty() {
                return None;
            }
            return Some(relative);
        }
        clean_relative(changed_path)
    }

    async fn run_queued_index(&self, workspace_id: &str, generation: u64) {
        let embed_requested = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            let Some(entry) = state.workspaces.get_mut(workspace_id) else {
                return;
            };
            match &entry.pending {
                Some(pending) if pending.generation == generation => {}
                _ => return,
            }
            entry.pending = None;
            std::mem::take(&mut entry.pending_embed)
        };

        if let Err(err) = self.run_index_pass(workspace_id, embed_requested).await {
            error!(workspace_id, error = %err, "qmd async index failed");
        }
    }
}

fn slash(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
