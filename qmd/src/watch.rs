use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::thread;

use notify::Config as NotifyConfig;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::service::QmdService;
use crate::workspace::STATE_DIR;
use crate::workspace::WorkspaceResolver;
use crate::workspace::is_markdown;

/// Queues debounced index passes for markdown changes under the workspace
/// root. Watching stops when this value is dropped.
pub struct WorkspaceWatcher {
    _watcher: RecommendedWatcher,
}

impl WorkspaceWatcher {
    pub fn start(service: QmdService) -> notify::Result<Self> {
        let root = service.resolver().root().to_path_buf();
        let (watch_tx, watch_rx) = std_mpsc::channel();
        let mut watcher = RecommendedWatcher::new(watch_tx, NotifyConfig::default())?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        thread::Builder::new()
            .name("qmd-watch".to_string())
            .spawn(move || {
                for res in watch_rx {
                    match res {
                        Ok(event) => dispatch(&service, &event),
                        Err(err) => warn!("qmd watcher error: {err:?}"),
                    }
                }
                debug!("qmd watcher stopped");
            })?;

        info!(root = %root.display(), "qmd watcher started");
        Ok(Self { _watcher: watcher })
    }
}

fn dispatch(service: &QmdService, event: &Event) {
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }
    for path in &event.paths {
        if let Some(workspace_id) = changed_workspace(service.resolver(), path) {
            service.queue_workspace_index_for_path(&workspace_id, &path.to_string_lossy());
        }
    }
}

/// Workspace owning `path` when a change there should trigger indexing.
fn changed_workspace(resolver: &WorkspaceResolver, path: &Path) -> Option<String> {
    let (workspace_id, relative) = resolver.split_workspace_path(path)?;
    if relative.as_os_str().is_empty() || !is_markdown(&relative) {
        return None;
    }
    if relative
        .components()
        .any(|component| component.as_os_str() == STATE_DIR)
    {
        return None;
    }
    Some(workspace_id)
}
