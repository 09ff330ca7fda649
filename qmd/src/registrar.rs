//! Registers each workspace as an engine collection exactly once.
//!
//! Readiness is remembered in memory and mirrored by a marker file under
//! `.qmd/collections/`, keyed by index and collection name, so restarts
//! do not re-register. An existing engine index file also counts as
//! registered.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use tokio::time::Instant;
use tracing::debug;

use crate::classify::looks_like_already_exists;
use crate::error::Result;
use crate::service::QmdService;
use crate::workspace::STATE_DIR;

const MARKER_DIR: &str = "collections";
const MARKDOWN_MASK: &str = "**/*.md";

/// The engine's on-disk index for a workspace.
pub fn index_file(workspace_dir: &Path) -> PathBuf {
    workspace_dir
        .join(STATE_DIR)
        .join("cache")
        .join("qmd")
        .join("index.sqlite")
}

pub fn marker_path(workspace_dir: &Path, index_name: &str, collection: &str) -> PathBuf {
    let file_name = format!(
        "{}__{}.ready",
        sanitize_marker_part(index_name),
        sanitize_marker_part(collection)
    );
    workspace_dir.join(STATE_DIR).join(MARKER_DIR).join(file_name)
}

fn sanitize_marker_part(value: &str) -> String {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return "default".to_string();
    }
    value
        .chars()
        .map(|ch| match ch {
            'a'..='z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect()
}

fn write_marker(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            debug!(path = %path.display(), error = %err, "qmd collection marker mkdir failed");
            return;
        }
    }
    if let Err(err) = fs::write(path, b"ok\n") {
        debug!(path = %path.display(), error = %err, "qmd collection marker write failed");
    }
}

impl QmdService {
    pub(crate) async fn ensure_collection(&self, workspace_dir: &Path, deadline: Instant) -> Result<()> {
        if self.state().collections.contains(workspace_dir) {
            return Ok(());
        }
        let config = &self.inner.config;
        let marker = marker_path(workspace_dir, &config.index_name, &config.collection);
        if index_file(workspace_dir).exists() || marker.exists() {
            self.mark_collection_ready(workspace_dir);
            return Ok(());
        }

        let args = [
            "collection",
            "add",
            ".",
            "--name",
            config.collection.as_str(),
            "--mask",
            MARKDOWN_MASK,
        ];
        match self.run_engine(workspace_dir, &args, deadline).await {
            Ok(_) => {}
            Err(err) if looks_like_already_exists(&err.diagnostic_text()) => {
                debug!(workspace = %workspace_dir.display(), "qmd collection already registered");
            }
            Err(err) => return Err(err),
        }
        write_marker(&marker);
        self.mark_collection_ready(workspace_dir);
        Ok(())
    }

    fn mark_collection_ready(&self, workspace_dir: &Path) {
        self.state().collections.insert(workspace_dir.to_path_buf());
    }
}
