use std::fs;
use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::error::QmdError;
use crate::error::Result;

/// Per-workspace state directory owned by this crate and the engine.
pub const STATE_DIR: &str = ".qmd";

const MARKDOWN_EXTENSION: &str = "md";

/// A document reference accepted by `open_markdown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentTarget {
    /// Engine document id (`#abc123`), passed through to `get`.
    DocId(String),
    /// A markdown file inside the workspace.
    File { relative: PathBuf, absolute: PathBuf },
}

/// Maps workspace identifiers to directories under a single root.
#[derive(Debug, Clone)]
pub struct WorkspaceResolver {
    root: PathBuf,
}

impl WorkspaceResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: lexical_clean(&root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `root/<id>`, optionally creating it.
    pub fn workspace_dir(&self, workspace_id: &str, create: bool) -> Result<PathBuf> {
        let workspace_id = validate_workspace_id(workspace_id)?;
        if self.root.as_os_str().is_empty() {
            return Err(QmdError::InvalidWorkspace(
                "workspace root is not configured".to_string(),
            ));
        }
        let path = self.root.join(workspace_id);
        if create {
            fs::create_dir_all(&path)?;
        }
        Ok(path)
    }

    /// Accepts `dir` only when it names a path strictly below the root.
    /// Existence is not checked.
    pub fn validate_workspace_path(&self, dir: &str) -> Result<PathBuf> {
        let dir = dir.trim();
        if dir.is_empty() || self.root.as_os_str().is_empty() {
            return Err(QmdError::InvalidWorkspace(
                "workspace path is required".to_string(),
            ));
        }
        let path = lexical_clean(Path::new(dir));
        match path.strip_prefix(&self.root) {
            Ok(relative) if !relative.as_os_str().is_empty() => Ok(path),
            _ => Err(QmdError::InvalidWorkspace(
                "workspace path must be inside workspace root".to_string(),
            )),
        }
    }

    /// Splits a path below the root into its workspace id and the path
    /// relative to that workspace.
    pub fn split_workspace_path(&self, path: &Path) -> Option<(String, PathBuf)> {
        let relative = lexical_clean(path);
        let relative = relative.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let workspace_id = match components.next()? {
            Component::Normal(name) => name.to_str()?.to_string(),
            _ => return None,
        };
        validate_workspace_id(&workspace_id).ok()?;
        Some((workspace_id, components.as_path().to_path_buf()))
    }

    pub fn resolve_target(&self, workspace_dir: &Path, target: &str) -> Result<DocumentTarget> {
        let target = target.trim();
        if target.is_empty() {
            return Err(QmdError::InvalidTarget("empty target".to_string()));
        }
        if target.starts_with('#') {
            return Ok(DocumentTarget::DocId(target.to_string()));
        }
        let relative = clean_relative(target)
            .ok_or_else(|| QmdError::InvalidTarget(format!("{target} escapes the workspace")))?;
        if !is_markdown(&relative) {
            return Err(QmdError::InvalidTarget(format!(
                "{target} is not a markdown file"
            )));
        }
        let absolute = workspace_dir.join(&relative);
        Ok(DocumentTarget::File { relative, absolute })
    }
}

pub fn validate_workspace_id(workspace_id: &str) -> Result<&str> {
    let workspace_id = workspace_id.trim();
    if workspace_id.is_empty()
        || workspace_id.contains("..")
        || workspace_id.contains('/')
        || workspace_id.contains('\\')
    {
        return Err(QmdError::InvalidWorkspace(format!(
            "invalid workspace id: {workspace_id:?}"
        )));
    }
    Ok(workspace_id)
}

/// Normalizes a relative path without touching the filesystem. Returns
/// `None` for absolute, empty, `.` or root-escaping inputs.
pub fn clean_relative(target: &str) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(target).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return None,
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(part) => parts.push(part),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

pub fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(MARKDOWN_EXTENSION))
}

pub fn dir_exists(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.is_dir()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}
