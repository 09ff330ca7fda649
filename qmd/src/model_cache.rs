//! Consolidates each workspace's engine model cache into one shared
//! directory.
//!
//! The engine downloads multi-gigabyte model weights into
//! `$HOME/.cache/qmd/models`. Every workspace gets its own `HOME`, so
//! without sharing each workspace would download its own copy. When a
//! shared directory is configured the per-workspace path becomes a
//! symlink to it, and anything already downloaded there is merged into
//! the shared directory first.
//!
//! Migration never overwrites a file that already exists in the shared
//! directory, so workspaces migrating concurrently cannot clobber each
//! other.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::info;

/// Location of the engine's model cache under a workspace `HOME`.
pub fn models_dir(home_dir: &Path) -> PathBuf {
    home_dir.join(".cache").join("qmd").join("models")
}

/// Makes `home_dir`'s model cache usable, linking it to `shared` when one
/// is configured. Idempotent.
pub fn ensure_model_cache(home_dir: &Path, shared: Option<&Path>) -> io::Result<()> {
    let models = models_dir(home_dir);
    let Some(shared) = shared else {
        return fs::create_dir_all(&models);
    };
    fs::create_dir_all(shared)?;
    if let Some(parent) = models.parent() {
        fs::create_dir_all(parent)?;
    }

    let meta = match fs::symlink_metadata(&models) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return link_shared(shared, &models);
        }
        Err(err) => return Err(err),
    };
    if meta.file_type().is_symlink() {
        if fs::read_link(&models)? == shared {
            return Ok(());
        }
        debug!(path = %models.display(), "repointing model cache link at shared directory");
        fs::remove_file(&models)?;
        return link_shared(shared, &models);
    }
    if !meta.is_dir() {
        return Err(io::Error::other(format!(
            "qmd models path is not a directory: {}",
            models.display()
        )));
    }

    merge_dir(&models, shared)?;
    if fs::read_dir(&models)?.next().is_some() {
        return Ok(());
    }
    fs::remove_dir(&models)?;
    info!(
        path = %models.display(),
        shared = %shared.display(),
        "migrated workspace models into shared directory"
    );
    link_shared(shared, &models)
}

fn link_shared(shared: &Path, link: &Path) -> io::Result<()> {
    match symlink_dir(shared, link) {
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

fn merge_dir(source: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            match fs::symlink_metadata(&target_path) {
                Ok(meta) if !meta.is_dir() => {
                    fs::remove_dir_all(&source_path)?;
                    continue;
                }
                _ => {}
            }
            merge_dir(&source_path, &target_path)?;
            fs::remove_dir(&source_path)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(&source_path)?;
            match symlink_file(&link_target, &target_path) {
                Err(err) if err.kind() != io::ErrorKind::AlreadyExists => return Err(err),
                _ => {}
            }
            fs::remove_file(&source_path)?;
        } else {
            move_file_no_clobber(&source_path, &target_path)?;
        }
    }
    Ok(())
}

/// Moves `source` to `target` unless `target` already exists, in which
/// case the shared copy wins and `source` is dropped.
fn move_file_no_clobber(source: &Path, target: &Path) -> io::Result<()> {
    match fs::hard_link(source, target) {
        Ok(()) => return fs::remove_file(source),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return fs::remove_file(source);
        }
        Err(err) => {
            debug!(path = %source.display(), error = %err, "hard link failed; copying model file");
        }
    }

    // Different filesystem: stage a copy next to the target so the final
    // link is atomic.
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = target.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
    fs::copy(source, &staging)?;
    let linked = fs::hard_link(&staging, target);
    fs::remove_file(&staging)?;
    match linked {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err),
    }
    fs::remove_file(source)
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn symlink_file(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_file(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
