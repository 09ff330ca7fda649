//! Per-workspace mutual exclusion for engine invocations.
//!
//! Two layers: an in-process async mutex per workspace directory, then an
//! advisory `flock` on `<workspace>/.qmd/qmd.lock` that also excludes
//! other processes sharing the same storage. Both are released when the
//! returned [`WorkspaceLease`] is dropped.

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::debug;

use crate::error::QmdError;
use crate::error::Result;
use crate::workspace::STATE_DIR;

pub const LOCK_FILE: &str = "qmd.lock";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn lock_file_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(STATE_DIR).join(LOCK_FILE)
}

/// Cross-process exclusivity for a single lock file.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Blocks until the lock is held or `deadline` passes.
    async fn acquire(&self, lock_path: &Path, deadline: Instant) -> Result<AdvisoryLease>;
}

/// Held advisory lock; unlocked on drop.
#[derive(Debug)]
pub struct AdvisoryLease {
    file: Option<File>,
}

impl AdvisoryLease {
    pub fn unlocked() -> Self {
        Self { file: None }
    }
}

impl Drop for AdvisoryLease {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

/// `flock`-based lock, polled until the deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlockAdvisoryLock;

#[async_trait]
impl AdvisoryLock for FlockAdvisoryLock {
    async fn acquire(&self, lock_path: &Path, deadline: Instant) -> Result<AdvisoryLease> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;
        let contended = fs2::lock_contended_error().raw_os_error();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(AdvisoryLease { file: Some(file) }),
                Err(err) if err.raw_os_error() == contended => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(QmdError::LockTimeout(lock_path.to_path_buf()));
            }
            debug!(path = %lock_path.display(), "workspace lock held elsewhere; waiting");
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// Skips cross-process locking. In-process serialization still applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAdvisoryLock;

#[async_trait]
impl AdvisoryLock for NoopAdvisoryLock {
    async fn acquire(&self, _lock_path: &Path, _deadline: Instant) -> Result<AdvisoryLease> {
        Ok(AdvisoryLease::unlocked())
    }
}

/// Both locks for one workspace. Field order releases the file lock
/// before the in-process mutex.
#[derive(Debug)]
pub struct WorkspaceLease {
    _advisory: AdvisoryLease,
    _local: OwnedMutexGuard<()>,
}

pub struct InvocationLock {
    local: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    advisory: Arc<dyn AdvisoryLock>,
}

impl InvocationLock {
    pub fn new(advisory: Arc<dyn AdvisoryLock>) -> Self {
        Self {
            local: StdMutex::new(HashMap::new()),
            advisory,
        }
    }

    pub async fn acquire(&self, workspace_dir: &Path, deadline: Instant) -> Result<WorkspaceLease> {
        let lock_path = lock_file_path(workspace_dir);
        let local = self.local_lock(workspace_dir);
        let local = tokio::time::timeout_at(deadline, local.lock_owned())
            .await
            .map_err(|_| QmdError::LockTimeout(lock_path.clone()))?;
        let advisory = self.advisory.acquire(&lock_path, deadline).await?;
        Ok(WorkspaceLease {
            _advisory: advisory,
            _local: local,
        })
    }

    fn local_lock(&self, workspace_dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = match self.local.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(workspace_dir.to_path_buf())
            .or_default()
            .clone()
    }
}
