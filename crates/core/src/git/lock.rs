//! Single-writer access to the shadow repository.
//!
//! Each lifecycle trigger runs in its own process, so the in-process mutex
//! around the [`GitClient`] only orders tasks of one engine. [`ShadowWriter`]
//! pairs it with an advisory `flock(2)` on `<data_dir>/shadow.lock` (via
//! `fs2`). The OS releases the file lock when a process dies, so there is
//! no stale lock to detect.

use std::fs::{File, OpenOptions};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::GitClient;
use crate::errors::GitError;

/// Lock file name inside the data directory.
pub const LOCK_FILE: &str = "shadow.lock";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An exclusive advisory lock on a file, held until dropped.
pub struct RepoLock {
    _file: File,
}

impl RepoLock {
    /// Poll for the lock until it is free or `timeout` has passed.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, GitError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        let mut contended = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if contended {
                        debug!(
                            path = %path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "writer lock acquired after waiting"
                        );
                    }
                    return Ok(Self { _file: file });
                }
                Err(_) if start.elapsed() >= timeout => {
                    warn!(path = %path.display(), "timed out waiting for the writer lock");
                    return Err(GitError::LockTimeout {
                        path: path.display().to_string(),
                        waited_secs: timeout.as_secs(),
                    });
                }
                Err(_) => {
                    contended = true;
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}

/// The shadow repository behind both the process-local mutex and the
/// cross-process file lock.
pub struct ShadowWriter {
    git: Mutex<GitClient>,
    lock_path: PathBuf,
    timeout: Duration,
}

/// Exclusive access to the shadow repository. Dereferences to the client.
pub struct WriterGuard<'a> {
    git: MutexGuard<'a, GitClient>,
    _lock: RepoLock,
}

impl ShadowWriter {
    pub fn new(git: GitClient, data_dir: &Path, timeout: Duration) -> Self {
        Self {
            git: Mutex::new(git),
            lock_path: data_dir.join(LOCK_FILE),
            timeout,
        }
    }

    /// Wait for exclusive access. The in-process mutex is taken first, so
    /// tasks of one engine queue on it rather than on the file.
    pub async fn lock(&self) -> Result<WriterGuard<'_>, GitError> {
        let git = self.git.lock().await;
        let lock = RepoLock::acquire(&self.lock_path, self.timeout).await?;
        Ok(WriterGuard { git, _lock: lock })
    }
}

impl Deref for WriterGuard<'_> {
    type Target = GitClient;

    fn deref(&self) -> &GitClient {
        &self.git
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        {
            let _lock = RepoLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
            assert!(path.exists());
        }
        RepoLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        let _held = RepoLock::acquire(&path, Duration::from_secs(1)).await.unwrap();
        let result = RepoLock::acquire(&path, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(GitError::LockTimeout { .. })));
    }

    #[test]
    fn test_writers_on_separate_threads_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        GitClient::init(&repo, "shadow-main").unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let repo = repo.clone();
                let data_dir = dir.path().to_path_buf();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    rt.block_on(async {
                        let writer = ShadowWriter::new(
                            GitClient::new(&repo).unwrap(),
                            &data_dir,
                            Duration::from_secs(10),
                        );
                        barrier.wait();
                        let _guard = writer.lock().await.unwrap();
                        let marker = data_dir.join("holder");
                        // Nobody else may be inside while the marker exists.
                        assert!(!marker.exists());
                        std::fs::write(&marker, "x").unwrap();
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        std::fs::remove_file(&marker).unwrap();
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
