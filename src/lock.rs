//! Advisory locking over shared external state.
//!
//! The admission controller only needs "exclusive access for the duration of
//! a read-modify-write". [`AdvisoryLock`] captures that so the backing
//! mechanism (an OS file lock, an in-process lock, a database row lock, a
//! distributed lock service) can change without touching the controller.

use std::fmt;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::GateError;

/// First retry delay while contending for a lock.
const INITIAL_BACKOFF: Duration = Duration::from_millis(2);

/// Upper bound on a single retry delay.
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Held exclusive access. Releases the lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Exclusive advisory lock over some shared resource.
pub trait AdvisoryLock: Send + Sync + fmt::Debug {
    /// Block until exclusive access is granted or the backend's wait bound
    /// elapses.
    fn acquire(&self) -> Result<LockGuard, GateError>;
}

// ---------------------------------------------------------------------------
// FileLock -- cross-process OS advisory lock
// ---------------------------------------------------------------------------

/// OS advisory lock on a dedicated lock file.
///
/// Every acquisition opens its own file handle, so two threads of the same
/// process contend exactly like two processes do.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    /// `None` waits forever.
    timeout: Option<Duration>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, GateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| GateError::io(parent, e))?;
            }
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| GateError::io(&self.path, e))
    }

    fn lock_error(&self, source: std::io::Error) -> GateError {
        GateError::Lock {
            path: self.path.clone(),
            source,
        }
    }
}

impl AdvisoryLock for FileLock {
    fn acquire(&self) -> Result<LockGuard, GateError> {
        let file = self.open()?;

        match self.timeout {
            None => file.lock().map_err(|e| self.lock_error(e))?,
            Some(timeout) => {
                let started = Instant::now();
                let mut backoff = INITIAL_BACKOFF;
                loop {
                    match file.try_lock() {
                        Ok(()) => break,
                        Err(TryLockError::WouldBlock) => {
                            let waited = started.elapsed();
                            if waited >= timeout {
                                warn!(path = %self.path.display(), ?waited, "Lock acquisition timed out");
                                return Err(GateError::LockTimeout {
                                    path: self.path.clone(),
                                    waited,
                                });
                            }
                            std::thread::sleep(backoff.min(timeout - waited));
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                        Err(TryLockError::Error(e)) => return Err(self.lock_error(e)),
                    }
                }
            }
        }

        debug!(path = %self.path.display(), "Acquired file lock");
        Ok(LockGuard::new(move || {
            // Closing the handle releases the lock too; unlock first so the
            // release does not wait on handle teardown.
            let _ = file.unlock();
        }))
    }
}

// ---------------------------------------------------------------------------
// ProcessLock -- in-process exclusive lock
// ---------------------------------------------------------------------------

/// In-process lock for single-process embeddings and tests.
#[derive(Debug, Clone, Default)]
pub struct ProcessLock {
    inner: Arc<(Mutex<bool>, Condvar)>,
    timeout: Option<Duration>,
}

impl ProcessLock {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::default(),
            timeout,
        }
    }
}

impl AdvisoryLock for ProcessLock {
    fn acquire(&self) -> Result<LockGuard, GateError> {
        let (held, cvar) = &*self.inner;
        let started = Instant::now();
        let mut locked = held.lock().unwrap_or_else(|e| e.into_inner());

        while *locked {
            match self.timeout {
                None => locked = cvar.wait(locked).unwrap_or_else(|e| e.into_inner()),
                Some(timeout) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(GateError::LockTimeout {
                            path: PathBuf::from("<process>"),
                            waited,
                        });
                    }
                    locked = cvar
                        .wait_timeout(locked, timeout - waited)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
        *locked = true;
        drop(locked);

        let inner = Arc::clone(&self.inner);
        Ok(LockGuard::new(move || {
            let (held, cvar) = &*inner;
            *held.lock().unwrap_or_else(|e| e.into_inner()) = false;
            cvar.notify_one();
        }))
    }
}
