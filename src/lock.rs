//! Advisory locks serializing orchestration and backup runs
//!
//! Each [`LockScope`] maps to one lock file under the lock directory. The
//! lock is an exclusive `flock(2)`, so the kernel releases it when the
//! holder exits for any reason; there is no stale-lock cleanup to get wrong.
//!
//! Acquisition polls a non-blocking lock until the configured timeout and
//! then fails fast with [`LockError::Busy`]. Competing runs are reported,
//! never queued. A termination signal ends the wait early with
//! [`LockError::Interrupted`].

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{debug, info};

/// How often a blocked acquisition retries.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared resources guarded by a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum LockScope {
    /// The state file, mutated by orchestration runs
    Orchestration,
    /// The backup archive root
    Backup,
}

#[derive(Error, Debug)]
pub enum LockError {
    /// Another process held the lock for the whole timeout
    #[error("{scope} lock is busy{}", .holder_pid.map(|p| format!(" (held by pid {})", p)).unwrap_or_default())]
    Busy {
        scope: LockScope,
        holder_pid: Option<u32>,
    },

    /// A termination signal arrived while waiting
    #[error("interrupted while waiting for the {scope} lock")]
    Interrupted { scope: LockScope },

    #[error("cannot use lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Hands out scoped exclusive locks.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
    interrupt: Arc<AtomicBool>,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            interrupt: crate::process_guard::interrupt_flag(),
        }
    }

    /// Watch a specific interrupt flag instead of the process-wide one.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Path of the lock file backing `scope`.
    pub fn lock_path(&self, scope: LockScope) -> PathBuf {
        self.dir.join(format!("{}.lock", scope))
    }

    /// Block (up to the timeout) until `scope` is exclusively held.
    ///
    /// # Errors
    ///
    /// - `Busy` if another holder kept the lock past the timeout
    /// - `Interrupted` if the interrupt flag is raised while waiting
    /// - `Io` if the lock directory or file cannot be opened
    pub fn acquire(&self, scope: LockScope) -> Result<LockGuard, LockError> {
        let path = self.lock_path(scope);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;

        let start = Instant::now();
        let mut file = open_lock_file(&path).map_err(io_err)?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    record_holder(&lock).map_err(io_err)?;
                    info!("Acquired {} lock", scope);
                    return Ok(LockGuard {
                        scope,
                        path,
                        _lock: lock,
                    });
                }
                Err((returned, errno)) if errno == Errno::EWOULDBLOCK => {
                    if self.interrupt.load(Ordering::SeqCst) {
                        info!("Gave up waiting for {} lock: interrupted", scope);
                        return Err(LockError::Interrupted { scope });
                    }
                    if start.elapsed() >= self.timeout {
                        let holder_pid = read_holder(&path);
                        return Err(LockError::Busy { scope, holder_pid });
                    }
                    debug!("{} lock held elsewhere, retrying", scope);
                    file = returned;
                    thread::sleep(POLL_INTERVAL.min(self.timeout.saturating_sub(start.elapsed())));
                }
                Err((_, errno)) => return Err(io_err(std::io::Error::from(errno))),
            }
        }
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    // No truncate: the current holder's pid must survive our open.
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn record_holder(file: &File) -> std::io::Result<()> {
    file.set_len(0)?;
    let mut writer: &File = file;
    writeln!(writer, "{}", std::process::id())?;
    Ok(())
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Exclusive hold on a [`LockScope`]; released on drop.
pub struct LockGuard {
    scope: LockScope,
    path: PathBuf,
    _lock: Flock<File>,
}

impl LockGuard {
    pub fn scope(&self) -> LockScope {
        self.scope
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("scope", &self.scope)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("Released {} lock", self.scope);
    }
}
