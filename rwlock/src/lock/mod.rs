use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::core::{IpcName, RwLockConfig};
use super::errors::{Result, RwLockError};
use super::mutex::NamedMutex;
use super::state::{LockStat, SharedState};

/// Reader-writer lock shared by unrelated processes through a name.
///
/// The lock is held by the counters in shared memory, not by this handle:
/// dropping the handle (or exiting) after `rlock` leaves the read lock taken
/// until some process calls `runlock`. Any process may release, there is no
/// holder identity.
pub struct NamedRwLock {
    // Declared first so the mapping goes away before the semaphore.
    state: SharedState,
    mtx: NamedMutex,
    cfg: RwLockConfig,
}

impl NamedRwLock {
    pub fn open(name: &str, cfg: &RwLockConfig) -> Result<NamedRwLock> {
        let name = IpcName::new(name)?;
        let mtx = NamedMutex::open(&name, cfg.unlink_on_drop)?;
        let (state, initialized) = {
            let guard = mtx.lock()?;
            let opened = SharedState::open(&name, &guard, cfg.unlink_on_drop)?;
            guard.unlock()?;
            opened
        };
        debug!(name = name.as_str(), initialized, "opened named rwlock");
        Ok(NamedRwLock { state, mtx, cfg: cfg.clone() })
    }

    pub fn open_default(name: &str) -> Result<NamedRwLock> {
        NamedRwLock::open(name, &RwLockConfig::default())
    }

    /// Attaches a flag that aborts waiting with `Interrupted` once set.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> NamedRwLock {
        self.mtx.set_cancel(cancel);
        self
    }

    pub fn name(&self) -> &IpcName {
        self.mtx.name()
    }

    pub fn config(&self) -> &RwLockConfig {
        &self.cfg
    }

    /// Blocks until no writer is present, then registers one more reader.
    pub fn rlock(&mut self) -> Result<()> {
        self.poll("rlock", NamedRwLock::try_rlock)
    }

    /// Registers a reader if no writer is present. Never waits for a writer.
    pub fn try_rlock(&mut self) -> Result<bool> {
        let guard = self.mtx.lock()?;
        let stat = self.state.snapshot(&guard)?;
        if stat.writers != 0 {
            guard.unlock()?;
            return Ok(false);
        }
        let readers = match stat.readers.checked_add(1) {
            Some(v) => v,
            None => {
                guard.unlock()?;
                return Err(self.rejected("rlock", stat));
            }
        };
        self.state.set_readers(&guard, readers)?;
        guard.unlock()?;
        debug!(name = self.mtx.name().as_str(), readers, "read lock acquired");
        Ok(true)
    }

    pub fn runlock(&mut self) -> Result<()> {
        let guard = self.mtx.lock()?;
        let stat = self.state.snapshot(&guard)?;
        if stat.writers != 0 || stat.readers == 0 {
            guard.unlock()?;
            return Err(self.rejected("runlock", stat));
        }
        self.state.set_readers(&guard, stat.readers - 1)?;
        guard.unlock()?;
        debug!(name = self.mtx.name().as_str(), readers = stat.readers - 1, "read lock released");
        Ok(())
    }

    /// Blocks until there is neither a reader nor a writer, then becomes the writer.
    pub fn wlock(&mut self) -> Result<()> {
        self.poll("wlock", NamedRwLock::try_wlock)
    }

    pub fn try_wlock(&mut self) -> Result<bool> {
        let guard = self.mtx.lock()?;
        let stat = self.state.snapshot(&guard)?;
        if stat.readers != 0 || stat.writers != 0 {
            guard.unlock()?;
            return Ok(false);
        }
        self.state.set_writers(&guard, 1)?;
        guard.unlock()?;
        debug!(name = self.mtx.name().as_str(), "write lock acquired");
        Ok(true)
    }

    pub fn wunlock(&mut self) -> Result<()> {
        let guard = self.mtx.lock()?;
        let stat = self.state.snapshot(&guard)?;
        if stat.readers != 0 || stat.writers != 1 {
            guard.unlock()?;
            return Err(self.rejected("wunlock", stat));
        }
        self.state.set_writers(&guard, 0)?;
        guard.unlock()?;
        debug!(name = self.mtx.name().as_str(), "write lock released");
        Ok(())
    }

    pub fn stat(&self) -> Result<LockStat> {
        let guard = self.mtx.lock()?;
        let stat = self.state.snapshot(&guard)?;
        guard.unlock()?;
        Ok(stat)
    }

    /// Runs `attempt` until it succeeds. The sleep happens with the mutex
    /// released; every attempt re-checks the counters from scratch.
    fn poll<F>(&mut self, op: &'static str, attempt: F) -> Result<()>
    where
        F: Fn(&mut NamedRwLock) -> Result<bool>,
    {
        let started = Instant::now();
        let interval = self.cfg.poll_interval();
        let deadline = self.cfg.timeout().map(|t| started + t);
        let mut attempts = 0u64;
        loop {
            if attempt(self)? {
                return Ok(());
            }
            attempts += 1;
            if self.mtx.is_cancelled() {
                return Err(RwLockError::Interrupted { op });
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RwLockError::Timeout {
                            op,
                            waited: now - started,
                        });
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };
            trace!(name = self.mtx.name().as_str(), op, attempts, "lock busy, retrying");
            thread::sleep(pause);
        }
    }

    /// Overwrites both counters, for tests that need a damaged segment.
    #[cfg(test)]
    pub(crate) fn overwrite_stat(&mut self, stat: LockStat) -> Result<()> {
        let guard = self.mtx.lock()?;
        self.state.set_readers(&guard, stat.readers)?;
        self.state.set_writers(&guard, stat.writers)?;
        guard.unlock()
    }

    fn rejected(&self, op: &'static str, stat: LockStat) -> RwLockError {
        warn!(name = self.mtx.name().as_str(), %stat, "{} rejected", op);
        RwLockError::Inconsistent { op, stat }
    }
}

/// Removes the named semaphore and shared memory segment of a lock.
///
/// Processes that still have them open keep working on the old objects;
/// the next open creates fresh, zeroed ones.
pub fn remove(name: &str) -> Result<()> {
    let name = IpcName::new(name)?;
    super::state::unlink(&name)?;
    super::mutex::unlink(&name)
}
