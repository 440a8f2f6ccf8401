use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::core::IpcName;
use super::errors::{Result, RwLockError};

const SEM_MODE: libc::c_uint = 0o666;
const SEM_INITIAL_VALUE: libc::c_uint = 1;
const CANCEL_CHECK_NS: libc::c_long = 50_000_000;
const NANOS_PER_SEC: libc::c_long = 1_000_000_000;

/// Binary POSIX named semaphore used as a cross-process mutex.
///
/// There is no owner: any process that opened the name may post it,
/// whether or not it waited on it first.
pub struct NamedMutex {
    sem: *mut libc::sem_t,
    name: IpcName,
    unlink_on_drop: bool,
    cancel: Option<Arc<AtomicBool>>,
}

// sem_wait/sem_post are safe to call from any thread.
unsafe impl Send for NamedMutex {}

impl NamedMutex {
    pub fn open(name: &IpcName, unlink_on_drop: bool) -> Result<NamedMutex> {
        let sem = unsafe {
            libc::sem_open(
                name.as_c_str().as_ptr(),
                libc::O_CREAT,
                SEM_MODE,
                SEM_INITIAL_VALUE,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(RwLockError::last_os_error("sem_open", name.as_str()));
        }
        debug!(name = name.as_str(), "opened named semaphore");
        Ok(NamedMutex {
            sem,
            name: name.clone(),
            unlink_on_drop,
            cancel: None,
        })
    }

    /// Once the flag is set, a blocked `lock` gives up with `Interrupted`.
    pub fn set_cancel(&mut self, cancel: Arc<AtomicBool>) {
        self.cancel = Some(cancel);
    }

    pub fn name(&self) -> &IpcName {
        &self.name
    }

    /// Blocks until the semaphore is taken. With a cancellation flag attached
    /// the wait wakes up every `CANCEL_CHECK_NS` to look at the flag.
    pub fn lock(&self) -> Result<NamedMutexGuard<'_>> {
        loop {
            let rc = match self.cancel {
                Some(_) => {
                    let deadline = cancel_check_deadline()
                        .map_err(|e| self.ipc_error("clock_gettime", e))?;
                    unsafe { libc::sem_timedwait(self.sem, &deadline) }
                }
                None => unsafe { libc::sem_wait(self.sem) },
            };
            if rc == 0 {
                return Ok(NamedMutexGuard { mutex: self });
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::ETIMEDOUT) => {}
                _ => return Err(self.ipc_error("sem_wait", err)),
            }
            if self.is_cancelled() {
                return Err(RwLockError::Interrupted { op: "sem_wait" });
            }
        }
    }

    fn ipc_error(&self, op: &'static str, source: io::Error) -> RwLockError {
        RwLockError::Ipc {
            op,
            name: self.name.to_string(),
            source,
        }
    }

    /// Posts the semaphore without any check that the caller holds it.
    pub fn unlock(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } == -1 {
            return Err(RwLockError::last_os_error("sem_post", self.name.as_str()));
        }
        Ok(())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |c| c.load(Ordering::Relaxed))
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem) };
        if self.unlink_on_drop {
            if let Err(e) = unlink(&self.name) {
                warn!("{}", e);
            }
        }
    }
}

/// Absolute CLOCK_REALTIME time, as `sem_timedwait` expects, one check interval ahead.
fn cancel_check_deadline() -> io::Result<libc::timespec> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } == -1 {
        return Err(io::Error::last_os_error());
    }
    ts.tv_nsec += CANCEL_CHECK_NS;
    if ts.tv_nsec >= NANOS_PER_SEC {
        ts.tv_sec += 1;
        ts.tv_nsec -= NANOS_PER_SEC;
    }
    Ok(ts)
}

/// Removes the semaphore name. An already removed name is not an error.
pub(crate) fn unlink(name: &IpcName) -> Result<()> {
    if unsafe { libc::sem_unlink(name.as_c_str().as_ptr()) } == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::NotFound {
            return Err(RwLockError::Ipc {
                op: "sem_unlink",
                name: name.to_string(),
                source: err,
            });
        }
    }
    Ok(())
}

/// Proof of holding a [`NamedMutex`]. Posts the semaphore when dropped.
pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
}

impl<'a> NamedMutexGuard<'a> {
    /// Releases now, reporting a failed `sem_post` instead of only logging it.
    pub fn unlock(self) -> Result<()> {
        let mutex = self.mutex;
        mem::forget(self);
        mutex.unlock()
    }
}

impl<'a> Drop for NamedMutexGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            error!("{}", e);
        }
    }
}
