use std::fmt;
use std::io;
use std::mem;
use std::ptr;

use tracing::{debug, warn};

use super::core::IpcName;
use super::errors::{Result, RwLockError};
use super::mutex::NamedMutexGuard;

pub const WORD: usize = mem::size_of::<usize>();
pub const READERS_OFFSET: usize = 0;
pub const WRITERS_OFFSET: usize = WORD;
/// Two native words, readers then writers. No header, no version tag.
pub const RECORD_SIZE: usize = 2 * WORD;

const SHM_MODE: libc::mode_t = 0o666;

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct LockStat {
    pub readers: usize,
    pub writers: usize,
}

impl LockStat {
    /// `writers` is 0 or 1, and a writer excludes every reader.
    pub fn is_consistent(&self) -> bool {
        match self.writers {
            0 => true,
            1 => self.readers == 0,
            _ => false,
        }
    }
}

impl fmt::Display for LockStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "readers: {}, writers: {}", self.readers, self.writers)
    }
}

/// Bounds-checked window over a mapped byte region.
///
/// Words are copied in and out as native-endian bytes; the region is never
/// reinterpreted as a Rust type.
pub struct RecordView {
    base: *mut u8,
    len: usize,
}

impl RecordView {
    /// # Safety
    /// `base` must point to `len` bytes that stay mapped for the view's lifetime.
    pub unsafe fn new(base: *mut u8, len: usize) -> RecordView {
        RecordView { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn check(&self, offset: usize) -> Result<()> {
        match offset.checked_add(WORD) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(RwLockError::Layout {
                offset,
                len: self.len,
            }),
        }
    }

    pub fn read_word(&self, offset: usize) -> Result<usize> {
        self.check(offset)?;
        let mut bytes = [0u8; WORD];
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), bytes.as_mut_ptr(), WORD);
        }
        Ok(usize::from_ne_bytes(bytes))
    }

    pub fn write_word(&mut self, offset: usize, value: usize) -> Result<()> {
        self.check(offset)?;
        let bytes = value.to_ne_bytes();
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), WORD);
        }
        Ok(())
    }

    pub fn zero(&mut self) {
        unsafe { ptr::write_bytes(self.base, 0, self.len) };
    }
}

/// The reader/writer counters, mapped from a named shared memory segment.
///
/// Every accessor takes the mutex guard of the same lock as a capability:
/// the counters are only touched while the named mutex is held.
pub struct SharedState {
    view: RecordView,
    name: IpcName,
    unlink_on_drop: bool,
}

// The mapping is process-wide and every access is serialized by the named mutex.
unsafe impl Send for SharedState {}

struct Fd(libc::c_int);

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

impl SharedState {
    /// Opens or creates the segment. A segment of unexpected size is resized
    /// and zeroed, which is why the caller must hold the named mutex.
    pub fn open(
        name: &IpcName,
        _guard: &NamedMutexGuard<'_>,
        unlink_on_drop: bool,
    ) -> Result<(SharedState, bool)> {
        let c_name = name.as_c_str();
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, SHM_MODE) };
        if fd == -1 {
            return Err(RwLockError::last_os_error("shm_open", name.as_str()));
        }
        let fd = Fd(fd);

        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd.0, &mut st) } == -1 {
            return Err(RwLockError::last_os_error("fstat", name.as_str()));
        }
        let need_init = st.st_size != RECORD_SIZE as libc::off_t;
        if need_init {
            if st.st_size != 0 {
                warn!(
                    name = name.as_str(),
                    size = st.st_size as i64,
                    "shared segment has unexpected size, reinitializing"
                );
            }
            if unsafe { libc::ftruncate(fd.0, RECORD_SIZE as libc::off_t) } == -1 {
                return Err(RwLockError::last_os_error("ftruncate", name.as_str()));
            }
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                RECORD_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.0,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(RwLockError::last_os_error("mmap", name.as_str()));
        }
        drop(fd);

        let mut view = unsafe { RecordView::new(addr as *mut u8, RECORD_SIZE) };
        if need_init {
            view.zero();
            debug!(name = name.as_str(), "initialized shared lock state");
        }
        Ok((
            SharedState {
                view,
                name: name.clone(),
                unlink_on_drop,
            },
            need_init,
        ))
    }

    pub fn readers(&self, _guard: &NamedMutexGuard<'_>) -> Result<usize> {
        self.view.read_word(READERS_OFFSET)
    }

    pub fn writers(&self, _guard: &NamedMutexGuard<'_>) -> Result<usize> {
        self.view.read_word(WRITERS_OFFSET)
    }

    pub fn set_readers(&mut self, _guard: &NamedMutexGuard<'_>, v: usize) -> Result<()> {
        self.view.write_word(READERS_OFFSET, v)
    }

    pub fn set_writers(&mut self, _guard: &NamedMutexGuard<'_>, v: usize) -> Result<()> {
        self.view.write_word(WRITERS_OFFSET, v)
    }

    pub fn snapshot(&self, guard: &NamedMutexGuard<'_>) -> Result<LockStat> {
        Ok(LockStat {
            readers: self.readers(guard)?,
            writers: self.writers(guard)?,
        })
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.view.base as *mut libc::c_void, self.view.len) } == -1 {
            warn!("{}", RwLockError::last_os_error("munmap", self.name.as_str()));
        }
        if self.unlink_on_drop {
            if let Err(e) = unlink(&self.name) {
                warn!("{}", e);
            }
        }
    }
}

pub(crate) fn unlink(name: &IpcName) -> Result<()> {
    if unsafe { libc::shm_unlink(name.as_c_str().as_ptr()) } == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::NotFound {
            return Err(RwLockError::Ipc {
                op: "shm_unlink",
                name: name.to_string(),
                source: err,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_is_bounds_checked() -> Result<()> {
        let mut buf = [0u8; RECORD_SIZE];
        let mut view = unsafe { RecordView::new(buf.as_mut_ptr(), buf.len()) };
        assert_eq!(view.len(), RECORD_SIZE);
        view.write_word(READERS_OFFSET, 3)?;
        view.write_word(WRITERS_OFFSET, 1)?;
        assert_eq!(view.read_word(READERS_OFFSET)?, 3);
        assert_eq!(view.read_word(WRITERS_OFFSET)?, 1);

        match view.read_word(WRITERS_OFFSET + 1) {
            Err(RwLockError::Layout { offset, len }) => {
                assert_eq!(offset, WRITERS_OFFSET + 1);
                assert_eq!(len, RECORD_SIZE);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(view.write_word(usize::MAX, 0).is_err());

        view.zero();
        assert_eq!(view.read_word(READERS_OFFSET)?, 0);
        Ok(())
    }

    #[test]
    fn layout_is_two_native_words() {
        assert_eq!(RECORD_SIZE, 2 * mem::size_of::<usize>());
        assert_eq!(WRITERS_OFFSET, READERS_OFFSET + WORD);
    }

    #[test]
    fn stat_consistency() {
        assert!(LockStat { readers: 0, writers: 0 }.is_consistent());
        assert!(LockStat { readers: 7, writers: 0 }.is_consistent());
        assert!(LockStat { readers: 0, writers: 1 }.is_consistent());
        assert!(!LockStat { readers: 1, writers: 1 }.is_consistent());
        assert!(!LockStat { readers: 0, writers: 2 }.is_consistent());
        assert_eq!(
            LockStat { readers: 1, writers: 0 }.to_string(),
            "readers: 1, writers: 0"
        );
    }
}
