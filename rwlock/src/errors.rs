use std::time::Duration;
use std::{fmt, io};

use super::state::LockStat;

#[derive(Debug)]
pub enum RwLockError {
    Ipc {
        op: &'static str,
        name: String,
        source: io::Error,
    },
    InvalidName(String),
    Inconsistent {
        op: &'static str,
        stat: LockStat,
    },
    Layout {
        offset: usize,
        len: usize,
    },
    Timeout {
        op: &'static str,
        waited: Duration,
    },
    Interrupted {
        op: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, RwLockError>;

impl RwLockError {
    /// Captures `errno` right after a failed libc call.
    pub(crate) fn last_os_error(op: &'static str, name: &str) -> RwLockError {
        RwLockError::Ipc {
            op,
            name: name.to_string(),
            source: io::Error::last_os_error(),
        }
    }

    /// True for a rejected release; the shared counters were left untouched.
    pub fn is_inconsistent(&self) -> bool {
        matches!(self, RwLockError::Inconsistent { .. })
    }
}

impl fmt::Display for RwLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RwLockError::Ipc { op, name, source } => {
                write!(f, "IPC error: {} failed for {}: {}", op, name, source)
            }
            RwLockError::InvalidName(s) => write!(f, "Invalid lock name: {:?}", s),
            RwLockError::Inconsistent { op, stat } => {
                write!(f, "Inconsistent lock state for {} ({})", op, stat)
            }
            RwLockError::Layout { offset, len } => write!(
                f,
                "Shared record access out of bounds: offset {} in {} bytes",
                offset, len
            ),
            RwLockError::Timeout { op, waited } => {
                write!(f, "{} timed out after {:?}", op, waited)
            }
            RwLockError::Interrupted { op } => write!(f, "{} interrupted by signal", op),
        }
    }
}

impl std::error::Error for RwLockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RwLockError::Ipc { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::ffi::NulError> for RwLockError {
    fn from(err: std::ffi::NulError) -> Self {
        RwLockError::InvalidName(format!("contains NUL at byte {}", err.nul_position()))
    }
}
