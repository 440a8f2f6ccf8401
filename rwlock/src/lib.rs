mod core;
mod errors;
mod lock;
mod mutex;
mod state;
pub mod shutdown;
#[cfg(test)]
mod tests;

pub use crate::core::{IpcName, RwLockConfig, RwLockConfigBuilder, DEFAULT_POLL_INTERVAL_MS, MAX_NAME_LEN};
pub use crate::errors::{Result, RwLockError};
pub use crate::lock::{remove, NamedRwLock};
pub use crate::mutex::{NamedMutex, NamedMutexGuard};
pub use crate::state::{LockStat, SharedState, RECORD_SIZE};
