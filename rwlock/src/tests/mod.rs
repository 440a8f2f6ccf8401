use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{remove, NamedRwLock, Result, RwLockConfig};


/// A per-test lock name, removed from the system when dropped.
pub(crate) struct TestName(pub String);

impl TestName {
    pub(crate) fn new(tag: &str) -> TestName {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let name = format!(
            "named-rwlock-{}-{}-{}",
            tag,
            process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let _ = remove(&name);
        TestName(name)
    }

    pub(crate) fn open(&self) -> Result<NamedRwLock> {
        NamedRwLock::open(&self.0, &fast_config())
    }
}

impl Drop for TestName {
    fn drop(&mut self) {
        let _ = remove(&self.0);
    }
}

pub(crate) fn fast_config() -> RwLockConfig {
    RwLockConfig::builder().poll_interval_ms(5).build()
}
