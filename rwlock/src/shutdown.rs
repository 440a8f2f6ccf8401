use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::debug;

static CLOSING: OnceCell<Arc<AtomicBool>> = OnceCell::new();

/// Flag raised by SIGHUP, SIGINT, SIGQUIT or SIGTERM.
///
/// The handlers are installed on first call and replace the default action,
/// so the process is no longer killed by these signals. Waiting code must
/// poll the flag (see `NamedRwLock::with_cancel`); the named mutex is then
/// always released before the process exits.
pub fn flag() -> io::Result<Arc<AtomicBool>> {
    CLOSING
        .get_or_try_init(|| {
            let closing = Arc::new(AtomicBool::new(false));
            for sig in &[SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
                signal_hook::flag::register(*sig, Arc::clone(&closing))?;
            }
            debug!("termination signal handlers installed");
            Ok(closing)
        })
        .map(Arc::clone)
}
