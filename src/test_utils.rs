//! Helpers shared by unit and integration tests.
use std::sync::{Mutex, MutexGuard};

static HOME_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that repoint `$HOME`, and with it the runtime directories.
pub fn home_lock() -> MutexGuard<'static, ()> {
    HOME_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
