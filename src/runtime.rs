//! Runtime paths for state and logs.
#[cfg(test)]
use std::path::Path;
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

use crate::constants::STATE_DIR_SUFFIX;

#[derive(Debug, Clone)]
struct RuntimeContext {
    state_dir: PathBuf,
    log_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::user_directories()))
}

impl RuntimeContext {
    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        let state_dir = home.join(STATE_DIR_SUFFIX);
        let log_dir = state_dir.join("logs");
        Self { state_dir, log_dir }
    }
}

/// Re-reads `$HOME`. Called after the environment changes (tests, daemonizing).
pub fn init() {
    let mut guard = context_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = RuntimeContext::user_directories();
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = RuntimeContext::from_user_home(home.to_path_buf());
}

/// State dir (PID file, control socket).
pub fn state_dir() -> PathBuf {
    context_lock()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .state_dir
        .clone()
}

/// Default directory for instance and supervisor logs.
pub fn log_dir() -> PathBuf {
    context_lock()
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .log_dir
        .clone()
}
