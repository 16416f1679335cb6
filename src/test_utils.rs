use std::sync::{Mutex, MutexGuard, OnceLock};

/// Serialises tests that mutate process environment variables, since
/// `load_config` expands `${VAR}` references from the live environment.
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
