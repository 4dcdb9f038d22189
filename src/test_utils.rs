use std::{
    env,
    ffi::OsString,
    sync::{Mutex, MutexGuard, OnceLock},
};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serialises tests that touch process-wide environment variables such as
/// `WEBSTACK_HOME`.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sets a variable for the lifetime of the guard and restores the previous
/// value on drop. Holds the environment lock the whole time.
pub struct ScopedVar {
    name: &'static str,
    previous: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl ScopedVar {
    pub fn set(name: &'static str, value: &str) -> Self {
        let lock = env_lock();
        let previous = env::var_os(name);
        unsafe {
            env::set_var(name, value);
        }
        Self {
            name,
            previous,
            _lock: lock,
        }
    }
}

impl Drop for ScopedVar {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => unsafe { env::set_var(self.name, value) },
            None => unsafe { env::remove_var(self.name) },
        }
    }
}
