//! Process-wide once-init state and the invariant/assertion policy.
//!
//! A 3-state atomic once-initializer (`NotDone`, `InProgress`,
//! `Complete`) with a yield on `InProgress`, used both to parse the
//! `UDS_*` environment variables lazily and, generically, by anything
//! else in the crate that wants exactly-once setup without pulling in
//! a second once-init primitive.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

const NOT_DONE: u8 = 0;
const IN_PROGRESS: u8 = 1;
const COMPLETE: u8 = 2;

pub struct OnceInit<T> {
    state: AtomicU8,
    slot: Mutex<Option<T>>,
}

impl<T: Clone> OnceInit<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(NOT_DONE),
            slot: Mutex::new(None),
        }
    }

    /// Runs `init` exactly once across all callers, regardless of how many
    /// threads race to call `get_or_init` first. Racing threads spin
    /// (yielding) until the winner publishes the value.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> T {
        loop {
            match self
                .state
                .compare_exchange(NOT_DONE, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let value = init();
                    *self.slot.lock().unwrap() = Some(value.clone());
                    self.state.store(COMPLETE, Ordering::Release);
                    return value;
                }
                Err(IN_PROGRESS) => {
                    std::thread::yield_now();
                }
                Err(_complete) => {
                    // Another thread may still be copying the value into
                    // the slot between the CAS above and the lock below;
                    // the mutex closes that window.
                    if let Some(v) = self.slot.lock().unwrap().clone() {
                        return v;
                    }
                    std::thread::yield_now();
                }
            }
        }
    }
}

/// The subset of `UDS_*` environment variables that affect this
/// crate's own behavior. The others (`UDS_LOGFILE`, `UDS_LOG_LEVEL`,
/// ...) are read here too so a single env parse pays for all of them,
/// but only `exit_on_assertion_failure` changes what this crate does —
/// the rest exist for the out-of-scope syslog collaborator to read
/// back.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    pub timestamps: bool,
    pub ids: bool,
    pub exit_on_assertion_failure: bool,
}

impl LogConfig {
    fn from_env() -> Self {
        let flag_enabled = |name: &str| {
            std::env::var(name)
                .map(|v| v != "0")
                .unwrap_or(true)
        };
        Self {
            timestamps: flag_enabled("UDS_LOG_TIMESTAMPS"),
            ids: flag_enabled("UDS_LOG_IDS"),
            exit_on_assertion_failure: std::env::var("UDS_EXIT_ON_ASSERTION_FAILURE")
                .map(|v| v == "true")
                .unwrap_or(false),
        }
    }
}

static LOG_CONFIG: OnceInit<LogConfig> = OnceInit::new();

pub fn log_config() -> LogConfig {
    LOG_CONFIG.get_or_init(LogConfig::from_env)
}

/// Builds an `Error::AssertionFailed`, logging a backtrace first. If
/// `UDS_EXIT_ON_ASSERTION_FAILURE=true`, aborts the process instead of
/// returning.
#[track_caller]
pub fn assertion_failed(message: impl Into<String>) -> crate::error::Error {
    let message = message.into();
    let location = std::panic::Location::caller();
    log::error!(
        "assertion failed at {location}: {message}\n{:?}",
        std::backtrace::Backtrace::force_capture()
    );
    if log_config().exit_on_assertion_failure {
        std::process::abort();
    }
    crate::error::Error::AssertionFailed(message)
}

/// Returns `Err(AssertionFailed)` (or aborts) unless `cond` holds.
macro_rules! ensure_invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::assertions::assertion_failed(format!($($arg)*)));
        }
    };
}

pub(crate) use ensure_invariant;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn once_init_runs_exactly_once() {
        let once: Arc<OnceInit<u32>> = Arc::new(OnceInit::new());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let once = Arc::clone(&once);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    once.get_or_init(|| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        42
                    })
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
