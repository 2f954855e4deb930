//! Scoped mutation of process-global state.
//!
//! [`ScopedEnvVar`] applies an environment variable for the lifetime of the
//! guard and restores the prior value on every exit path, including unwinding.
//! Before restoring it checks that nobody else changed the variable in the
//! meantime; tampering is fatal.

use std::env;
use std::ffi::OsString;
use std::thread;

use tracing::{debug, error};

/// Restores an environment variable when dropped.
#[must_use = "the variable is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ScopedEnvVar {
    key: String,
    previous: Option<OsString>,
    applied: Option<OsString>,
}

impl ScopedEnvVar {
    /// Set `key` to `value` until the guard drops.
    pub fn set(key: impl Into<String>, value: impl Into<OsString>) -> Self {
        let key = key.into();
        let value = value.into();
        let previous = env::var_os(&key);
        env::set_var(&key, &value);
        debug!(key = %key, "scoped env var set");
        Self {
            key,
            previous,
            applied: Some(value),
        }
    }

    /// Unset `key` until the guard drops.
    pub fn remove(key: impl Into<String>) -> Self {
        let key = key.into();
        let previous = env::var_os(&key);
        env::remove_var(&key);
        Self {
            key,
            previous,
            applied: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value that was in place before this guard.
    pub fn previous(&self) -> Option<&OsString> {
        self.previous.as_ref()
    }
}

impl Drop for ScopedEnvVar {
    fn drop(&mut self) {
        let observed = env::var_os(&self.key);

        match &self.previous {
            Some(prev) => env::set_var(&self.key, prev),
            None => env::remove_var(&self.key),
        }

        if observed != self.applied {
            let message = format!(
                "{} was modified during its scope: expected {:?}, found {:?}",
                self.key, self.applied, observed
            );
            if thread::panicking() {
                // A second panic would abort the process
                error!(key = %self.key, "{}", message);
            } else {
                panic!("{message}");
            }
        }
    }
}
