//! Harness timeouts.
//!
//! Values come from the defaults, optionally a JSON file, then the
//! `CALLBACK_HARNESS_*_MS` environment variables (a `.env` file is honoured).
//! They bound the `*_default` waits and the [`OutputMonitor`] marker
//! handshake.
//!
//! [`OutputMonitor`]: crate::marker::OutputMonitor

use std::env;
use std::path::Path;
use std::time::Duration;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

pub const CALLBACK_TIMEOUT_ENV: &str = "CALLBACK_HARNESS_CALLBACK_TIMEOUT_MS";
pub const MARKER_TIMEOUT_ENV: &str = "CALLBACK_HARNESS_MARKER_TIMEOUT_MS";
pub const SHUTDOWN_TIMEOUT_ENV: &str = "CALLBACK_HARNESS_SHUTDOWN_TIMEOUT_MS";

/// Harness timeouts, loaded from defaults, an optional JSON file and the environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Default deadline for `block_for_done` style waits
    pub callback_timeout_ms: u64,
    /// Deadline for the start and end marker handshakes
    pub marker_timeout_ms: u64,
    /// Deadline for executor worker shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            callback_timeout_ms: 5_000,
            marker_timeout_ms: 10_000,
            shutdown_timeout_ms: 2_000,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::default().with_env_overrides()
    }

    /// Load configuration from a JSON file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| HarnessError::Config {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| HarnessError::Config {
            message: format!("{} is not valid harness config: {}", path.display(), e),
        })?;
        config.with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(ms) = env_millis(CALLBACK_TIMEOUT_ENV)? {
            self.callback_timeout_ms = ms;
        }
        if let Some(ms) = env_millis(MARKER_TIMEOUT_ENV)? {
            self.marker_timeout_ms = ms;
        }
        if let Some(ms) = env_millis(SHUTDOWN_TIMEOUT_ENV)? {
            self.shutdown_timeout_ms = ms;
        }
        Ok(self)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn marker_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn env_millis(key: &str) -> Result<Option<u64>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| HarnessError::Config {
                message: format!("{key} must be a number of milliseconds, got {value:?}"),
            }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(HarnessError::Config {
            message: format!("{key} is not valid unicode"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoped::ScopedEnvVar;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.callback_timeout(), Duration::from_secs(5));
        assert_eq!(config.marker_timeout(), Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(2));
    }

    // Every test that touches the override variables lives here so parallel
    // tests never observe each other's values.
    #[test]
    fn test_env_and_file_sources() {
        let _callback = ScopedEnvVar::set(CALLBACK_TIMEOUT_ENV, "250");
        let _marker = ScopedEnvVar::remove(MARKER_TIMEOUT_ENV);
        let _shutdown = ScopedEnvVar::remove(SHUTDOWN_TIMEOUT_ENV);

        let config = HarnessConfig::from_env().unwrap();
        assert_eq!(config.callback_timeout_ms, 250);
        assert_eq!(config.marker_timeout_ms, 10_000);

        // File values sit under the environment
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"callback_timeout_ms": 1, "marker_timeout_ms": 42}}"#).unwrap();
        let config = HarnessConfig::load(file.path()).unwrap();
        assert_eq!(config.callback_timeout_ms, 250);
        assert_eq!(config.marker_timeout_ms, 42);
        assert_eq!(config.shutdown_timeout_ms, 2_000);

        {
            let _bad = ScopedEnvVar::set(SHUTDOWN_TIMEOUT_ENV, "soon");
            match HarnessConfig::from_env() {
                Err(HarnessError::Config { message }) => assert!(message.contains("soon")),
                other => panic!("Expected Config error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            HarnessConfig::load(file.path()),
            Err(HarnessError::Config { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            HarnessConfig::load("/nonexistent/harness.json"),
            Err(HarnessError::Config { .. })
        ));
    }
}
