//! Process-level knobs read from the environment.

use std::time::Duration;

pub const DEFAULT_SCHEMA: &str = "apiflow";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Schema holding the _sys_* tables.
    pub schema: String,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    /// Source environment filter for record loading.
    pub env: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            schema: DEFAULT_SCHEMA.into(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            env: None,
        }
    }
}

impl RuntimeConfig {
    /// Read `APIFLOW_*` variables, loading a `.env` file first when present.
    /// Unparseable numbers fall back to defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let defaults = RuntimeConfig::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        RuntimeConfig {
            schema: non_empty("APIFLOW_SCHEMA").unwrap_or(defaults.schema),
            request_timeout: non_empty("APIFLOW_REQUEST_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            max_body_bytes: non_empty("APIFLOW_MAX_BODY_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_body_bytes),
            env: non_empty("APIFLOW_ENV"),
        }
    }
}
