//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;
use std::path::PathBuf;

/// Environment variable prefix
const ENV_PREFIX: &str = "TESTGRID";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// From TESTGRID_RESULT_PATH
    pub result_path: Option<PathBuf>,
    /// From TESTGRID_THREADS
    pub threads: Option<usize>,
    /// From TESTGRID_FAIL_FAST
    pub fail_fast: Option<bool>,
    /// From TESTGRID_SKIP_BUILD
    pub skip_build: Option<bool>,
    /// From TESTGRID_CREDENTIALS
    pub credentials: Option<PathBuf>,
    /// Config file from TESTGRID_CONFIG
    pub config_file: Option<PathBuf>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            result_path: get_env("RESULT_PATH").map(PathBuf::from),
            threads: get_env_parse("THREADS"),
            fail_fast: get_env_bool("FAIL_FAST"),
            skip_build: get_env_bool("SKIP_BUILD"),
            credentials: get_env("CREDENTIALS").map(PathBuf::from),
            config_file: get_env("CONFIG").map(PathBuf::from),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.result_path.is_some()
            || self.threads.is_some()
            || self.fail_fast.is_some()
            || self.skip_build.is_some()
            || self.credentials.is_some()
            || self.config_file.is_some()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}
