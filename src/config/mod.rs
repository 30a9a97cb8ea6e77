//! Configuration module
//!
//! Handles loading and merging run configuration. Precedence is CLI flag,
//! then environment, then config file, then defaults.

mod credentials;
pub mod env;
mod file;

pub use credentials::{Credentials, CredentialsError};
pub use env::EnvConfig;
pub use file::{expand_path, find_config_file, CONFIG_LOCATIONS};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory for captured output and `results.json`
    pub result_path: Option<PathBuf>,

    /// Worker threads (`-j`)
    pub threads: usize,

    /// Abort the run on the first failure
    pub fail_fast: bool,

    /// Treat `build_once` fixtures as already built
    pub skip_build: bool,

    /// Log verbosity, as the number of `-v` flags
    pub verbosity: u8,

    /// Credential file for distributed runs
    pub credentials: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            result_path: None,
            threads: 1,
            fail_fast: false,
            skip_build: false,
            verbosity: 0,
            credentials: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if file::is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from the first standard location that exists.
    pub fn load_default(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(find_config_file) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }
        Ok(())
    }

    /// Apply environment overrides
    pub fn merge_env(&mut self, env: &EnvConfig) {
        if let Some(path) = &env.result_path {
            self.result_path = Some(path.clone());
        }
        if let Some(threads) = env.threads {
            self.threads = threads;
        }
        if let Some(fail_fast) = env.fail_fast {
            self.fail_fast = fail_fast;
        }
        if let Some(skip_build) = env.skip_build {
            self.skip_build = skip_build;
        }
        if let Some(path) = &env.credentials {
            self.credentials = Some(path.clone());
        }
    }
}
