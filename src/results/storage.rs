//! Results storage and retrieval
//!
//! A run's results are written as JSON to `<result_path>/results.json`; a
//! later `rerun` reads the file back to select what failed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use super::ResultSink;
use crate::models::{RunSummary, TestResult};

/// Name of the result file inside the result path
pub const RESULTS_FILE: &str = "results.json";

/// Stored test run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRun {
    /// Unique run ID
    pub id: String,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    pub summary: RunSummary,

    pub environment: EnvironmentInfo,
}

/// Environment information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os: String,
    pub arch: String,
    pub hostname: Option<String>,
    pub tool_version: String,
}

impl Default for EnvironmentInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: std::env::var("HOSTNAME").ok(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl StoredRun {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: generate_run_id(),
            started_at: now,
            completed_at: now,
            summary: RunSummary::default(),
            environment: EnvironmentInfo::default(),
        }
    }

    /// Uids of cases that failed or errored
    pub fn failed_uids(&self) -> Vec<String> {
        self.summary
            .results
            .iter()
            .filter(|r| r.status.is_failure())
            .map(|r| r.uid.clone())
            .collect()
    }
}

impl Default for StoredRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate unique run ID
fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let random: u32 = rand::random::<u32>() % 10000;
    format!("{timestamp}_{random:04}")
}

/// Results storage manager
#[derive(Clone, Debug)]
pub struct ResultsStorage {
    base_dir: PathBuf,
}

impl ResultsStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.base_dir.join(RESULTS_FILE)
    }

    /// Save a run, replacing the previous one
    pub fn save(&self, run: &StoredRun) -> Result<PathBuf> {
        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!("Failed to create result path {}", self.base_dir.display())
        })?;

        let path = self.path();
        let file = File::create(&path).context("Failed to create results file")?;
        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, run).context("Failed to write results")?;

        info!("Saved test results to {}", path.display());
        Ok(path)
    }

    pub fn load(&self) -> Result<StoredRun> {
        let path = self.path();
        let run = Self::load_from_path(&path)?;
        debug!("Loaded test results from {}", path.display());
        Ok(run)
    }

    pub fn load_from_path(path: &Path) -> Result<StoredRun> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open results file {}", path.display()))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).context("Failed to parse results")
    }
}

/// Sink writing the run's results to storage when the run ends
pub struct StorageSink {
    storage: ResultsStorage,
    run: StoredRun,
}

impl StorageSink {
    pub fn new(storage: ResultsStorage) -> Self {
        Self {
            storage,
            run: StoredRun::new(),
        }
    }
}

impl ResultSink for StorageSink {
    fn on_run_start(&mut self) {
        self.run = StoredRun::new();
    }

    fn on_result(&mut self, result: &TestResult) {
        self.run.summary.results.push(result.clone());
    }

    fn on_run_end(&mut self, _summary: &RunSummary) {
        // Rebuilt from received events so remote completions are included.
        let results = std::mem::take(&mut self.run.summary.results);
        self.run.summary = RunSummary::new(results);
        self.run.completed_at = Utc::now();

        if let Err(e) = self.storage.save(&self.run) {
            error!("Failed to store results: {:#}", e);
        }
    }
}
