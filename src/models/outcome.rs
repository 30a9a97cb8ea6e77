//! Test outcome and result models
//!
//! Defines the outcome of a test body, result status and run summaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Outcome returned by a test body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail(String),
    Skip(String),
    Error(String),
}

impl Outcome {
    pub fn fail(message: impl Into<String>) -> Self {
        Outcome::Fail(message.into())
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Outcome::Skip(reason.into())
    }

    pub fn status(&self) -> TestStatus {
        match self {
            Outcome::Pass => TestStatus::Pass,
            Outcome::Fail(_) => TestStatus::Fail,
            Outcome::Skip(_) => TestStatus::Skip,
            Outcome::Error(_) => TestStatus::Error,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Outcome::Pass => None,
            Outcome::Fail(d) | Outcome::Skip(d) | Outcome::Error(d) => Some(d.as_str()),
        }
    }
}

impl<E: fmt::Display> From<Result<(), E>> for Outcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Outcome::Pass,
            Err(e) => Outcome::Fail(e.to_string()),
        }
    }
}

/// Test execution status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
    Error,
}

impl TestStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestStatus::Pass => "✓",
            TestStatus::Fail => "✗",
            TestStatus::Skip => "○",
            TestStatus::Error => "!",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TestStatus::Pass)
    }

    /// Outcomes that trigger fail-fast handling
    pub fn is_failure(&self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Error)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Pass => write!(f, "PASS"),
            TestStatus::Fail => write!(f, "FAIL"),
            TestStatus::Skip => write!(f, "SKIP"),
            TestStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Combine outcomes of a group: ERROR beats FAIL, FAIL beats SKIP, and a
/// group is PASS only if everything in it passed.
pub fn aggregate(statuses: impl IntoIterator<Item = TestStatus>) -> TestStatus {
    let mut any_fail = false;
    let mut any_other = false;

    for status in statuses {
        match status {
            TestStatus::Error => return TestStatus::Error,
            TestStatus::Fail => any_fail = true,
            TestStatus::Skip => any_other = true,
            TestStatus::Pass => {}
        }
    }

    if any_fail {
        TestStatus::Fail
    } else if any_other {
        TestStatus::Skip
    } else {
        TestStatus::Pass
    }
}

/// Files holding a test's captured output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRefs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Result of a single test execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub uid: String,
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputRefs>,
}

impl TestResult {
    pub fn pass(uid: impl Into<String>, name: impl Into<String>, duration_ms: u64) -> Self {
        Self::from_outcome(uid, name, Outcome::Pass, duration_ms)
    }

    pub fn fail(
        uid: impl Into<String>,
        name: impl Into<String>,
        duration_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::from_outcome(uid, name, Outcome::Fail(message.into()), duration_ms)
    }

    pub fn skip(uid: impl Into<String>, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::from_outcome(uid, name, Outcome::Skip(reason.into()), 0)
    }

    pub fn error(uid: impl Into<String>, name: impl Into<String>, error: impl Into<String>) -> Self {
        Self::from_outcome(uid, name, Outcome::Error(error.into()), 0)
    }

    pub fn from_outcome(
        uid: impl Into<String>,
        name: impl Into<String>,
        outcome: Outcome,
        duration_ms: u64,
    ) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            status: outcome.status(),
            duration_ms,
            message: outcome.detail().map(str::to_string),
            output: None,
        }
    }

    pub fn with_output(mut self, output: OutputRefs) -> Self {
        self.output = Some(output);
        self
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms]",
            self.status.symbol(),
            self.uid,
            self.duration_ms
        )?;
        if let Some(msg) = &self.message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

/// Summary of a run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub total_duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl RunSummary {
    pub fn new(results: Vec<TestResult>) -> Self {
        let count = |status: TestStatus| results.iter().filter(|r| r.status == status).count();

        Self {
            total: results.len(),
            passed: count(TestStatus::Pass),
            failed: count(TestStatus::Fail),
            skipped: count(TestStatus::Skip),
            errors: count(TestStatus::Error),
            total_duration_ms: results.iter().map(|r| r.duration_ms).sum(),
            results,
        }
    }

    /// Pass rate over executed (non-skipped) cases
    pub fn pass_rate(&self) -> f64 {
        let executed = self.total - self.skipped;
        if executed == 0 {
            0.0
        } else {
            (self.passed as f64 / executed as f64) * 100.0
        }
    }

    /// True iff every executed case passed
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }

    pub fn outcome(&self) -> TestStatus {
        aggregate(self.results.iter().map(|r| r.status))
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Total: {} | Pass: {} | Fail: {} | Skip: {} | Error: {}",
            self.total, self.passed, self.failed, self.skipped, self.errors
        )?;
        writeln!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms",
            self.pass_rate(),
            self.total_duration_ms
        )
    }
}
