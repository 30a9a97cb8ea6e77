//! Data models for test execution
//!
//! Outcomes produced by test bodies and the result records built from them.

mod outcome;

pub use outcome::{aggregate, Outcome, OutputRefs, RunSummary, TestResult, TestStatus};
