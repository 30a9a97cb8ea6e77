//! Test execution engine
//!
//! Sequential engine shared by local runs and distributed workers.

mod context;
mod runner;

pub use context::{output_dir_for, OutputCapture, TestContext};
pub use runner::{Flow, RunOptions, Runner};
