//! testgrid - test execution engine
//!
//! Tests are grouped into suites and fail-fast lists, share fixtures that are
//! built at most once, and can be spread over a pool of workers connected to
//! a coordinator over TCP.

pub mod cli;
pub mod config;
pub mod distributed;
pub mod executor;
pub mod fixture;
pub mod hierarchy;
pub mod loader;
pub mod models;
pub mod results;
pub mod utils;

pub use executor::{Runner, TestContext};
pub use fixture::{Resource, ResourceManager, ResourceSpec, Scope};
pub use hierarchy::{Collector, TestCase, TestList, TestSuite, TestTree};
pub use models::{Outcome, RunSummary, TestResult, TestStatus};
